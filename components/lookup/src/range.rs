use dxram_types::NodeId;
use serde::{Deserialize, Serialize};

/// Bounds of a ring interval between two node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    /// `[start, end]`
    Closed,
    /// `(start, end]`
    UpperClosed,
    /// `(start, end)`
    Open,
}

/// Checks whether `node` lies between `start` and `end` walking the ring
/// clockwise. When `start >= end` the interval wraps past `0xFFFF`, so
/// `start == end` covers the whole ring (minus `start` itself for `Open`).
pub fn is_node_in_range(node: NodeId, start: NodeId, end: NodeId, interval: Interval) -> bool {
    if start < end {
        match interval {
            Interval::Closed => node >= start && node <= end,
            Interval::UpperClosed => node > start && node <= end,
            Interval::Open => node > start && node < end,
        }
    } else {
        match interval {
            Interval::Closed => node >= start || node <= end,
            Interval::UpperClosed => node > start || node <= end,
            Interval::Open => node > start || node < end,
        }
    }
}
