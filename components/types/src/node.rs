use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

/// Position of a node on the 16 bit ring.
pub type NodeId = u16;

pub const INVALID_NODE_ID: NodeId = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Superpeer,
    Peer,
    Terminal,
    Monitor,
}

impl NodeRole {
    pub fn is_superpeer(&self) -> bool { matches!(self, NodeRole::Superpeer) }

    /// Terminals and monitors come and go without a persistent registration,
    /// nothing is backed up on them.
    pub fn is_persistent(&self) -> bool { matches!(self, NodeRole::Superpeer | NodeRole::Peer) }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Superpeer => "superpeer",
            NodeRole::Peer => "peer",
            NodeRole::Terminal => "terminal",
            NodeRole::Monitor => "monitor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: SocketAddr,
    pub rack: u16,
    pub switch: u16,
    pub role: NodeRole,
    pub node_id: NodeId,
}

impl NodeEntry {
    pub fn new(node_id: NodeId, address: SocketAddr, role: NodeRole) -> Self {
        Self {
            address,
            rack: 0,
            switch: 0,
            role,
            node_id,
        }
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04X}({}, {}, rack {}, switch {})",
            self.node_id, self.role, self.address, self.rack, self.switch
        )
    }
}
