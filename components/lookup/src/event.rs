use crossbeam_channel::{Receiver, Sender};
use dxram_types::{NodeId, NodeRole};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    NodeFailure { node: NodeId, role: NodeRole },
    /// A superpeer lost its predecessor and looks for a peer to replace it.
    PromotionStarted { failed: NodeId },
    PeerPromoted { node: NodeId },
}

pub trait EventSink: Send + Sync {
    fn fire(&self, event: OverlayEvent);
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn fire(&self, event: OverlayEvent) { debug!(?event, "dropped overlay event"); }
}

/// Forwards events to a channel, for observers on other threads.
pub struct ChannelEventSink {
    tx: Sender<OverlayEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, Receiver<OverlayEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn fire(&self, event: OverlayEvent) {
        // Nobody listening any more is fine.
        let _ = self.tx.send(event);
    }
}
