use std::sync::atomic::Ordering;

use dxram_types::NodeId;
use rand::seq::SliceRandom;
use scopeguard::defer;
use tracing::{debug, error, info, warn};

use super::{lock, LookupComponent};
use crate::{
    event::OverlayEvent,
    message::{LookupMessage, PromotionState},
    range::{is_node_in_range, Interval},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted,
    /// The peer did not take over; it may have failed.
    Failed,
    /// No peer is left to replace the promoted one.
    NoReplacement,
    /// Another promotion of this superpeer is in progress.
    Busy,
}

impl LookupComponent {
    /// Refills the ring after `failed` left it, promoting the peer closest
    /// below `failed` or delegating the promotion if no peer can be spared.
    pub(super) fn promote_one_peer(&self, failed: NodeId) {
        self.events.fire(OverlayEvent::PromotionStarted { failed });
        for _ in 0..self.retry.max_retries {
            let candidate = {
                let overlay = lock(&self.overlay);
                let peers = overlay.peers();
                peers
                    .iter()
                    .copied()
                    .take_while(|p| *p < failed)
                    .last()
                    .or_else(|| peers.first().copied())
            };
            let Some(candidate) = candidate else {
                break;
            };
            match self.promote(candidate, true) {
                PromotionOutcome::Promoted | PromotionOutcome::Busy => return,
                PromotionOutcome::NoReplacement => break,
                PromotionOutcome::Failed => self.failure_handling(candidate),
            }
        }
        self.delegate_promotion();
    }

    fn delegate_promotion(&self) {
        for _ in 0..self.retry.max_retries {
            let other = lock(&self.overlay)
                .superpeers()
                .choose(&mut rand::thread_rng())
                .copied();
            let Some(other) = other else {
                warn!("0x{:04X} has no peer to promote and nobody to delegate to", self.me);
                return;
            };
            match self.notify(other, LookupMessage::DelegatePromotePeerMessage { hops: 1 }) {
                Ok(()) => {
                    debug!("0x{:04X} delegates a promotion to 0x{other:04X}", self.me);
                    return;
                }
                Err(e) => {
                    warn!("failed to delegate a promotion to 0x{other:04X}: {e}");
                    self.failure_handling(other);
                }
            }
        }
    }

    /// Turns the peer `new` into a superpeer placed right before this one.
    /// With `safe` the peer must confirm and a replacement peer may be
    /// fetched from other superpeers.
    pub fn promote(&self, new: NodeId, safe: bool) -> PromotionOutcome {
        if self
            .promoting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PromotionOutcome::Busy;
        }
        defer! {
            self.promoting.store(false, Ordering::Release);
        }

        let Some(replacement) = self.find_replacement(new, safe) else {
            debug!("0x{:04X} finds no replacement for peer 0x{new:04X}", self.me);
            return PromotionOutcome::NoReplacement;
        };

        let (was_only, predecessor, peers, area, superpeers) = {
            let overlay = lock(&self.overlay);
            let was_only = overlay.is_only_superpeer();
            let predecessor = if was_only {
                self.me
            } else {
                overlay.predecessor().unwrap_or(self.me)
            };
            let peers: Vec<NodeId> = overlay
                .peers()
                .iter()
                .copied()
                .filter(|p| *p != new && is_node_in_range(*p, predecessor, new, Interval::Open))
                .collect();
            (
                was_only,
                predecessor,
                peers,
                overlay.responsible_area(new),
                overlay.superpeers().to_vec(),
            )
        };
        let trees = self.trees_in_range(area.0, area.1, Interval::UpperClosed);
        let mappings = lock(&self.mappings).entries_in_range(area.0, area.1, Interval::UpperClosed);
        let request = LookupMessage::PromotePeerRequest(Box::new(PromotionState {
            predecessor,
            successor: self.me,
            replacement: Some(replacement),
            superpeers,
            peers: peers.clone(),
            trees,
            mappings,
        }));

        let delivered = if safe {
            match self.request(new, request) {
                Ok(LookupMessage::PromotePeerResponse { success }) => success,
                Ok(other) => {
                    warn!("peer 0x{new:04X} answered promotion with {}", other.name());
                    false
                }
                Err(e) => {
                    warn!("failed to promote 0x{new:04X}: {e}");
                    false
                }
            }
        } else {
            self.notify(new, request)
                .map_err(|e| warn!("failed to promote 0x{new:04X}: {e}"))
                .is_ok()
        };
        if !delivered {
            return PromotionOutcome::Failed;
        }

        {
            let mut overlay = lock(&self.overlay);
            for peer in &peers {
                overlay.remove_peer(*peer);
            }
            overlay.remove_peer(new);
            if was_only {
                overlay.set_successor(Some(new));
            }
            overlay.set_predecessor(Some(new));
        }
        if !was_only {
            let notice = LookupMessage::NotifyAboutNewSuccessorMessage { successor: new };
            if let Err(e) = self.notify(predecessor, notice) {
                warn!("failed to tell 0x{predecessor:04X} about promoted 0x{new:04X}: {e}");
            }
        }
        info!(
            "0x{:04X} promoted peer 0x{new:04X}, replacement 0x{replacement:04X}",
            self.me
        );
        self.events.fire(OverlayEvent::PeerPromoted { node: new });
        PromotionOutcome::Promoted
    }

    /// A peer that stays a peer when `new` is promoted, preferably one of
    /// this superpeer's own.
    fn find_replacement(&self, new: NodeId, safe: bool) -> Option<NodeId> {
        let (peers, superpeers) = {
            let overlay = lock(&self.overlay);
            (overlay.peers().to_vec(), overlay.superpeers().to_vec())
        };
        if peers.len() > 1 {
            let others: Vec<NodeId> = peers.into_iter().filter(|p| *p != new).collect();
            return others.choose(&mut rand::thread_rng()).copied();
        }
        if !safe {
            return None;
        }
        for _ in 0..2 * superpeers.len() {
            let Some(&superpeer) = superpeers.choose(&mut rand::thread_rng()) else {
                break;
            };
            match self.request(superpeer, LookupMessage::SearchForPeerRequest) {
                Ok(LookupMessage::SearchForPeerResponse { peer: Some(peer) }) if peer != new => return Some(peer),
                Ok(_) => {}
                Err(e) => debug!("search for peer at 0x{superpeer:04X}: {e}"),
            }
        }
        None
    }

    /// Runs on the peer being promoted: takes the place in the ring described
    /// by `state` and starts stabilizing.
    pub(super) fn on_promote_peer(&self, source: NodeId, state: PromotionState) -> bool {
        info!(
            "peer 0x{:04X} is promoted by 0x{source:04X} with {} peers and {} trees",
            self.me,
            state.peers.len(),
            state.trees.len()
        );
        // Nothing is taken over unless the worker runs. Its rounds do nothing
        // until the overlay below marks this node a superpeer.
        if let Err(e) = self.start_stabilization() {
            error!("0x{:04X} refuses the promotion: {e}", self.me);
            return false;
        }
        self.boot.promote_to_superpeer();
        {
            let mut overlay = lock(&self.overlay);
            overlay.become_superpeer();
            overlay.replace_superpeers(state.superpeers);
            overlay.replace_peers(state.peers);
            overlay.set_successor(Some(state.successor));
            overlay.set_predecessor(Some(state.predecessor));
        }
        {
            let mut trees = lock(&self.trees);
            for mut tree in state.trees {
                if tree.creator() == self.me {
                    tree.set_active(false);
                }
                trees.insert(tree.creator(), tree);
            }
        }
        lock(&self.mappings).put_all(state.mappings);
        true
    }

    /// Another superpeer has no peer to spare: promote one of ours or pass
    /// the request on, at most twice around the ring.
    pub(super) fn on_delegate_promote_peer(&self, hops: u16) {
        let mut tried = Vec::new();
        for _ in 0..self.retry.max_retries {
            let (peers, superpeers) = {
                let overlay = lock(&self.overlay);
                (overlay.peers().to_vec(), overlay.superpeers().to_vec())
            };
            if usize::from(hops) >= 2 * superpeers.len().max(1) {
                warn!("0x{:04X} drops a promotion delegated {hops} times", self.me);
                return;
            }
            if peers.len() > 1 {
                let candidates: Vec<NodeId> = peers.into_iter().filter(|p| !tried.contains(p)).collect();
                let Some(&new) = candidates.choose(&mut rand::thread_rng()) else {
                    return;
                };
                tried.push(new);
                match self.promote(new, false) {
                    PromotionOutcome::Failed => self.failure_handling(new),
                    _ => return,
                }
            } else {
                let Some(&next) = superpeers.choose(&mut rand::thread_rng()) else {
                    return;
                };
                match self.notify(next, LookupMessage::DelegatePromotePeerMessage { hops: hops + 1 }) {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("failed to pass a promotion on to 0x{next:04X}: {e}");
                        self.failure_handling(next);
                    }
                }
            }
        }
    }
}
