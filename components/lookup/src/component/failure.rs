use std::{
    collections::VecDeque,
    sync::Mutex,
    thread::{self, ThreadId},
};

use dxram_types::{chunk_id::to_hex_string, NodeId, NodeRole, INVALID_NODE_ID};
use scopeguard::defer;
use tracing::{debug, error, info, warn};

use super::{lock, LookupComponent};
use crate::{
    event::OverlayEvent,
    message::LookupMessage,
    range::{is_node_in_range, Interval},
};

/// Serializes failure handling per node. Reports arriving while another
/// thread handles a failure are queued and handled by that thread; reports
/// from the handling thread itself are handled right away.
#[derive(Debug, Default)]
pub(super) struct FailureGate {
    holder: Mutex<Option<ThreadId>>,
    pending: Mutex<VecDeque<NodeId>>,
    /// Failures currently being handled, innermost last.
    active: Mutex<Vec<NodeId>>,
}

enum Gate {
    Acquired,
    Nested,
    Queued,
}

impl LookupComponent {
    /// Handles the failure of `failed`, detected by this node. Concurrent and
    /// repeated reports of one failure are handled once.
    pub fn failure_handling(&self, failed: NodeId) {
        if failed == self.me || failed == INVALID_NODE_ID {
            return;
        }
        let current = thread::current().id();
        let gate = {
            let mut holder = lock(&self.failures.holder);
            let state = *holder;
            match state {
                Some(thread) if thread == current => Gate::Nested,
                Some(_) => {
                    let mut pending = lock(&self.failures.pending);
                    if !pending.contains(&failed) {
                        pending.push_back(failed);
                    }
                    Gate::Queued
                }
                None => {
                    *holder = Some(current);
                    Gate::Acquired
                }
            }
        };

        match gate {
            Gate::Nested => self.handle_failure(failed),
            Gate::Queued => debug!("0x{:04X} queues failure of 0x{failed:04X}", self.me),
            Gate::Acquired => {
                let release = scopeguard::guard_on_unwind((), |_| {
                    *lock(&self.failures.holder) = None;
                });
                let mut next = Some(failed);
                while let Some(node) = next {
                    self.handle_failure(node);
                    let mut holder = lock(&self.failures.holder);
                    next = lock(&self.failures.pending).pop_front();
                    if next.is_none() {
                        *holder = None;
                    }
                }
                scopeguard::ScopeGuard::into_inner(release);
            }
        }
    }

    fn handle_failure(&self, failed: NodeId) {
        {
            let mut active = lock(&self.failures.active);
            if active.contains(&failed) {
                return;
            }
            active.push(failed);
        }
        defer! {
            lock(&self.failures.active).retain(|n| *n != failed);
        }

        let (is_superpeer, known_superpeer, known_peer) = {
            let overlay = lock(&self.overlay);
            (
                overlay.is_superpeer(),
                overlay.contains_superpeer(failed),
                overlay.contains_peer(failed),
            )
        };
        if !is_superpeer {
            if lock(&self.overlay).remove_superpeer(failed) {
                warn!("peer 0x{:04X} drops unreachable superpeer 0x{failed:04X}", self.me);
            }
        } else if known_superpeer {
            self.superpeer_failed(failed);
        } else if known_peer {
            self.peer_failed(failed);
        } else {
            debug!("0x{:04X} already handled failure of 0x{failed:04X}", self.me);
            self.on_failed_peer(failed);
        }
    }

    fn superpeer_failed(&self, failed: NodeId) {
        warn!("superpeer 0x{:04X} handles failure of superpeer 0x{failed:04X}", self.me);
        self.events.fire(OverlayEvent::NodeFailure { node: failed, role: NodeRole::Superpeer });

        if lock(&self.overlay).bootstrap() == Some(failed) {
            self.elect_new_bootstrap(failed);
        }

        let promote = lock(&self.overlay).predecessor() == Some(failed);
        if promote {
            self.take_over_peers_and_trees(failed);
        }

        let backup_count = self.config.backup_count;
        let (more_than_backups, failed_is_first_in_area, backups) = {
            let overlay = lock(&self.overlay);
            let area = overlay.responsible_area(self.me);
            (
                overlay.superpeers().len() > backup_count,
                overlay.responsible_superpeer(area.0.wrapping_add(1)) == Some(failed),
                overlay.backup_superpeers(self.me),
            )
        };
        if more_than_backups {
            if failed_is_first_in_area {
                self.spread_data_of_failed_superpeer(failed);
            }
            if let (Some(&first), Some(&last)) = (backups.first(), backups.last()) {
                if is_node_in_range(failed, first, last, Interval::Closed) {
                    self.spread_own_backups(failed);
                }
            }
        }

        lock(&self.overlay).remove_superpeer(failed);

        if promote {
            self.promote_one_peer(failed);
        }
        self.boot.report_node_failure(failed, true);
        info!("0x{:04X} after failure of 0x{failed:04X}: {}", self.me, self.overlay_to_string());
    }

    /// The `backup_count + 1`-th superpeer after `node` on the full ring,
    /// this node included. It joins the replica set of `node`'s successor
    /// once a superpeer in between fails.
    fn next_backup_after(&self, node: NodeId) -> Option<NodeId> {
        let all = lock(&self.overlay).all_superpeers();
        let index = all.binary_search(&node).ok()?;
        let next = all[(index + self.config.backup_count + 1) % all.len()];
        (next != node && next != self.me).then_some(next)
    }

    /// This superpeer backs up the failed one; the creators the failed
    /// superpeer was responsible for need a new replica.
    fn spread_data_of_failed_superpeer(&self, failed: NodeId) {
        let Some(target) = self.next_backup_after(failed) else {
            return;
        };
        let start = lock(&self.overlay).responsible_area(self.me).0;
        let trees = self.trees_in_range(start, failed, Interval::Open);
        let mappings = lock(&self.mappings).entries_in_range(start, failed, Interval::UpperClosed);
        debug!(
            "0x{:04X} copies {} trees of failed 0x{failed:04X} to 0x{target:04X}",
            self.me,
            trees.len()
        );
        if let Err(e) = self.notify(target, LookupMessage::SendBackupsMessage { trees, mappings }) {
            warn!("failed to spread data of 0x{failed:04X} to 0x{target:04X}: {e}");
        }
    }

    /// One of this superpeer's backups failed; the next superpeer on the
    /// ring receives a replica instead.
    fn spread_own_backups(&self, failed: NodeId) {
        let Some(target) = self.next_backup_after(self.me) else {
            return;
        };
        if target == failed {
            return;
        }
        let predecessor = lock(&self.overlay).predecessor().unwrap_or(self.me);
        let trees = self.trees_in_range(predecessor, self.me, Interval::Open);
        let mappings = lock(&self.mappings).entries_in_range(predecessor, self.me, Interval::Closed);
        debug!("0x{:04X} replaces backup 0x{failed:04X} by 0x{target:04X}", self.me);
        if let Err(e) = self.notify(target, LookupMessage::SendBackupsMessage { trees, mappings }) {
            warn!("failed to send backups to 0x{target:04X}: {e}");
        }
    }

    fn elect_new_bootstrap(&self, failed: NodeId) {
        for _ in 0..self.retry.max_retries {
            let bootstrap = self.boot.elect_bootstrap(failed);
            lock(&self.overlay).set_bootstrap(bootstrap);
            if bootstrap == self.me {
                info!("0x{:04X} is the new bootstrap", self.me);
                return;
            }
            match self.notify(bootstrap, LookupMessage::PingSuperpeerMessage) {
                Ok(()) => return,
                Err(e) => {
                    warn!("new bootstrap 0x{bootstrap:04X} is unreachable: {e}");
                    self.failure_handling(bootstrap);
                }
            }
        }
    }

    /// Adopts the peers between the superpeer before `node` and `node`,
    /// judged by the active CIDTrees stored here.
    pub(super) fn take_over_peers_and_trees(&self, node: NodeId) {
        let first = {
            let overlay = lock(&self.overlay);
            let superpeers = overlay.superpeers();
            if superpeers.is_empty() {
                self.me.wrapping_add(1)
            } else {
                let index = match superpeers.binary_search(&node) {
                    Ok(i) | Err(i) => i,
                };
                let before = if index == 0 {
                    superpeers[superpeers.len() - 1]
                } else {
                    superpeers[index - 1]
                };
                if before == node {
                    self.me.wrapping_add(1)
                } else {
                    before
                }
            }
        };
        let candidates: Vec<NodeId> = lock(&self.trees)
            .values()
            .filter(|t| t.is_active() && is_node_in_range(t.creator(), first, node, Interval::Closed))
            .map(|t| t.creator())
            .collect();

        let mut overlay = lock(&self.overlay);
        for creator in candidates {
            if creator == self.me || overlay.contains_superpeer(creator) {
                continue;
            }
            if overlay.insert_peer(creator) {
                info!("0x{:04X} takes over peer 0x{creator:04X}", self.me);
            }
        }
    }

    fn peer_failed(&self, failed: NodeId) {
        if !self.boot.node_available(failed) {
            lock(&self.overlay).remove_peer(failed);
            info!("0x{:04X} lost non persistent node 0x{failed:04X}", self.me);
            self.events.fire(OverlayEvent::NodeFailure { node: failed, role: NodeRole::Monitor });
            return;
        }

        warn!("superpeer 0x{:04X} handles failure of peer 0x{failed:04X}", self.me);
        self.events.fire(OverlayEvent::NodeFailure { node: failed, role: NodeRole::Peer });
        self.on_failed_peer(failed);

        let superpeers = lock(&self.overlay).superpeers().to_vec();
        for superpeer in superpeers {
            if let Err(e) = self.notify(superpeer, LookupMessage::NotifyAboutFailedPeerMessage { failed }) {
                warn!("failed to tell 0x{superpeer:04X} about 0x{failed:04X}: {e}");
                self.failure_handling(superpeer);
            }
        }

        let ranges = lock(&self.trees)
            .get(&failed)
            .map(|t| t.all_backup_ranges())
            .unwrap_or_default();
        for range in &ranges {
            let recovered = range
                .backup_peers
                .iter()
                .filter(|p| **p != failed)
                .any(|p| self.recovery.recover(failed, range, *p));
            if !recovered {
                error!(
                    "range {} of 0x{failed:04X} has no backup peer left",
                    to_hex_string(range.range_id)
                );
            }
        }

        lock(&self.overlay).remove_peer(failed);
        self.boot.report_node_failure(failed, false);
    }
}
