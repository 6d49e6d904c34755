use std::{
    sync::{atomic::Ordering, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, Sender};
use dxram_types::NodeId;
use snafu::{ensure, ResultExt};
use tracing::{debug, info, trace, warn};

use super::{lock, LookupComponent};
use crate::{
    err::{Result, ShutDownSnafu, SpawnWorkerSnafu},
    message::LookupMessage,
    range::{is_node_in_range, Interval},
};

/// A lone superpeer promotes the peer closest to the opposite side of the
/// ring.
const HALF_RING: NodeId = 0x7FFF;

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct StabilizationState {
    /// Index of the superpeer asked next when fixing the superpeer list.
    next: usize,
    /// Consecutive unstable rounds.
    unstable_rounds: usize,
}

/// Runs [LookupComponent::stabilize_once] every interval until stopped or
/// until the component is gone.
pub(super) struct StabilizationWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StabilizationWorker {
    fn spawn(component: Weak<LookupComponent>, me: NodeId, interval: Duration) -> Result<Self> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("dxram-stabilization-{me:04X}"))
            .spawn(move || {
                debug!("stabilization of 0x{me:04X} every {interval:?}");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(component) = component.upgrade() else {
                                break;
                            };
                            component.stabilize_once();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("stabilization of 0x{me:04X} stopped");
            })
            .context(SpawnWorkerSnafu)?;
        Ok(Self { stop, handle })
    }

    pub(super) fn stop(self) {
        let _ = self.stop.try_send(());
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

impl LookupComponent {
    pub(super) fn start_stabilization(&self) -> Result<()> {
        ensure!(!self.stopped.load(Ordering::Acquire), ShutDownSnafu { node: self.me });
        let mut worker = lock(&self.worker);
        if worker.is_none() {
            *worker = Some(StabilizationWorker::spawn(
                self.this.clone(),
                self.me,
                self.config.stabilization_interval,
            )?);
        }
        Ok(())
    }

    /// One stabilization round of a superpeer: tell the neighbours about
    /// this node, learn about missing superpeers, promote a peer if the ring
    /// stays too small, repair the replicas and tell the peers about the
    /// ring.
    pub fn stabilize_once(&self) {
        if !self.is_superpeer() {
            return;
        }
        trace!("0x{:04X} stabilizes: {}", self.me, self.overlay_to_string());

        self.perform_stabilization();
        let rounds = (lock(&self.overlay).expected_superpeers() / 300).max(1);
        for _ in 0..rounds {
            self.fix_superpeers();
        }
        self.promote_peer_if_necessary();

        if !lock(&self.overlay).is_only_superpeer() {
            self.gather_backups();
            self.delete_unnecessary_backups();
            self.take_over_peers_and_trees(self.me);
        }
        self.ping_peers();
    }

    fn perform_stabilization(&self) {
        for _ in 0..self.retry.max_retries {
            let (predecessor, successor) = {
                let overlay = lock(&self.overlay);
                (overlay.predecessor(), overlay.successor())
            };
            let mut failed = None;
            if let Some(p) = predecessor.filter(|p| *p != self.me) {
                let notice = LookupMessage::NotifyAboutNewSuccessorMessage { successor: self.me };
                if let Err(e) = self.notify(p, notice) {
                    warn!("predecessor 0x{p:04X}: {e}");
                    failed = Some(p);
                }
            }
            if failed.is_none() {
                if let Some(s) = successor.filter(|s| *s != self.me) {
                    let notice = LookupMessage::NotifyAboutNewPredecessorMessage { predecessor: self.me };
                    if let Err(e) = self.notify(s, notice) {
                        warn!("successor 0x{s:04X}: {e}");
                        failed = Some(s);
                    }
                }
            }
            match failed {
                Some(node) => self.failure_handling(node),
                None => return,
            }
        }
    }

    /// Asks one known superpeer about its successor, round robin, and adds
    /// it if it is new.
    fn fix_superpeers(&self) {
        for _ in 0..self.retry.max_retries {
            let contact = {
                let overlay = lock(&self.overlay);
                let superpeers = overlay.superpeers();
                if superpeers.len() < 2 {
                    return;
                }
                let mut state = lock(&self.stabilization);
                state.next %= superpeers.len();
                let contact = superpeers[state.next];
                state.next += 1;
                contact
            };
            match self.request(contact, LookupMessage::AskAboutSuccessorRequest) {
                Ok(LookupMessage::AskAboutSuccessorResponse { successor: Some(s) }) => {
                    if s != self.me && lock(&self.overlay).insert_superpeer(s) {
                        info!("0x{:04X} learned about superpeer 0x{s:04X}", self.me);
                    }
                    return;
                }
                Ok(_) => return,
                Err(e) => {
                    warn!("fix superpeers via 0x{contact:04X}: {e}");
                    self.failure_handling(contact);
                }
            }
        }
    }

    /// Promotes a peer once the ring stayed below its expected size for
    /// long enough. Only the superpeer owning the largest gap of the ring
    /// promotes, a peer from the middle of that gap.
    fn promote_peer_if_necessary(&self) {
        let (stable, expected, all) = {
            let overlay = lock(&self.overlay);
            (overlay.is_stable(), overlay.expected_superpeers(), overlay.all_superpeers())
        };
        if stable {
            lock(&self.stabilization).unstable_rounds = 0;
            return;
        }
        let threshold = self.config.promotion_threshold(expected);
        let due = {
            let mut state = lock(&self.stabilization);
            state.unstable_rounds += 1;
            if state.unstable_rounds >= threshold {
                state.unstable_rounds = 0;
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        if all.len() <= 1 {
            self.promote_one_peer(self.me.wrapping_add(HALF_RING));
            return;
        }
        let largest = (0..all.len())
            .map(|i| {
                let end = all[(i + 1) % all.len()];
                (end, end.wrapping_sub(all[i]))
            })
            .max_by_key(|(_, gap)| *gap);
        if let Some((owner, gap)) = largest {
            if owner == self.me {
                debug!("0x{:04X} owns the largest gap ({gap}) and promotes", self.me);
                self.promote_one_peer(self.me.wrapping_sub(gap / 2));
            }
        }
    }

    /// Fetches the replicas this superpeer should hold from the superpeers
    /// it backs up.
    fn gather_backups(&self) {
        let (sources, peers) = {
            let overlay = lock(&self.overlay);
            let superpeers = overlay.superpeers();
            let Some(predecessor) = overlay.predecessor() else {
                return;
            };
            let mut current = if superpeers.len() > self.config.backup_count {
                let area = overlay.responsible_area(self.me);
                overlay.responsible_superpeer(area.0.wrapping_add(1))
            } else {
                overlay.responsible_superpeer(self.me.wrapping_add(1))
            };
            let mut sources = Vec::new();
            while let Some(superpeer) = current {
                if sources.contains(&superpeer) || sources.len() > superpeers.len() {
                    break;
                }
                sources.push(superpeer);
                if superpeer == predecessor {
                    break;
                }
                current = overlay.responsible_superpeer(superpeer.wrapping_add(1));
            }
            (sources, overlay.peers().to_vec())
        };

        for superpeer in sources {
            let request = LookupMessage::AskAboutBackupsRequest { peers: peers.clone() };
            match self.request(superpeer, request) {
                Ok(LookupMessage::AskAboutBackupsResponse { trees, mappings }) => {
                    trace!(
                        "0x{:04X} got {} trees and {} mappings from 0x{superpeer:04X}",
                        self.me,
                        trees.len(),
                        mappings.len()
                    );
                    self.store_backups(trees, mappings);
                }
                Ok(other) => warn!("0x{superpeer:04X} answered backups with {}", other.name()),
                Err(e) => {
                    warn!("gather backups from 0x{superpeer:04X}: {e}");
                    self.failure_handling(superpeer);
                }
            }
        }
    }

    /// Drops replicas outside the area this superpeer backs up.
    fn delete_unnecessary_backups(&self) {
        let start = {
            let overlay = lock(&self.overlay);
            if overlay.superpeers().len() <= self.config.backup_count {
                return;
            }
            overlay.responsible_area(self.me).0
        };
        if start == self.me {
            return;
        }
        let removed_trees = {
            let mut trees = lock(&self.trees);
            let before = trees.len();
            trees.retain(|creator, _| !is_node_in_range(*creator, self.me, start, Interval::Open));
            before - trees.len()
        };
        let removed_mappings = lock(&self.mappings).remove_in_range(self.me, start, Interval::Open);
        if removed_trees + removed_mappings > 0 {
            debug!(
                "0x{:04X} dropped {removed_trees} trees and {removed_mappings} mappings outside its area",
                self.me
            );
        }
    }

    fn ping_peers(&self) {
        let (peers, superpeers) = {
            let overlay = lock(&self.overlay);
            (overlay.peers().to_vec(), overlay.superpeers().to_vec())
        };
        for peer in peers {
            let message = LookupMessage::SendSuperpeersMessage { superpeers: superpeers.clone() };
            if let Err(e) = self.notify(peer, message) {
                warn!("peer 0x{peer:04X}: {e}");
                self.failure_handling(peer);
            }
        }
    }
}
