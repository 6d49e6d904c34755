use dxram_common::AppId;
use dxram_types::{
    chunk_id::{creator_id, to_hex_string, ChunkId},
    hash::hash_app_id,
    BackupRange, Locations, NodeId,
};
use rand::seq::SliceRandom;
use tracing::{debug, error, info, trace, warn};

use super::{lock, LookupComponent};
use crate::{
    cid_tree::{CidTree, RangeStart},
    message::{JoinReply, JoinState, LookupMessage},
    range::{is_node_in_range, Interval},
};

impl LookupComponent {
    /// Handles one incoming message; requests return their response.
    pub(super) fn dispatch(&self, source: NodeId, message: LookupMessage) -> Option<LookupMessage> {
        trace!("0x{:04X} <- 0x{source:04X}: {}", self.me, message.name());
        let response = match message {
            LookupMessage::JoinRequest { node, is_superpeer } => self.on_join(node, is_superpeer),
            LookupMessage::InitRangeRequest { start, locations, backup } => LookupMessage::InitRangeResponse {
                success: self.on_init_range(start, locations, backup),
            },
            LookupMessage::LookupRequest { chunk_id } => LookupMessage::LookupResponse {
                locations: self.on_lookup(chunk_id),
            },
            LookupMessage::GetBackupRangesRequest { node } => LookupMessage::GetBackupRangesResponse {
                ranges: self.on_get_backup_ranges(node),
            },
            LookupMessage::UpdateAllMessage { owner } => {
                self.on_update_all(source, owner);
                return None;
            }
            LookupMessage::MigrateRequest { chunk_id, node, backup } => LookupMessage::MigrateResponse {
                success: self.on_migrate(chunk_id, node, backup),
            },
            LookupMessage::MigrateRangeRequest { start, end, node, backup } => LookupMessage::MigrateRangeResponse {
                success: self.on_migrate_range(start, end, node, backup),
            },
            LookupMessage::RemoveRequest { chunk_ids, backup } => LookupMessage::RemoveResponse {
                success: self.on_remove(&chunk_ids, backup),
            },
            LookupMessage::SendBackupsMessage { trees, mappings } => {
                self.store_backups(trees, mappings);
                return None;
            }
            LookupMessage::SendSuperpeersMessage { superpeers } => {
                self.on_send_superpeers(source, superpeers);
                return None;
            }
            LookupMessage::AskAboutBackupsRequest { peers } => self.on_ask_about_backups(&peers),
            LookupMessage::AskAboutSuccessorRequest => LookupMessage::AskAboutSuccessorResponse {
                successor: lock(&self.overlay).successor(),
            },
            LookupMessage::NotifyAboutNewPredecessorMessage { predecessor } => {
                self.on_new_predecessor(predecessor);
                return None;
            }
            LookupMessage::NotifyAboutNewSuccessorMessage { successor } => {
                self.on_new_successor(successor);
                return None;
            }
            LookupMessage::PingSuperpeerMessage => return None,
            LookupMessage::SearchForPeerRequest => LookupMessage::SearchForPeerResponse {
                peer: lock(&self.overlay).peers().choose(&mut rand::thread_rng()).copied(),
            },
            LookupMessage::PromotePeerRequest(state) => LookupMessage::PromotePeerResponse {
                success: self.on_promote_peer(source, *state),
            },
            LookupMessage::DelegatePromotePeerMessage { hops } => {
                self.on_delegate_promote_peer(hops);
                return None;
            }
            LookupMessage::NotifyAboutFailedPeerMessage { failed } => {
                self.on_failed_peer(failed);
                return None;
            }
            LookupMessage::InsertIdRequest { id, chunk_id, backup } => LookupMessage::InsertIdResponse {
                success: self.on_insert_id(id, chunk_id, backup),
            },
            LookupMessage::GetChunkIdRequest { id } => self.on_get_chunk_id(id),
            LookupMessage::GetMappingCountRequest => LookupMessage::GetMappingCountResponse {
                count: self.responsible_mapping_count(),
            },
            other => {
                debug!("0x{:04X} ignores unsolicited {}", self.me, other.name());
                return None;
            }
        };
        Some(response)
    }

    fn on_join(&self, node: NodeId, is_superpeer: bool) -> LookupMessage {
        let redirect = {
            let overlay = lock(&self.overlay);
            let accept = overlay.is_superpeer()
                && (overlay.is_only_superpeer()
                    || overlay
                        .predecessor()
                        .is_some_and(|p| is_node_in_range(node, p, self.me, Interval::Open)));
            (!accept).then(|| {
                overlay
                    .responsible_superpeer(node)
                    .or(overlay.bootstrap())
                    .unwrap_or(self.me)
            })
        };
        if let Some(next) = redirect {
            return LookupMessage::JoinResponse(Box::new(JoinReply::Redirect(next)));
        }

        let state = if is_superpeer {
            self.accept_superpeer(node)
        } else {
            let mut overlay = lock(&self.overlay);
            overlay.insert_peer(node);
            info!("0x{:04X} accepts peer 0x{node:04X}", self.me);
            JoinState {
                predecessor: None,
                successor: None,
                superpeers: overlay.superpeers().to_vec(),
                peers: Vec::new(),
                trees: Vec::new(),
                mappings: Vec::new(),
            }
        };
        LookupMessage::JoinResponse(Box::new(JoinReply::Accepted(state)))
    }

    /// Places `node` between the predecessor and this superpeer and hands it
    /// the peers and metadata it is now responsible for or backs up.
    fn accept_superpeer(&self, node: NodeId) -> JoinState {
        let (was_only, joiner_predecessor, peers, area, superpeers) = {
            let mut overlay = lock(&self.overlay);
            let was_only = overlay.is_only_superpeer();
            let joiner_predecessor = if was_only {
                self.me
            } else {
                overlay.predecessor().unwrap_or(self.me)
            };
            let peers: Vec<NodeId> = overlay
                .peers()
                .iter()
                .copied()
                .filter(|p| is_node_in_range(*p, joiner_predecessor, node, Interval::Open))
                .collect();
            let area = overlay.responsible_area(node);
            let superpeers: Vec<NodeId> = overlay.superpeers().iter().copied().filter(|s| *s != node).collect();

            for peer in &peers {
                overlay.remove_peer(*peer);
            }
            if was_only {
                overlay.set_successor(Some(node));
            }
            overlay.set_predecessor(Some(node));
            (was_only, joiner_predecessor, peers, area, superpeers)
        };
        let trees = self.trees_in_range(area.0, area.1, Interval::Open);
        let mappings = lock(&self.mappings).entries_in_range(area.0, area.1, Interval::Closed);

        if !was_only {
            let notice = LookupMessage::NotifyAboutNewSuccessorMessage { successor: node };
            if let Err(e) = self.notify(joiner_predecessor, notice) {
                warn!("failed to tell 0x{joiner_predecessor:04X} about its new successor: {e}");
            }
        }
        info!(
            "0x{:04X} accepts superpeer 0x{node:04X} with {} peers and {} trees",
            self.me,
            peers.len(),
            trees.len()
        );
        JoinState {
            predecessor: Some(joiner_predecessor),
            successor: Some(self.me),
            superpeers,
            peers,
            trees,
            mappings,
        }
    }

    fn on_init_range(&self, start: RangeStart, locations: Locations, backup: bool) -> bool {
        let creator = locations.primary;
        let responsible = self.is_responsible_for_creator(creator);
        if !responsible && !backup {
            return false;
        }
        lock(&self.trees)
            .entry(creator)
            .or_insert_with(|| CidTree::new(creator))
            .init_range(start, locations.backups.clone());
        if responsible {
            self.replicate("init range", || LookupMessage::InitRangeRequest {
                start,
                locations: locations.clone(),
                backup: true,
            });
        }
        true
    }

    fn on_lookup(&self, chunk_id: ChunkId) -> Option<Locations> {
        let creator = creator_id(chunk_id);
        let trees = lock(&self.trees);
        match trees.get(&creator) {
            Some(tree) => tree.get_metadata(chunk_id),
            None => {
                error!(
                    "0x{:04X} has no CIDTree of 0x{creator:04X} to look up {}",
                    self.me,
                    to_hex_string(chunk_id)
                );
                None
            }
        }
    }

    fn on_get_backup_ranges(&self, node: NodeId) -> Option<Vec<BackupRange>> {
        if !self.is_responsible_for_creator(node) {
            return None;
        }
        match lock(&self.trees).get(&node) {
            Some(tree) => Some(tree.all_backup_ranges()),
            None => {
                error!("0x{:04X} has no CIDTree of 0x{node:04X}", self.me);
                None
            }
        }
    }

    fn on_update_all(&self, source: NodeId, owner: NodeId) {
        let restored = match lock(&self.trees).get_mut(&owner) {
            Some(tree) => {
                tree.set_restorer(source);
                true
            }
            None => false,
        };
        if restored {
            info!("0x{source:04X} restored the chunks of 0x{owner:04X}");
        } else {
            error!("0x{:04X} has no CIDTree of 0x{owner:04X} to update", self.me);
        }
    }

    /// Applies `change` to the tree of `creator` when this superpeer is
    /// responsible or the request is a replica update. Responsible superpeers
    /// replicate `forward` afterwards.
    fn apply_to_tree(
        &self,
        operation: &'static str,
        creator: NodeId,
        backup: bool,
        change: impl FnOnce(&mut CidTree),
        forward: impl Fn() -> LookupMessage,
    ) -> bool {
        let responsible = self.is_responsible_for_creator(creator);
        if !responsible && !backup {
            return false;
        }
        let applied = match lock(&self.trees).get_mut(&creator) {
            Some(tree) => {
                change(tree);
                true
            }
            None => false,
        };
        if !applied {
            if responsible {
                error!("{operation}: 0x{:04X} has no CIDTree of 0x{creator:04X}", self.me);
                return false;
            }
            debug!("{operation}: 0x{:04X} holds no replica of 0x{creator:04X}", self.me);
            return true;
        }
        if responsible {
            self.replicate(operation, forward);
        }
        true
    }

    fn on_migrate(&self, chunk_id: ChunkId, node: NodeId, backup: bool) -> bool {
        self.apply_to_tree(
            "migrate",
            creator_id(chunk_id),
            backup,
            |tree| tree.migrate_object(chunk_id, node),
            || LookupMessage::MigrateRequest { chunk_id, node, backup: true },
        )
    }

    fn on_migrate_range(&self, start: ChunkId, end: ChunkId, node: NodeId, backup: bool) -> bool {
        if creator_id(start) != creator_id(end) || start > end {
            warn!(
                "refuse migration of {}..={} spanning creators",
                to_hex_string(start),
                to_hex_string(end)
            );
            return false;
        }
        self.apply_to_tree(
            "migrate range",
            creator_id(start),
            backup,
            |tree| tree.migrate_range(start, end, node),
            || LookupMessage::MigrateRangeRequest { start, end, node, backup: true },
        )
    }

    fn on_remove(&self, chunk_ids: &[ChunkId], backup: bool) -> bool {
        let Some(&first) = chunk_ids.first() else {
            return true;
        };
        let creator = creator_id(first);
        if chunk_ids.iter().any(|c| creator_id(*c) != creator) {
            warn!("refuse removal spanning creators");
            return false;
        }
        self.apply_to_tree(
            "remove",
            creator,
            backup,
            |tree| {
                for cid in chunk_ids {
                    tree.remove_object(*cid);
                }
            },
            || LookupMessage::RemoveRequest { chunk_ids: chunk_ids.to_vec(), backup: true },
        )
    }

    fn on_send_superpeers(&self, source: NodeId, superpeers: Vec<NodeId>) {
        let mut overlay = lock(&self.overlay);
        if overlay.is_superpeer() {
            debug!("superpeer 0x{:04X} ignores the list of 0x{source:04X}", self.me);
            return;
        }
        overlay.replace_superpeers(superpeers);
        overlay.insert_superpeer(source);
        if overlay.my_superpeer() != Some(source) && overlay.responsible_superpeer(self.me) == Some(source) {
            info!("peer 0x{:04X} now belongs to 0x{source:04X}", self.me);
            overlay.set_my_superpeer(Some(source));
        }
    }

    /// The metadata a successor should back up for this superpeer: trees in
    /// `(predecessor, me)` except those of the requester's own peers, plus
    /// the mappings this superpeer is responsible for.
    fn on_ask_about_backups(&self, peers: &[NodeId]) -> LookupMessage {
        let predecessor = lock(&self.overlay).predecessor().unwrap_or(self.me);
        let trees = lock(&self.trees)
            .values()
            .filter(|t| is_node_in_range(t.creator(), predecessor, self.me, Interval::Open))
            .filter(|t| !peers.contains(&t.creator()))
            .cloned()
            .collect();
        let mappings = lock(&self.mappings).entries_in_range(predecessor, self.me, Interval::Closed);
        LookupMessage::AskAboutBackupsResponse { trees, mappings }
    }

    fn on_new_predecessor(&self, predecessor: NodeId) {
        let mut overlay = lock(&self.overlay);
        if predecessor == self.me || overlay.predecessor() == Some(predecessor) {
            return;
        }
        let closer = match overlay.predecessor() {
            None => true,
            Some(current) => is_node_in_range(predecessor, current, self.me, Interval::Open),
        };
        if closer {
            debug!("0x{:04X}: new predecessor 0x{predecessor:04X}", self.me);
            overlay.set_predecessor(Some(predecessor));
        }
    }

    fn on_new_successor(&self, successor: NodeId) {
        let mut overlay = lock(&self.overlay);
        if successor == self.me || overlay.successor() == Some(successor) {
            return;
        }
        let closer = match overlay.successor() {
            None => true,
            Some(current) => is_node_in_range(successor, self.me, current, Interval::Open),
        };
        if closer {
            debug!("0x{:04X}: new successor 0x{successor:04X}", self.me);
            overlay.set_successor(Some(successor));
        }
    }

    /// Forgets `failed` as backup peer everywhere and stops taking over its
    /// tree.
    pub(super) fn on_failed_peer(&self, failed: NodeId) {
        let mut trees = lock(&self.trees);
        for tree in trees.values_mut() {
            tree.remove_backup_peer(failed);
        }
        if let Some(tree) = trees.get_mut(&failed) {
            tree.set_active(false);
        }
    }

    fn on_insert_id(&self, id: AppId, chunk_id: ChunkId, backup: bool) -> bool {
        let responsible = self.is_responsible_for_hash(hash_app_id(id));
        if !responsible && !backup {
            return false;
        }
        lock(&self.mappings).put(id, chunk_id);
        if responsible {
            self.replicate("insert id", || LookupMessage::InsertIdRequest { id, chunk_id, backup: true });
        }
        true
    }

    fn on_get_chunk_id(&self, id: AppId) -> LookupMessage {
        if !self.is_responsible_for_hash(hash_app_id(id)) {
            return LookupMessage::GetChunkIdResponse { responsible: false, chunk_id: None };
        }
        LookupMessage::GetChunkIdResponse {
            responsible: true,
            chunk_id: lock(&self.mappings).get(id),
        }
    }
}
