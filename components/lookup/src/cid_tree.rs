// Copyright 2024 dxram-rs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use dxram_types::{
    chunk_id::{chunk_id, local_id, ChunkId, LocalId},
    BackupRange, Locations, NodeId,
};
use rangemap::{RangeInclusiveMap, RangeInclusiveSet};
use serde::{Deserialize, Serialize};

/// Where a new backup range starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeStart {
    /// A run of the creator's own chunks beginning at this chunk id. The run
    /// extends up to the next initialized range.
    Chunks(ChunkId),
    /// A migration range, addressed by its index.
    Migration(u32),
}

/// Location metadata of every chunk one creator has handed out.
///
/// Chunks live on their creator (or on the peer that restored it) unless
/// they were migrated. Removed chunks have no location at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidTree {
    creator: NodeId,
    active: bool,
    restorer: Option<NodeId>,
    // first local id -> backup peers
    ranges: BTreeMap<LocalId, Vec<NodeId>>,
    migration_ranges: Vec<Vec<NodeId>>,
    migrations: RangeInclusiveMap<LocalId, NodeId>,
    removed: RangeInclusiveSet<LocalId>,
}

impl CidTree {
    pub fn new(creator: NodeId) -> Self {
        Self {
            creator,
            active: true,
            restorer: None,
            ranges: BTreeMap::new(),
            migration_ranges: Vec::new(),
            migrations: RangeInclusiveMap::new(),
            removed: RangeInclusiveSet::new(),
        }
    }

    pub fn creator(&self) -> NodeId { self.creator }

    /// Inactive trees belong to creators that failed or became superpeers.
    pub fn is_active(&self) -> bool { self.active }

    pub fn set_active(&mut self, active: bool) { self.active = active; }

    pub fn restorer(&self) -> Option<NodeId> { self.restorer }

    pub fn set_restorer(&mut self, restorer: NodeId) { self.restorer = Some(restorer); }

    pub fn init_range(&mut self, start: RangeStart, backups: Vec<NodeId>) {
        match start {
            RangeStart::Chunks(first) => {
                self.ranges.insert(local_id(first), backups);
            }
            RangeStart::Migration(index) => {
                let index = index as usize;
                if self.migration_ranges.len() <= index {
                    self.migration_ranges.resize(index + 1, Vec::new());
                }
                self.migration_ranges[index] = backups;
            }
        }
    }

    /// Records that `cid` now lives on `owner`. Moving a chunk back to its
    /// creator drops the migration entry.
    pub fn migrate_object(&mut self, cid: ChunkId, owner: NodeId) {
        let local = local_id(cid);
        self.migrate_locals(local, local, owner);
    }

    /// Like [CidTree::migrate_object] for every id in `start..=end`.
    pub fn migrate_range(&mut self, start: ChunkId, end: ChunkId, owner: NodeId) {
        let (first, last) = (local_id(start), local_id(end));
        if first <= last {
            self.migrate_locals(first, last, owner);
        }
    }

    fn migrate_locals(&mut self, first: LocalId, last: LocalId, owner: NodeId) {
        self.removed.remove(first..=last);
        if owner == self.creator {
            self.migrations.remove(first..=last);
        } else {
            self.migrations.insert(first..=last, owner);
        }
    }

    pub fn remove_object(&mut self, cid: ChunkId) {
        let local = local_id(cid);
        self.migrations.remove(local..=local);
        self.removed.insert(local..=local);
    }

    pub fn get_metadata(&self, cid: ChunkId) -> Option<Locations> {
        let local = local_id(cid);
        if self.removed.contains(&local) {
            return None;
        }
        if let Some(owner) = self.migrations.get(&local) {
            return Some(Locations::new(*owner, Vec::new()));
        }
        let backups = self
            .ranges
            .range(..=local)
            .next_back()
            .map(|(_, backups)| backups.clone())
            .unwrap_or_default();
        Some(Locations::new(self.restorer.unwrap_or(self.creator), backups))
    }

    /// Own ranges first, keyed by their first chunk id, then the migration
    /// ranges keyed by index.
    pub fn all_backup_ranges(&self) -> Vec<BackupRange> {
        let own = self
            .ranges
            .iter()
            .map(|(first, backups)| BackupRange::new(chunk_id(self.creator, *first), backups.clone()));
        let migrated = self
            .migration_ranges
            .iter()
            .enumerate()
            .map(|(index, backups)| BackupRange::new(index as u64, backups.clone()));
        own.chain(migrated).collect()
    }

    pub fn remove_backup_peer(&mut self, failed: NodeId) {
        for backups in self.ranges.values_mut().chain(self.migration_ranges.iter_mut()) {
            backups.retain(|peer| *peer != failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATOR: NodeId = 0x1234;

    fn cid(local: LocalId) -> ChunkId { chunk_id(CREATOR, local) }

    #[test]
    fn ranges_resolve_to_the_creator() {
        let mut tree = CidTree::new(CREATOR);
        tree.init_range(RangeStart::Chunks(cid(1)), vec![7, 8, 9]);
        tree.init_range(RangeStart::Chunks(cid(1000)), vec![10, 11, 12]);

        assert_eq!(tree.get_metadata(cid(1)), Some(Locations::new(CREATOR, vec![7, 8, 9])));
        assert_eq!(tree.get_metadata(cid(999)), Some(Locations::new(CREATOR, vec![7, 8, 9])));
        assert_eq!(tree.get_metadata(cid(1000)), Some(Locations::new(CREATOR, vec![10, 11, 12])));
        // Before the first range nothing is backed up yet.
        assert_eq!(tree.get_metadata(cid(0)), Some(Locations::new(CREATOR, vec![])));
    }

    #[test]
    fn migration_and_return() {
        let mut tree = CidTree::new(CREATOR);
        tree.init_range(RangeStart::Chunks(cid(0)), vec![7]);

        tree.migrate_object(cid(5), 42);
        assert_eq!(tree.get_metadata(cid(5)), Some(Locations::new(42, vec![])));
        assert_eq!(tree.get_metadata(cid(6)), Some(Locations::new(CREATOR, vec![7])));

        tree.migrate_object(cid(5), CREATOR);
        assert_eq!(tree.get_metadata(cid(5)), Some(Locations::new(CREATOR, vec![7])));
    }

    #[test]
    fn migrate_range_then_remove() {
        let mut tree = CidTree::new(CREATOR);
        tree.migrate_range(cid(10), cid(20), 42);
        for local in 10..=20 {
            assert_eq!(tree.get_metadata(cid(local)).unwrap().primary, 42);
        }
        assert_eq!(tree.get_metadata(cid(21)).unwrap().primary, CREATOR);

        tree.remove_object(cid(15));
        assert_eq!(tree.get_metadata(cid(15)), None);
        assert_eq!(tree.get_metadata(cid(14)).unwrap().primary, 42);
        assert_eq!(tree.get_metadata(cid(16)).unwrap().primary, 42);

        // A migrated id is live again.
        tree.migrate_object(cid(15), 43);
        assert_eq!(tree.get_metadata(cid(15)).unwrap().primary, 43);
    }

    #[test]
    fn restorer_answers_for_unmigrated_chunks() {
        let mut tree = CidTree::new(CREATOR);
        tree.init_range(RangeStart::Chunks(cid(0)), vec![7, 8]);
        tree.migrate_object(cid(3), 42);
        tree.set_restorer(99);
        assert_eq!(tree.get_metadata(cid(1)), Some(Locations::new(99, vec![7, 8])));
        assert_eq!(tree.get_metadata(cid(3)), Some(Locations::new(42, vec![])));
    }

    #[test]
    fn backup_ranges_and_failed_backup_peers() {
        let mut tree = CidTree::new(CREATOR);
        tree.init_range(RangeStart::Chunks(cid(0)), vec![7, 8, 9]);
        tree.init_range(RangeStart::Chunks(cid(500)), vec![8, 10, 11]);
        tree.init_range(RangeStart::Migration(1), vec![8, 12]);

        tree.remove_backup_peer(8);
        assert_eq!(
            tree.all_backup_ranges(),
            vec![
                BackupRange::new(cid(0), vec![7, 9]),
                BackupRange::new(cid(500), vec![10, 11]),
                BackupRange::new(0, vec![]),
                BackupRange::new(1, vec![12]),
            ]
        );
    }

    #[test]
    fn survives_the_wire() {
        let mut tree = CidTree::new(CREATOR);
        tree.init_range(RangeStart::Chunks(cid(0)), vec![7]);
        tree.migrate_range(cid(3), cid(9), 42);
        tree.remove_object(cid(4));
        tree.set_active(false);

        let bytes = bincode::serialize(&tree).unwrap();
        let back: CidTree = bincode::deserialize(&bytes).unwrap();
        assert!(!back.is_active());
        assert_eq!(back.get_metadata(cid(4)), None);
        assert_eq!(back.get_metadata(cid(9)), Some(Locations::new(42, vec![])));
        assert_eq!(back.get_metadata(cid(10)), Some(Locations::new(CREATOR, vec![7])));
    }
}
