use std::collections::HashMap;

use dxram_common::AppId;
use dxram_types::{chunk_id::ChunkId, hash::hash_app_id, NodeId};

use crate::range::{is_node_in_range, Interval};

/// Application id to chunk id mappings. Each mapping is owned by the
/// superpeer responsible for the CRC16 hash of its application id.
#[derive(Debug, Default)]
pub struct IdTable {
    entries: HashMap<AppId, ChunkId>,
}

impl IdTable {
    pub fn new() -> Self { Self::default() }

    pub fn put(&mut self, id: AppId, cid: ChunkId) { self.entries.insert(id, cid); }

    pub fn get(&self, id: AppId) -> Option<ChunkId> { self.entries.get(&id).copied() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn put_all(&mut self, entries: impl IntoIterator<Item = (AppId, ChunkId)>) {
        self.entries.extend(entries);
    }

    pub fn entries_in_range(&self, start: NodeId, end: NodeId, interval: Interval) -> Vec<(AppId, ChunkId)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|(id, _)| is_node_in_range(hash_app_id(**id), start, end, interval))
            .map(|(id, cid)| (*id, *cid))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn count_in_range(&self, start: NodeId, end: NodeId, interval: Interval) -> usize {
        self.entries
            .keys()
            .filter(|id| is_node_in_range(hash_app_id(**id), start, end, interval))
            .count()
    }

    pub fn remove_in_range(&mut self, start: NodeId, end: NodeId, interval: Interval) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|id, _| !is_node_in_range(hash_app_id(*id), start, end, interval));
        before - self.entries.len()
    }

    pub fn all(&self) -> Vec<(AppId, ChunkId)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(id, cid)| (*id, *cid)).collect();
        entries.sort_unstable();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_follow_the_hash() {
        let mut table = IdTable::new();
        table.put_all((0..200).map(|id| (id, id as u64 * 10)));
        assert_eq!(table.len(), 200);
        assert_eq!(table.get(7), Some(70));
        assert_eq!(table.get(700), None);

        let pivot = hash_app_id(42);
        let low = table.count_in_range(0, pivot, Interval::Closed);
        let high = table.count_in_range(pivot, 0, Interval::Open);
        assert_eq!(low + high, 200);
        assert!(table
            .entries_in_range(0, pivot, Interval::Closed)
            .iter()
            .any(|(id, _)| *id == 42));

        let removed = table.remove_in_range(pivot, 0, Interval::Open);
        assert_eq!(removed, high);
        assert_eq!(table.len(), low);
        assert_eq!(table.get(42), Some(420));
    }
}
