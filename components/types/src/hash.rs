//! Node id derivation: a CRC16 over a seed, probed against a membership
//! filter so no id is handed out twice.

use crate::node::{NodeId, INVALID_NODE_ID};

const POLYNOMIAL: u16 = 0x1021;

/// CRC-16/CCITT-FALSE.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLYNOMIAL } else { crc << 1 };
        }
    }
    crc
}

pub fn hash_seed(seed: i32) -> u16 { crc16(&seed.to_be_bytes()) }

/// Ring position of an application id in the mapping table.
pub fn hash_app_id(id: u32) -> NodeId { crc16(&id.to_be_bytes()) }

/// Exact membership over the whole 16 bit id space.
#[derive(Clone)]
pub struct NodeIdFilter {
    bits: Vec<u64>,
}

impl Default for NodeIdFilter {
    fn default() -> Self { Self::new() }
}

impl NodeIdFilter {
    pub fn new() -> Self { Self { bits: vec![0; (1 << 16) / 64] } }

    pub fn contains(&self, id: NodeId) -> bool {
        self.bits[id as usize / 64] & (1 << (id as usize % 64)) != 0
    }

    pub fn add(&mut self, id: NodeId) { self.bits[id as usize / 64] |= 1 << (id as usize % 64); }

    pub fn len(&self) -> usize { self.bits.iter().map(|w| w.count_ones() as usize).sum() }

    pub fn is_empty(&self) -> bool { self.bits.iter().all(|w| *w == 0) }

    /// Hashes `*seed` and its successors until an unused id shows up, marks
    /// it as used and leaves `seed` past the consumed value. `None` once every
    /// valid id is taken.
    pub fn next_free(&mut self, seed: &mut i32) -> Option<NodeId> {
        if self.len() >= INVALID_NODE_ID as usize {
            return None;
        }
        let mut id = hash_seed(*seed);
        while self.contains(id) || id == INVALID_NODE_ID {
            *seed = seed.wrapping_add(1);
            id = hash_seed(*seed);
        }
        *seed = seed.wrapping_add(1);
        self.add(id);
        Some(id)
    }
}
