//! A chunk id is 64 bits: the 16 bit id of the creating node followed by a
//! 48 bit local id. The creator stays part of the id after migration.

use crate::node::NodeId;

pub type ChunkId = u64;
pub type LocalId = u64;

pub const INVALID_ID: ChunkId = u64::MAX;
pub const LOCAL_ID_BITS: u32 = 48;
pub const LOCAL_ID_MASK: u64 = (1 << LOCAL_ID_BITS) - 1;
pub const MAX_LOCAL_ID: LocalId = LOCAL_ID_MASK;

pub const fn creator_id(cid: ChunkId) -> NodeId { (cid >> LOCAL_ID_BITS) as NodeId }

pub const fn local_id(cid: ChunkId) -> LocalId { cid & LOCAL_ID_MASK }

pub const fn chunk_id(creator: NodeId, local: LocalId) -> ChunkId {
    ((creator as u64) << LOCAL_ID_BITS) | (local & LOCAL_ID_MASK)
}

pub fn to_hex_string(cid: ChunkId) -> String {
    format!("0x{:04X}{:012X}", creator_id(cid), local_id(cid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join() {
        let cid = chunk_id(0xBEEF, 42);
        assert_eq!(cid, 0xBEEF_0000_0000_002A);
        assert_eq!(creator_id(cid), 0xBEEF);
        assert_eq!(local_id(cid), 42);
        assert_eq!(to_hex_string(cid), "0xBEEF00000000002A");

        // The invalid id is outside every creator's valid range.
        assert_eq!(creator_id(INVALID_ID), 0xFFFF);
        assert_eq!(local_id(INVALID_ID), MAX_LOCAL_ID);
        assert_eq!(chunk_id(1, MAX_LOCAL_ID + 1), chunk_id(1, 0));
    }
}
