//! Block layout inside a segment. Offsets are segment relative.
//!
//! ```text
//! allocated: | tag u32 | len+state u32 | payload ...                    |
//! free:      | tag u32 | canary u32    | next u32 | prev u32 | ... | fp |
//! ```
//!
//! `tag` holds the block footprint (header included, a multiple of 8) with
//! the allocation flags in its low bits. Free blocks repeat the footprint in
//! their last word so the following block can find their start when it is
//! freed and coalesces backwards.

use byteorder::{ByteOrder, LittleEndian};
use dxram_utils::align::align_up;

pub const HEADER_SIZE: usize = 8;
/// Header plus two free list links plus the footer, rounded up to 8.
pub const MIN_BLOCK_SIZE: usize = 24;
pub const ALIGNMENT: u64 = 8;

/// Payload lengths share a word with the 2 bit custom state.
pub const MAX_PAYLOAD_SIZE: usize = (1 << 30) - 1;
pub const MAX_CUSTOM_STATE: u8 = 2;

pub(crate) const NIL: u32 = u32::MAX;

const ALLOCATED: u32 = 0b001;
const PREV_ALLOCATED: u32 = 0b010;
const FLAGS: u32 = 0b111;

const LEN_MASK: u32 = (1 << 30) - 1;
const STATE_SHIFT: u32 = 30;

// Written into freed blocks; an allocated header never carries it since the
// length field is masked to 30 bits with state <= 2.
pub(crate) const FREE_CANARY: u32 = 0xF4EE_DEAD;

/// Bytes a block of `size` payload bytes occupies: header plus payload,
/// rounded up to 8, at least [MIN_BLOCK_SIZE].
pub const fn block_footprint(size: usize) -> usize {
    let fp = align_up((HEADER_SIZE + size) as u64, ALIGNMENT) as usize;
    if fp < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        fp
    }
}

/// Fixed per block overhead: `block_footprint(size) - size`.
pub const fn block_overhead(size: usize) -> usize { block_footprint(size) - size }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(u32);

impl Tag {
    pub(crate) fn new(footprint: u32, allocated: bool, prev_allocated: bool) -> Self {
        debug_assert_eq!(footprint & FLAGS, 0);
        let mut tag = footprint;
        if allocated {
            tag |= ALLOCATED;
        }
        if prev_allocated {
            tag |= PREV_ALLOCATED;
        }
        Tag(tag)
    }

    pub(crate) fn footprint(self) -> u32 { self.0 & !FLAGS }

    pub(crate) fn is_allocated(self) -> bool { self.0 & ALLOCATED != 0 }

    pub(crate) fn is_prev_allocated(self) -> bool { self.0 & PREV_ALLOCATED != 0 }

    pub(crate) fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        if prev_allocated {
            Tag(self.0 | PREV_ALLOCATED)
        } else {
            Tag(self.0 & !PREV_ALLOCATED)
        }
    }
}

pub(crate) fn read_u32(mem: &[u8], at: u32) -> u32 { LittleEndian::read_u32(&mem[at as usize..]) }

pub(crate) fn write_u32(mem: &mut [u8], at: u32, v: u32) {
    LittleEndian::write_u32(&mut mem[at as usize..], v)
}

pub(crate) fn read_tag(mem: &[u8], block: u32) -> Tag { Tag(read_u32(mem, block)) }

pub(crate) fn write_tag(mem: &mut [u8], block: u32, tag: Tag) { write_u32(mem, block, tag.0) }

pub(crate) fn payload_len(mem: &[u8], block: u32) -> usize { (read_u32(mem, block + 4) & LEN_MASK) as usize }

pub(crate) fn custom_state(mem: &[u8], block: u32) -> u8 { (read_u32(mem, block + 4) >> STATE_SHIFT) as u8 }

pub(crate) fn write_len_state(mem: &mut [u8], block: u32, len: usize, state: u8) {
    debug_assert!(len <= MAX_PAYLOAD_SIZE && state <= MAX_CUSTOM_STATE);
    write_u32(mem, block + 4, (len as u32) | ((state as u32) << STATE_SHIFT))
}

pub(crate) fn next_free(mem: &[u8], block: u32) -> u32 { read_u32(mem, block + 8) }

pub(crate) fn prev_free(mem: &[u8], block: u32) -> u32 { read_u32(mem, block + 12) }

pub(crate) fn set_next_free(mem: &mut [u8], block: u32, next: u32) { write_u32(mem, block + 8, next) }

pub(crate) fn set_prev_free(mem: &mut [u8], block: u32, prev: u32) { write_u32(mem, block + 12, prev) }

/// Header, canary and footer of a free block. Links are left to the caller.
pub(crate) fn write_free_block(mem: &mut [u8], block: u32, footprint: u32, prev_allocated: bool) {
    write_tag(mem, block, Tag::new(footprint, false, prev_allocated));
    write_u32(mem, block + 4, FREE_CANARY);
    write_u32(mem, block + footprint - 4, footprint);
}
