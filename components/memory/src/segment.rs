use std::fmt::{Display, Formatter};

use dxram_utils::readable_size::ReadableSize;
use snafu::ensure;

use crate::{
    block::{
        custom_state, next_free, payload_len, prev_free, read_tag, read_u32, set_next_free,
        set_prev_free, write_free_block, write_len_state, write_tag, write_u32, Tag, FREE_CANARY, HEADER_SIZE,
        MIN_BLOCK_SIZE, NIL,
    },
    err::{FreedBlockSnafu, InvalidAddressSnafu, OutOfBoundsSnafu, Result},
    storage::Storage,
};

/// Free lists are segregated by the power of two of the block footprint.
/// Class `c` holds footprints in `[2^(c+4), 2^(c+5))`, the last class holds
/// everything larger.
const SIZE_CLASSES: usize = 28;

fn size_class(footprint: u32) -> usize {
    let log = 31 - footprint.leading_zeros();
    (log.saturating_sub(4) as usize).min(SIZE_CLASSES - 1)
}

/// A snapshot of one segment's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentStatus {
    pub index: usize,
    /// Usable bytes; a tail shorter than the 8 byte alignment is not counted.
    pub size: u64,
    pub free_bytes: u64,
    pub free_blocks: usize,
    pub live_blocks: usize,
    pub largest_free_block: u64,
}

impl SegmentStatus {
    /// `1 - largest free block / free bytes`: zero while all free space is
    /// one block, approaching one as it splinters.
    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            return 0.0;
        }
        1.0 - self.largest_free_block as f64 / self.free_bytes as f64
    }
}

impl Display for SegmentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segment {}: size {}, free {} in {} blocks, {} live, fragmentation {:.3}",
            self.index,
            ReadableSize(self.size),
            ReadableSize(self.free_bytes),
            self.free_blocks,
            self.live_blocks,
            self.fragmentation()
        )
    }
}

/// Manages the blocks of one contiguous region. Addresses taken and returned
/// are heap absolute; `base` is where this segment starts.
pub(crate) struct SegmentAllocator<S> {
    index: usize,
    base: u64,
    usable: u32,
    storage: S,
    heads: [u32; SIZE_CLASSES],
    free_bytes: u64,
    free_blocks: usize,
    live_blocks: usize,
}

impl<S: Storage> SegmentAllocator<S> {
    pub(crate) fn new(index: usize, base: u64, len: usize) -> Self {
        let storage = S::allocate(len);
        let mut usable = dxram_utils::align::align_down(len as u64, 8) as u32;
        if (usable as usize) < MIN_BLOCK_SIZE {
            usable = 0;
        }
        let mut seg = Self {
            index,
            base,
            usable,
            storage,
            heads: [NIL; SIZE_CLASSES],
            free_bytes: 0,
            free_blocks: 0,
            live_blocks: 0,
        };
        if usable > 0 {
            let mem = seg.storage.as_mut_slice();
            write_free_block(mem, 0, usable, true);
            link(&mut seg.heads, mem, 0);
            seg.free_bytes = usable as u64;
            seg.free_blocks = 1;
        }
        seg
    }

    pub(crate) fn usable(&self) -> u64 { self.usable as u64 }

    pub(crate) fn len(&self) -> usize { self.storage.size() }

    pub(crate) fn storage(&self) -> &S { &self.storage }

    pub(crate) fn free_bytes(&self) -> u64 { self.free_bytes }

    /// First fit inside the request's own size class, else the head of the
    /// next non-empty larger class. `None` when nothing fits.
    pub(crate) fn malloc(&mut self, size: usize) -> Option<u64> {
        let need = crate::block::block_footprint(size) as u64;
        if need > self.usable as u64 {
            return None;
        }
        let need = need as u32;
        let mem = self.storage.as_mut_slice();
        let block = find_fit(&self.heads, mem, need)?;

        let tag = read_tag(mem, block);
        let footprint = tag.footprint();
        unlink(&mut self.heads, mem, block);

        let taken = if footprint - need >= MIN_BLOCK_SIZE as u32 {
            let rest = block + need;
            write_free_block(mem, rest, footprint - need, true);
            link(&mut self.heads, mem, rest);
            need
        } else {
            // The tail is too small to track on its own and stays with the block.
            let after = block + footprint;
            if after < self.usable {
                let next = read_tag(mem, after);
                write_tag(mem, after, next.with_prev_allocated(true));
            }
            self.free_blocks -= 1;
            footprint
        };

        write_tag(mem, block, Tag::new(taken, true, tag.is_prev_allocated()));
        write_len_state(mem, block, size, 0);
        self.free_bytes -= taken as u64;
        self.live_blocks += 1;
        Some(self.base + (block as usize + HEADER_SIZE) as u64)
    }

    /// Returns the block to its free list, merged with free neighbours.
    pub(crate) fn free(&mut self, address: u64) -> Result<()> {
        let block = self.block(address)?;
        let live = self.is_live(block);
        debug_assert!(live, "double free of block 0x{address:X}");
        ensure!(live, FreedBlockSnafu { address });

        let mem = self.storage.as_mut_slice();
        let tag = read_tag(mem, block);
        let footprint = tag.footprint();
        let mut start = block;
        let mut merged = footprint;
        let mut prev_allocated = tag.is_prev_allocated();

        // The header stays marked even when a merge leaves it inside a larger
        // free block, so a later free or access of `address` is still caught.
        write_tag(mem, block, Tag::new(footprint, false, prev_allocated));
        write_u32(mem, block + 4, FREE_CANARY);

        let next = block + footprint;
        if next < self.usable {
            let next_tag = read_tag(mem, next);
            if !next_tag.is_allocated() {
                unlink(&mut self.heads, mem, next);
                merged += next_tag.footprint();
                self.free_blocks -= 1;
            }
        }
        if !prev_allocated {
            let prev_footprint = read_u32(mem, block - 4);
            let prev = block - prev_footprint;
            unlink(&mut self.heads, mem, prev);
            prev_allocated = read_tag(mem, prev).is_prev_allocated();
            start = prev;
            merged += prev_footprint;
            self.free_blocks -= 1;
        }

        write_free_block(mem, start, merged, prev_allocated);
        link(&mut self.heads, mem, start);
        let after = start + merged;
        if after < self.usable {
            let next = read_tag(mem, after);
            write_tag(mem, after, next.with_prev_allocated(false));
        }

        self.free_bytes += footprint as u64;
        self.free_blocks += 1;
        self.live_blocks -= 1;
        Ok(())
    }

    /// Resolves `address` to the offset of its block header. Only the header
    /// is sanity checked; a stale address inside a live block is not caught.
    fn block(&self, address: u64) -> Result<u32> {
        let local = address.wrapping_sub(self.base);
        ensure!(
            local >= HEADER_SIZE as u64 && local < self.usable as u64 && local % 8 == 0,
            InvalidAddressSnafu { address }
        );
        let block = (local as usize - HEADER_SIZE) as u32;
        let tag = read_tag(self.storage.as_slice(), block);
        let footprint = tag.footprint();
        ensure!(
            footprint as usize >= MIN_BLOCK_SIZE && block as u64 + footprint as u64 <= self.usable as u64,
            InvalidAddressSnafu { address }
        );
        Ok(block)
    }

    fn is_live(&self, block: u32) -> bool {
        let mem = self.storage.as_slice();
        read_tag(mem, block).is_allocated() && read_u32(mem, block + 4) != FREE_CANARY
    }

    fn live_block(&self, address: u64) -> Result<u32> {
        let block = self.block(address)?;
        let live = self.is_live(block);
        debug_assert!(live, "access to freed block 0x{address:X}");
        ensure!(live, FreedBlockSnafu { address });
        Ok(block)
    }

    pub(crate) fn size_block(&self, address: u64) -> Result<usize> {
        let block = self.live_block(address)?;
        Ok(payload_len(self.storage.as_slice(), block))
    }

    pub(crate) fn footprint_block(&self, address: u64) -> Result<usize> {
        let block = self.live_block(address)?;
        Ok(read_tag(self.storage.as_slice(), block).footprint() as usize)
    }

    fn payload_range(&self, address: u64, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let block = self.live_block(address)?;
        let size = payload_len(self.storage.as_slice(), block);
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            OutOfBoundsSnafu {
                address,
                offset,
                len,
                size,
            }
        );
        let start = block as usize + HEADER_SIZE + offset;
        Ok(start..start + len)
    }

    pub(crate) fn payload(&self, address: u64, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.payload_range(address, offset, len)?;
        Ok(&self.storage.as_slice()[range])
    }

    pub(crate) fn payload_mut(&mut self, address: u64, offset: usize, len: usize) -> Result<&mut [u8]> {
        let range = self.payload_range(address, offset, len)?;
        Ok(&mut self.storage.as_mut_slice()[range])
    }

    /// Everything from `offset` to the end of the payload.
    pub(crate) fn payload_tail(&self, address: u64, offset: usize) -> Result<&[u8]> {
        let size = self.size_block(address)?;
        ensure!(
            offset <= size,
            OutOfBoundsSnafu {
                address,
                offset,
                len: 0usize,
                size,
            }
        );
        self.payload(address, offset, size - offset)
    }

    pub(crate) fn custom_state(&self, address: u64) -> Result<u8> {
        let block = self.live_block(address)?;
        Ok(custom_state(self.storage.as_slice(), block))
    }

    pub(crate) fn set_custom_state(&mut self, address: u64, state: u8) -> Result<()> {
        let block = self.live_block(address)?;
        let mem = self.storage.as_mut_slice();
        let len = payload_len(mem, block);
        write_len_state(mem, block, len, state);
        Ok(())
    }

    pub(crate) fn status(&self) -> SegmentStatus {
        let mem = self.storage.as_slice();
        let mut largest = 0;
        for head in self.heads {
            let mut cur = head;
            while cur != NIL {
                largest = largest.max(read_tag(mem, cur).footprint() as u64);
                cur = next_free(mem, cur);
            }
        }
        SegmentStatus {
            index: self.index,
            size: self.usable as u64,
            free_bytes: self.free_bytes,
            free_blocks: self.free_blocks,
            live_blocks: self.live_blocks,
            largest_free_block: largest,
        }
    }

    /// Every block in address order as `(heap address of payload, footprint,
    /// allocated)`.
    #[cfg(test)]
    pub(crate) fn walk(&self) -> Vec<(u64, u32, bool)> {
        let mem = self.storage.as_slice();
        let mut blocks = vec![];
        let mut cur = 0;
        while cur < self.usable {
            let tag = read_tag(mem, cur);
            blocks.push((self.base + cur as u64 + HEADER_SIZE as u64, tag.footprint(), tag.is_allocated()));
            cur += tag.footprint();
        }
        blocks
    }
}

fn find_fit(heads: &[u32; SIZE_CLASSES], mem: &[u8], need: u32) -> Option<u32> {
    let class = size_class(need);
    let mut cur = heads[class];
    while cur != NIL {
        if read_tag(mem, cur).footprint() >= need {
            return Some(cur);
        }
        cur = next_free(mem, cur);
    }
    // Every block of a larger class is at least twice the lower bound of
    // this one, so the head fits.
    heads[class + 1..].iter().copied().find(|head| *head != NIL)
}

fn link(heads: &mut [u32; SIZE_CLASSES], mem: &mut [u8], block: u32) {
    let class = size_class(read_tag(mem, block).footprint());
    let head = heads[class];
    set_next_free(mem, block, head);
    set_prev_free(mem, block, NIL);
    if head != NIL {
        set_prev_free(mem, head, block);
    }
    heads[class] = block;
}

fn unlink(heads: &mut [u32; SIZE_CLASSES], mem: &mut [u8], block: u32) {
    let class = size_class(read_tag(mem, block).footprint());
    let prev = prev_free(mem, block);
    let next = next_free(mem, block);
    if prev == NIL {
        heads[class] = next;
    } else {
        set_next_free(mem, prev, next);
    }
    if next != NIL {
        set_prev_free(mem, next, prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn segment(len: usize) -> SegmentAllocator<MemoryStorage> { SegmentAllocator::new(0, 0, len) }

    #[test]
    fn size_classes() {
        assert_eq!(size_class(24), 0);
        assert_eq!(size_class(31), 0);
        assert_eq!(size_class(32), 1);
        assert_eq!(size_class(112), 2);
        assert_eq!(size_class(u32::MAX & !7), SIZE_CLASSES - 1);
    }

    #[test]
    fn split_and_coalesce() {
        let mut seg = segment(256);
        let a = seg.malloc(100).unwrap();
        let b = seg.malloc(100).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 120);
        // 256 - 2 * 112 = 32 bytes are left, too small for a third block.
        assert_eq!(seg.malloc(100), None);
        assert_eq!(seg.free_bytes(), 32);

        seg.free(a).unwrap();
        assert_eq!(seg.status().free_blocks, 2);
        seg.free(b).unwrap();
        assert_eq!(seg.walk(), vec![(8, 256, false)]);
        let status = seg.status();
        assert_eq!(status.free_blocks, 1);
        assert_eq!(status.largest_free_block, 256);
        assert_eq!(status.fragmentation(), 0.0);
    }

    #[test]
    fn small_tail_stays_with_the_block() {
        let mut seg = segment(128);
        // 112 bytes used, the remaining 16 can't hold a free block.
        let a = seg.malloc(100).unwrap();
        assert_eq!(seg.footprint_block(a).unwrap(), 128);
        assert_eq!(seg.size_block(a).unwrap(), 100);
        assert_eq!(seg.free_bytes(), 0);
        assert_eq!(seg.status().free_blocks, 0);
        seg.free(a).unwrap();
        assert_eq!(seg.free_bytes(), 128);
    }

    #[test]
    fn fragmentation_grows_with_holes() {
        let mut seg = segment(1024);
        let mut blocks = vec![];
        while let Some(b) = seg.malloc(40) {
            blocks.push(b);
        }
        // 21 blocks of 48 bytes, the last one absorbs the 16 byte tail.
        assert_eq!(blocks.len(), 21);
        assert_eq!(seg.status().fragmentation(), 0.0);
        for b in blocks.iter().step_by(2) {
            seg.free(*b).unwrap();
        }
        let status = seg.status();
        assert_eq!(status.free_blocks, 11);
        assert_eq!(status.free_bytes, 10 * 48 + 64);
        assert_eq!(status.largest_free_block, 64);
        assert!(status.fragmentation() > 0.8, "{status}");
    }

    #[test]
    fn rejects_foreign_addresses() {
        let mut seg = segment(256);
        let a = seg.malloc(10).unwrap();
        assert!(seg.size_block(a + 3).is_err());
        assert!(seg.size_block(4096).is_err());
        assert!(seg.size_block(0).is_err());
        assert!(seg.payload(a, 8, 4).unwrap_err().is_out_of_bounds());
        assert!(seg.payload(a, usize::MAX, 2).unwrap_err().is_out_of_bounds());
    }

    /// `b` merges into the already free `a`, leaving its header inside the
    /// merged block.
    fn merged_pair() -> (SegmentAllocator<MemoryStorage>, u64) {
        let mut seg = segment(256);
        let a = seg.malloc(100).unwrap();
        let b = seg.malloc(100).unwrap();
        seg.free(a).unwrap();
        seg.free(b).unwrap();
        assert_eq!(seg.walk(), vec![(8, 256, false)]);
        (seg, b)
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_after_merge_is_caught_in_debug() {
        let (mut seg, b) = merged_pair();
        let _ = seg.free(b);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "access to freed block")]
    fn access_after_merge_is_caught_in_debug() {
        let (seg, b) = merged_pair();
        let _ = seg.size_block(b);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_after_merge_is_an_error() {
        let (mut seg, b) = merged_pair();
        assert!(seg.free(b).unwrap_err().is_freed_block());
        assert!(seg.size_block(b).unwrap_err().is_freed_block());
        assert!(seg.payload(b, 0, 4).unwrap_err().is_freed_block());
        assert_eq!(seg.free_bytes(), 256);
        assert_eq!(seg.status().free_blocks, 1);
        assert_eq!(seg.walk(), vec![(8, 256, false)]);
        // The segment is still whole.
        assert_eq!(seg.malloc(240), Some(8));
    }

    #[test]
    fn tiny_segment_is_empty() {
        let mut seg = segment(20);
        assert_eq!(seg.usable(), 0);
        assert_eq!(seg.malloc(1), None);
        assert_eq!(seg.status().free_blocks, 0);
    }
}
