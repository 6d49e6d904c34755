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

use std::{
    fmt::{Display, Formatter},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use byteorder::{ByteOrder, LittleEndian};
use dxram_common::{cal_segment_idx, Address, MAX_SEGMENT_SIZE};
use dxram_utils::readable_size::ReadableSize;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info, trace};

use crate::{
    block::{MAX_CUSTOM_STATE, MAX_PAYLOAD_SIZE, MIN_BLOCK_SIZE},
    config::HeapConfig,
    err::{
        DumpSnafu, InvalidAddressSnafu, InvalidAllocationSizeSnafu, InvalidCustomStateSnafu,
        InvalidHeapSizeSnafu, OutOfBoundsSnafu, OutOfMemorySnafu, Result,
    },
    segment::{SegmentAllocator, SegmentStatus},
    storage::{MemoryStorage, Storage},
};

pub type SmallObjectHeapRef = Arc<SmallObjectHeap>;

/// A manually managed heap over a byte region split into fixed size
/// segments. Each segment has its own lock; an operation on an address only
/// contends with operations on the same segment.
///
/// Addresses are byte offsets into the heap. `address / segment_size` names
/// the owning segment and no block crosses a segment boundary.
pub struct SmallObjectHeap<S: Storage = MemoryStorage> {
    segment_size: u64,
    total_memory: u64,
    segments: Vec<Mutex<SegmentAllocator<S>>>,
}

impl SmallObjectHeap<MemoryStorage> {
    pub fn from_config(config: &HeapConfig) -> Result<Self> {
        Self::initialize(config.total_size.as_bytes(), config.segment_size.as_bytes())
    }
}

impl<S: Storage> SmallObjectHeap<S> {
    /// Splits `total_size` bytes into `ceil(total_size / segment_size)`
    /// zero filled segments; the last one may be shorter.
    pub fn initialize(total_size: u64, segment_size: u64) -> Result<Self> {
        ensure!(
            total_size > 0 && segment_size >= MIN_BLOCK_SIZE as u64 && segment_size <= MAX_SEGMENT_SIZE,
            InvalidHeapSizeSnafu {
                total_size,
                segment_size,
            }
        );
        let start_at = Instant::now();
        let count = total_size.div_ceil(segment_size);
        let segments: Vec<_> = (0..count)
            .map(|i| {
                let base = i * segment_size;
                let len = segment_size.min(total_size - base) as usize;
                SegmentAllocator::new(i as usize, base, len)
            })
            .collect();
        let total_memory = segments.iter().map(|s| s.usable()).sum();

        let heap = Self {
            segment_size,
            total_memory,
            segments: segments.into_iter().map(Mutex::new).collect(),
        };
        info!("{} initialized, cost: {:?}", heap, start_at.elapsed());
        Ok(heap)
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, SegmentAllocator<S>> {
        self.segments[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn segment(&self, address: Address) -> Result<MutexGuard<'_, SegmentAllocator<S>>> {
        let index = cal_segment_idx(address, self.segment_size);
        ensure!(index < self.segments.len(), InvalidAddressSnafu { address });
        Ok(self.lock(index))
    }

    /// Tries the segments in index order and returns the first address
    /// found. Exhaustion is an ordinary error the caller can recover from.
    pub fn malloc(&self, size: usize) -> Result<Address> {
        ensure!(size > 0 && size <= MAX_PAYLOAD_SIZE, InvalidAllocationSizeSnafu { size });
        for index in 0..self.segments.len() {
            if let Some(address) = self.lock(index).malloc(size) {
                trace!(size, segment = index, "malloc 0x{:X}", address);
                return Ok(address);
            }
        }
        debug!("heap exhausted for {} bytes, free {}", size, ReadableSize(self.get_free_memory()));
        OutOfMemorySnafu { size }.fail()
    }

    pub fn free(&self, address: Address) -> Result<()> {
        self.segment(address)?.free(address)?;
        trace!("free 0x{:X}", address);
        Ok(())
    }

    /// Payload size exactly as requested by `malloc`.
    pub fn get_size_block(&self, address: Address) -> Result<usize> { self.segment(address)?.size_block(address) }

    /// Bytes the block occupies beyond its payload. Equals
    /// [block_overhead](crate::block_overhead) of the size, plus the tail a
    /// split would have left too small to track.
    pub fn get_overhead_block(&self, address: Address) -> Result<usize> {
        let seg = self.segment(address)?;
        Ok(seg.footprint_block(address)? - seg.size_block(address)?)
    }

    pub fn read_byte(&self, address: Address, offset: usize) -> Result<u8> {
        Ok(self.segment(address)?.payload(address, offset, 1)?[0])
    }

    pub fn read_short(&self, address: Address, offset: usize) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.segment(address)?.payload(address, offset, 2)?))
    }

    pub fn read_int(&self, address: Address, offset: usize) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.segment(address)?.payload(address, offset, 4)?))
    }

    pub fn read_long(&self, address: Address, offset: usize) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.segment(address)?.payload(address, offset, 8)?))
    }

    /// Copies the payload from `offset` to its end.
    pub fn read_bytes(&self, address: Address, offset: usize) -> Result<Vec<u8>> {
        Ok(self.segment(address)?.payload_tail(address, offset)?.to_vec())
    }

    /// Fills all of `buf` from the payload at `offset`.
    pub fn read_bytes_into(&self, address: Address, offset: usize, buf: &mut [u8]) -> Result<usize> {
        buf.copy_from_slice(self.segment(address)?.payload(address, offset, buf.len())?);
        Ok(buf.len())
    }

    pub fn write_byte(&self, address: Address, offset: usize, value: u8) -> Result<()> {
        self.segment(address)?.payload_mut(address, offset, 1)?[0] = value;
        Ok(())
    }

    pub fn write_short(&self, address: Address, offset: usize, value: i16) -> Result<()> {
        LittleEndian::write_i16(self.segment(address)?.payload_mut(address, offset, 2)?, value);
        Ok(())
    }

    pub fn write_int(&self, address: Address, offset: usize, value: i32) -> Result<()> {
        LittleEndian::write_i32(self.segment(address)?.payload_mut(address, offset, 4)?, value);
        Ok(())
    }

    pub fn write_long(&self, address: Address, offset: usize, value: i64) -> Result<()> {
        LittleEndian::write_i64(self.segment(address)?.payload_mut(address, offset, 8)?, value);
        Ok(())
    }

    pub fn write_bytes(&self, address: Address, offset: usize, data: &[u8]) -> Result<usize> {
        self.segment(address)?
            .payload_mut(address, offset, data.len())?
            .copy_from_slice(data);
        Ok(data.len())
    }

    /// Sets the first `size` payload bytes of the block to `value`.
    pub fn set(&self, address: Address, size: usize, value: u8) -> Result<()> {
        self.segment(address)?.payload_mut(address, 0, size)?.fill(value);
        Ok(())
    }

    pub fn get_custom_state(&self, address: Address) -> Result<u8> { self.segment(address)?.custom_state(address) }

    /// Tags the block with `state` in `0..=2`. The allocator itself never
    /// interprets it.
    pub fn set_custom_state(&self, address: Address, state: u8) -> Result<()> {
        ensure!(state <= MAX_CUSTOM_STATE, InvalidCustomStateSnafu { state });
        self.segment(address)?.set_custom_state(address, state)
    }

    pub fn get_free_memory(&self) -> u64 { (0..self.segments.len()).map(|i| self.lock(i).free_bytes()).sum() }

    pub fn get_total_memory(&self) -> u64 { self.total_memory }

    pub fn segment_count(&self) -> usize { self.segments.len() }

    pub fn segment_size(&self) -> u64 { self.segment_size }

    pub fn segment_status(&self, index: usize) -> Option<SegmentStatus> {
        (index < self.segments.len()).then(|| self.lock(index).status())
    }

    /// Per segment fragmentation, see [SegmentStatus::fragmentation].
    pub fn get_fragmentation(&self) -> Vec<f64> {
        (0..self.segments.len()).map(|i| self.lock(i).status().fragmentation()).collect()
    }

    /// Fragmentation of all segments, weighted by their free bytes.
    pub fn get_total_fragmentation(&self) -> f64 {
        let (weighted, free) = (0..self.segments.len())
            .map(|i| self.lock(i).status())
            .fold((0.0, 0u64), |(w, f), s| {
                (w + s.fragmentation() * s.free_bytes as f64, f + s.free_bytes)
            });
        if free == 0 {
            0.0
        } else {
            weighted / free as f64
        }
    }

    /// Writes `len` raw heap bytes starting at `address` to `path`, headers
    /// and free space included.
    pub fn dump(&self, path: impl AsRef<Path>, address: Address, len: u64) -> Result<()> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let end = address.checked_add(len).context(InvalidAddressSnafu { address })?;
        let mut out = BufWriter::new(File::create(path).context(DumpSnafu { path: path_str.clone() })?);

        let mut cur = address;
        while cur < end {
            let seg = self.segment(cur)?;
            let local = cur % self.segment_size;
            ensure!(
                local < seg.len() as u64,
                OutOfBoundsSnafu {
                    address,
                    offset: (cur - address) as usize,
                    len: len as usize,
                    size: (cur - address) as usize,
                }
            );
            let n = (seg.len() as u64 - local).min(end - cur);
            seg.storage()
                .dump(&mut out, local as usize, n as usize)
                .context(DumpSnafu { path: path_str.clone() })?;
            cur += n;
        }
        out.flush().context(DumpSnafu { path: path_str })?;
        debug!("dumped {} from 0x{:X} to {}", ReadableSize(len), address, path.display());
        Ok(())
    }
}

impl<S: Storage> Display for SmallObjectHeap<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SmallObjectHeap {{ segments: {} x {}, total: {}, free: {} }}",
            self.segments.len(),
            ReadableSize(self.segment_size),
            ReadableSize(self.total_memory),
            ReadableSize(self.get_free_memory()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, thread};

    use dxram_utils::logger::install_fmt_log;
    use proptest::prelude::*;

    use super::*;
    use crate::block::{block_footprint, block_overhead, HEADER_SIZE};

    fn heap(total: u64, segment: u64) -> SmallObjectHeap { SmallObjectHeap::initialize(total, segment).unwrap() }

    /// Every block of every segment stays inside its segment.
    fn assert_segment_bounds(heap: &SmallObjectHeap) {
        for i in 0..heap.segment_count() {
            let seg = heap.lock(i);
            let base = i as u64 * heap.segment_size;
            let mut covered = 0;
            for (address, footprint, _) in seg.walk() {
                let start = address - HEADER_SIZE as u64;
                assert!(start >= base);
                assert!(start + footprint as u64 <= base + seg.usable());
                covered += footprint as u64;
            }
            assert_eq!(covered, seg.usable());
        }
    }

    fn assert_conservation(heap: &SmallObjectHeap, live: &BTreeMap<u64, usize>) {
        let used: u64 = live
            .iter()
            .map(|(addr, size)| (*size + heap.get_overhead_block(*addr).unwrap()) as u64)
            .sum();
        assert_eq!(heap.get_free_memory() + used, heap.get_total_memory());
    }

    #[test]
    fn freed_block_is_reused() {
        install_fmt_log();
        let heap = heap(1024, 256);
        assert_eq!(heap.segment_count(), 4);
        assert_eq!(heap.get_total_memory(), 1024);

        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(100).unwrap();
        let c = heap.malloc(100).unwrap();
        assert_eq!((a, b), (8, 120));
        // The first segment has only 32 bytes left.
        assert_eq!(c, 256 + 8);

        heap.free(b).unwrap();
        assert_eq!(heap.malloc(100).unwrap(), b);
    }

    #[test]
    fn typed_access() {
        let heap = heap(4096, 1024);
        let addr = heap.malloc(32).unwrap();
        heap.write_byte(addr, 0, 0xAB).unwrap();
        heap.write_short(addr, 1, -2).unwrap();
        heap.write_int(addr, 3, 0x1234_5678).unwrap();
        heap.write_long(addr, 7, i64::MIN + 1).unwrap();
        assert_eq!(heap.read_byte(addr, 0).unwrap(), 0xAB);
        assert_eq!(heap.read_short(addr, 1).unwrap(), -2);
        assert_eq!(heap.read_int(addr, 3).unwrap(), 0x1234_5678);
        assert_eq!(heap.read_long(addr, 7).unwrap(), i64::MIN + 1);

        heap.set(addr, 32, 0x7F).unwrap();
        assert_eq!(heap.read_bytes(addr, 0).unwrap(), vec![0x7F; 32]);
        let mut buf = [0u8; 4];
        assert_eq!(heap.read_bytes_into(addr, 28, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x7F; 4]);
    }

    #[test]
    fn bytes_round_trip_for_all_block_sizes() {
        let heap = heap(8192, 4096);
        let max = 4096 - HEADER_SIZE;
        for size in [1, 7, 8, 16, 17, 100, 1000, 2048, max] {
            let addr = heap.malloc(size).unwrap();
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            assert_eq!(heap.write_bytes(addr, 0, &data).unwrap(), size);
            assert_eq!(heap.read_bytes(addr, 0).unwrap(), data);
            assert_eq!(heap.get_size_block(addr).unwrap(), size);
            assert_eq!(heap.get_overhead_block(addr).unwrap(), block_overhead(size));
            heap.free(addr).unwrap();
        }
        assert!(heap.malloc(max + 1).unwrap_err().is_out_of_memory());
        assert_eq!(heap.get_free_memory(), heap.get_total_memory());
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let heap = heap(1024, 256);
        let addr = heap.malloc(100).unwrap();
        assert!(heap.write_int(addr, 97, 1).unwrap_err().is_out_of_bounds());
        assert!(heap.read_long(addr, 93).unwrap_err().is_out_of_bounds());
        assert!(heap.write_bytes(addr, 1, &[0; 100]).unwrap_err().is_out_of_bounds());
        assert!(heap.read_bytes(addr, 101).unwrap_err().is_out_of_bounds());
        assert!(heap.read_bytes(addr, 100).unwrap().is_empty());
        assert!(heap.set(addr, 101, 0).unwrap_err().is_out_of_bounds());
        assert!(heap.read_byte(5000, 0).is_err());
    }

    #[test]
    fn custom_state() {
        let heap = heap(1024, 256);
        let addr = heap.malloc(10).unwrap();
        assert_eq!(heap.get_custom_state(addr).unwrap(), 0);
        heap.set_custom_state(addr, 2).unwrap();
        heap.write_bytes(addr, 0, &[0xFF; 10]).unwrap();
        assert_eq!(heap.get_custom_state(addr).unwrap(), 2);
        assert_eq!(heap.get_size_block(addr).unwrap(), 10);
        assert!(heap.set_custom_state(addr, 3).is_err());
        assert_eq!(heap.get_custom_state(addr).unwrap(), 2);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let heap = heap(512, 256);
        assert!(heap.malloc(0).is_err());
        assert!(heap.malloc(300).unwrap_err().is_out_of_memory());

        let mut live = vec![];
        loop {
            match heap.malloc(50) {
                Ok(addr) => live.push(addr),
                Err(e) => {
                    assert!(e.is_out_of_memory());
                    break;
                }
            }
        }
        assert_eq!(live.len(), 2 * (256 / block_footprint(50)));
        heap.free(live[3]).unwrap();
        assert_eq!(heap.malloc(50).unwrap(), live[3]);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(SmallObjectHeap::<MemoryStorage>::initialize(0, 256).is_err());
        assert!(SmallObjectHeap::<MemoryStorage>::initialize(1024, 0).is_err());
        assert!(SmallObjectHeap::<MemoryStorage>::initialize(1024, 16).is_err());
        assert!(SmallObjectHeap::<MemoryStorage>::initialize(1 << 33, 1 << 33).is_err());
    }

    #[test]
    fn uneven_last_segment() {
        let heap = heap(1000, 256);
        assert_eq!(heap.segment_count(), 4);
        assert_eq!(heap.segment_status(3).unwrap().size, 232);
        assert_eq!(heap.get_total_memory(), 1000);

        let mut live = BTreeMap::new();
        let mut size = 1;
        while let Ok(addr) = heap.malloc(size) {
            live.insert(addr, size);
            size = size % 90 + 13;
        }
        assert_segment_bounds(&heap);
        assert_conservation(&heap, &live);
    }

    #[test]
    fn fragmentation_report() {
        let heap = heap(2048, 1024);
        assert_eq!(heap.get_fragmentation(), vec![0.0, 0.0]);
        let blocks: Vec<_> = (0..20).map(|_| heap.malloc(40).unwrap()).collect();
        for b in blocks.iter().step_by(2) {
            heap.free(*b).unwrap();
        }
        assert!(heap.get_fragmentation()[0] > 0.0);
        assert!(heap.get_total_fragmentation() > 0.0);
        assert_eq!(heap.get_fragmentation()[1], 0.0);
    }

    #[test]
    fn concurrent_segments() {
        install_fmt_log();
        let heap = Arc::new(heap(64 * 1024, 4096));
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let heap = heap.clone();
                thread::spawn(move || {
                    for round in 0..200usize {
                        let size = 8 + (round * 7 + t as usize) % 120;
                        let addr = heap.malloc(size).unwrap();
                        heap.set(addr, size, t).unwrap();
                        heap.write_int(addr, 0, round as i32).unwrap();
                        assert_eq!(heap.read_int(addr, 0).unwrap(), round as i32);
                        assert_eq!(heap.read_byte(addr, size - 1).unwrap(), t);
                        heap.free(addr).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(heap.get_free_memory(), heap.get_total_memory());
    }

    #[test]
    fn dump_spans_segments() {
        let heap = heap(1024, 256);
        let a = heap.malloc(200).unwrap();
        let b = heap.malloc(200).unwrap();
        heap.set(a, 200, 0xAA).unwrap();
        heap.set(b, 200, 0xBB).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.dump");
        heap.dump(&path, 0, 512).unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 512);
        assert_eq!(&raw[a as usize..a as usize + 200], &[0xAA; 200][..]);
        assert_eq!(&raw[b as usize..b as usize + 200], &[0xBB; 200][..]);
        assert!(heap.dump(&path, 1000, 100).is_err());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught_in_debug() {
        let heap = heap(1024, 256);
        let _a = heap.malloc(10).unwrap();
        let b = heap.malloc(10).unwrap();
        let _c = heap.malloc(10).unwrap();
        heap.free(b).unwrap();
        let _ = heap.free(b);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(prop::sample::Index),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (1usize..400).prop_map(Op::Alloc),
            2 => any::<prop::sample::Index>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..150)) {
            let heap = heap(3000, 1024);
            let mut live: BTreeMap<u64, usize> = BTreeMap::new();
            for op in ops {
                match op {
                    Op::Alloc(size) => match heap.malloc(size) {
                        Ok(addr) => {
                            heap.set(addr, size, 0x5A).unwrap();
                            prop_assert!(live.insert(addr, size).is_none());
                        }
                        Err(e) => prop_assert!(e.is_out_of_memory()),
                    },
                    Op::Free(idx) if !live.is_empty() => {
                        let addr = *live.keys().nth(idx.index(live.len())).unwrap();
                        live.remove(&addr);
                        heap.free(addr).unwrap();
                    }
                    Op::Free(_) => {}
                }

                let mut end = 0;
                for (addr, size) in &live {
                    prop_assert!(*addr >= end, "block 0x{:X} overlaps its predecessor", addr);
                    prop_assert_eq!(heap.get_size_block(*addr).unwrap(), *size);
                    end = addr + *size as u64;
                }
                assert_conservation(&heap, &live);
            }
            assert_segment_bounds(&heap);
            for (addr, size) in &live {
                prop_assert_eq!(heap.read_bytes(*addr, 0).unwrap(), vec![0x5A; *size]);
            }
        }
    }
}
