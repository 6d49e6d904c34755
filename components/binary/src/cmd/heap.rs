use clap::Args;
use dxram_common::Address;
use dxram_memory::{HeapConfig, SmallObjectHeap, MAX_PAYLOAD_SIZE};
use dxram_utils::readable_size::ReadableSize;
use rand::{rngs::StdRng, Rng, SeedableRng};
use snafu::{ResultExt, Whatever};
use tracing::{debug, info};

const WORKLOAD_OPTIONS_HEADER: &str = "WORKLOAD";

// Accepts "512", "512B" or "4KiB".
fn parse_block_size(s: &str) -> Result<usize, String> {
    let bytes = s.parse::<ReadableSize>()?.as_bytes().to_string();
    clap_num::number_range(&bytes, 1, MAX_PAYLOAD_SIZE)
}

#[derive(Debug, Clone, Args)]
pub struct HeapArgs {
    #[arg(long, value_name = "SIZE", help = "Heap size, overrides [heap] total_size")]
    total_size: Option<ReadableSize>,

    #[arg(long, value_name = "SIZE", help = "Segment size, overrides [heap] segment_size")]
    segment_size: Option<ReadableSize>,

    #[arg(long, default_value_t = 100_000, help = "Number of malloc or free operations", help_heading = WORKLOAD_OPTIONS_HEADER)]
    ops: usize,

    #[arg(
        long,
        default_value_t = 4096,
        value_parser = parse_block_size,
        help = "Largest payload to allocate in bytes",
        help_heading = WORKLOAD_OPTIONS_HEADER,
    )]
    max_block: usize,

    #[arg(long, help = "Seed of the workload, random when unset", help_heading = WORKLOAD_OPTIONS_HEADER)]
    seed: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    allocated: usize,
    freed: usize,
    out_of_memory: usize,
    live: usize,
}

impl HeapArgs {
    pub fn run(self, mut config: HeapConfig) -> Result<(), Whatever> {
        if let Some(total) = self.total_size {
            config.total_size = total;
        }
        if let Some(segment) = self.segment_size {
            config.segment_size = segment;
        }
        let heap = SmallObjectHeap::from_config(&config).whatever_context("failed to initialize the heap")?;
        info!(
            total = %config.total_size,
            segment = %config.segment_size,
            segments = heap.segment_count(),
            "heap initialized"
        );

        let seed = self.seed.unwrap_or_else(rand::random);
        let summary = self.workload(&heap, seed)?;

        println!("seed:               {seed}");
        println!("allocated:          {}", summary.allocated);
        println!("freed:              {}", summary.freed);
        println!("out of memory:      {}", summary.out_of_memory);
        println!("live blocks:        {}", summary.live);
        println!(
            "free memory:        {} of {}",
            ReadableSize(heap.get_free_memory()),
            ReadableSize(heap.get_total_memory())
        );
        println!("total fragmentation: {:.4}", heap.get_total_fragmentation());
        for (index, fragmentation) in heap.get_fragmentation().iter().enumerate() {
            println!("  segment {index:>4}: {fragmentation:.4}");
        }
        Ok(())
    }

    /// Allocates and frees at random, two allocations for every free, and
    /// checks each block's contents before it is freed.
    fn workload(&self, heap: &SmallObjectHeap, seed: u64) -> Result<Summary, Whatever> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut live: Vec<(Address, u8, usize)> = Vec::new();
        let mut summary = Summary::default();

        for _ in 0..self.ops {
            if !live.is_empty() && rng.gen_ratio(1, 3) {
                let (address, fill, size) = live.swap_remove(rng.gen_range(0..live.len()));
                let data = heap
                    .read_bytes(address, 0)
                    .with_whatever_context(|_| format!("failed to read block 0x{address:X}"))?;
                snafu::ensure_whatever!(
                    data.len() == size && data.iter().all(|b| *b == fill),
                    "block 0x{address:X} lost its contents"
                );
                heap.free(address)
                    .with_whatever_context(|_| format!("failed to free block 0x{address:X}"))?;
                summary.freed += 1;
                continue;
            }

            let size = rng.gen_range(1..=self.max_block);
            match heap.malloc(size) {
                Ok(address) => {
                    let fill = rng.gen::<u8>();
                    heap.write_bytes(address, 0, &vec![fill; size])
                        .with_whatever_context(|_| format!("failed to write block 0x{address:X}"))?;
                    live.push((address, fill, size));
                    summary.allocated += 1;
                }
                Err(e) if e.is_out_of_memory() => {
                    debug!(size, "heap is full");
                    summary.out_of_memory += 1;
                }
                Err(e) => return Err(e).whatever_context("malloc failed"),
            }
        }
        summary.live = live.len();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_keeps_block_contents() {
        let args = HeapArgs {
            total_size: None,
            segment_size: None,
            ops: 2_000,
            max_block: 512,
            seed: Some(7),
        };
        let heap = SmallObjectHeap::initialize(ReadableSize::mb(4).0, ReadableSize::mb(1).0).unwrap();
        let free_before = heap.get_free_memory();

        let summary = args.workload(&heap, 7).unwrap();
        assert_eq!(summary.allocated + summary.out_of_memory + summary.freed, 2_000);
        assert_eq!(summary.live, summary.allocated - summary.freed);
        assert!(heap.get_free_memory() < free_before);
    }

    #[test]
    fn block_size_is_bounded() {
        assert_eq!(parse_block_size("64"), Ok(64));
        assert_eq!(parse_block_size("512B"), Ok(512));
        assert_eq!(parse_block_size("4KiB"), Ok(4096));
        assert!(parse_block_size("0").is_err());
        assert!(parse_block_size(&(MAX_PAYLOAD_SIZE + 1).to_string()).is_err());
    }
}
