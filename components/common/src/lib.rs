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

use std::time::Duration;

pub const DXRAM: &str = "dxram";
pub const DXRAM_DEBUG_LOG_DIR: &str = "/tmp/dxram.log";

pub const DEFAULT_HEAP_SIZE: u64 = 128 << 20; // 128 MiB
pub const DEFAULT_SEGMENT_SIZE: u64 = 8 << 20; // 8 MiB

// The segment-relative offsets inside block headers are 32 bits wide.
pub const MAX_SEGMENT_SIZE: u64 = u32::MAX as u64;

// Number of ring successors a superpeer replicates its metadata to.
pub const BACKUP_SUPERPEERS: usize = 3;
// Number of backup peers per backup range.
pub const BACKUP_PEERS_PER_RANGE: usize = 3;

pub const STABILIZATION_INTERVAL: Duration = Duration::from_millis(1000);
pub const RPC_TIMEOUT: Duration = Duration::from_millis(333);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(1000);
pub const MAX_RETRIES: usize = 8;

// A superpeer waits this many unstable stabilization rounds before it
// promotes a peer; the wait grows with the overlay size up to the max.
pub const PROMOTION_MIN_TICKS: usize = 30;
pub const PROMOTION_MAX_TICKS: usize = 300;

pub const RING_SIZE: u32 = 1 << 16;

pub fn cal_segment_idx(address: u64, segment_size: u64) -> usize { (address / segment_size) as usize }

pub fn cal_segment_offset(address: u64, segment_size: u64) -> u64 { address % segment_size }

pub type Address = u64;
pub type SegmentIndex = usize;
pub type AppId = u32;
