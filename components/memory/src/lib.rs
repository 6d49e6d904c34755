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

mod block;
pub mod config;
pub mod err;
mod heap;
mod segment;
pub mod storage;

pub use block::{block_footprint, block_overhead, HEADER_SIZE, MAX_PAYLOAD_SIZE, MIN_BLOCK_SIZE};
pub use config::HeapConfig;
pub use heap::{SmallObjectHeap, SmallObjectHeapRef};
pub use segment::SegmentStatus;
pub use storage::{MemoryStorage, Storage};
