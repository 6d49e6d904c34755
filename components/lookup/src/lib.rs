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

pub mod boot;
pub mod cid_tree;
pub mod cluster;
mod component;
pub mod config;
pub mod err;
pub mod event;
pub mod id_table;
pub mod message;
pub mod network;
pub mod overlay;
pub mod range;
pub mod recovery;
mod retry;

pub use boot::{BootComponent, BootRef, NodeRegistry, RegistryBoot};
pub use cid_tree::{CidTree, RangeStart};
pub use cluster::Cluster;
pub use component::{LookupComponent, LookupComponentBuilder, LookupComponentRef, PromotionOutcome};
pub use config::LookupConfig;
pub use event::{ChannelEventSink, EventSink, NoopEventSink, OverlayEvent};
pub use network::{LocalNetwork, Network, NetworkRef};
pub use recovery::{LoggingRecovery, RecoveryTrigger};
