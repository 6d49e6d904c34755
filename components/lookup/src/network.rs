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
    fmt::Debug,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use dxram_types::NodeId;
use snafu::{ensure, OptionExt};
use tracing::trace;

use crate::err::{Result, TimeoutSnafu, UnreachableSnafu};

/// A framed message between two nodes. The payload encoding belongs to the
/// component registered for `(msg_type, subtype)`.
#[derive(Clone)]
pub struct Envelope {
    pub source: NodeId,
    pub destination: NodeId,
    pub msg_type: u8,
    pub subtype: u8,
    pub payload: Bytes,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("source", &format_args!("0x{:04X}", self.source))
            .field("destination", &format_args!("0x{:04X}", self.destination))
            .field("msg_type", &self.msg_type)
            .field("subtype", &self.subtype)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Inbound side of a node. Requests return their response, one-way
/// messages return `None`.
pub trait MessageReceiver: Send + Sync {
    fn on_incoming_message(&self, message: Envelope) -> Option<Envelope>;
}

/// The transport as one node sees it.
pub trait Network: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn register(&self, msg_type: u8, subtype: u8, receiver: Weak<dyn MessageReceiver>);

    /// Fire and forget. Only reports whether the destination could be
    /// reached.
    fn send(&self, message: Envelope) -> Result<()>;

    /// Blocks until the response arrives or `timeout` passes.
    fn send_sync(&self, request: Envelope, timeout: Duration) -> Result<Envelope>;
}

pub type NetworkRef = Arc<dyn Network>;

/// An in-process transport connecting every node of a simulated cluster.
///
/// Delivery happens inline on the sender's thread. A disconnected node can
/// neither send nor receive.
#[derive(Default)]
pub struct LocalNetwork {
    receivers: DashMap<(NodeId, u8, u8), Weak<dyn MessageReceiver>>,
    down: DashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn endpoint(self: &Arc<Self>, node: NodeId) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            node,
            hub: self.clone(),
        })
    }

    pub fn disconnect(&self, node: NodeId) { self.down.insert(node); }

    pub fn reconnect(&self, node: NodeId) { self.down.remove(&node); }

    pub fn is_connected(&self, node: NodeId) -> bool { !self.down.contains(&node) }

    fn deliver(&self, message: Envelope) -> Result<Option<Envelope>> {
        let destination = message.destination;
        ensure!(
            self.is_connected(message.source) && self.is_connected(destination),
            UnreachableSnafu { node: destination }
        );
        // The map guard must be gone before the handler runs, it may send.
        let receiver = self
            .receivers
            .get(&(destination, message.msg_type, message.subtype))
            .and_then(|r| r.upgrade())
            .context(UnreachableSnafu { node: destination })?;
        trace!(?message, "deliver");
        Ok(receiver.on_incoming_message(message))
    }
}

pub struct LocalEndpoint {
    node: NodeId,
    hub: Arc<LocalNetwork>,
}

impl Network for LocalEndpoint {
    fn node_id(&self) -> NodeId { self.node }

    fn register(&self, msg_type: u8, subtype: u8, receiver: Weak<dyn MessageReceiver>) {
        self.hub.receivers.insert((self.node, msg_type, subtype), receiver);
    }

    fn send(&self, message: Envelope) -> Result<()> {
        self.hub.deliver(message)?;
        Ok(())
    }

    fn send_sync(&self, request: Envelope, timeout: Duration) -> Result<Envelope> {
        let node = request.destination;
        self.hub
            .deliver(request)?
            .context(TimeoutSnafu { node, timeout })
    }
}
