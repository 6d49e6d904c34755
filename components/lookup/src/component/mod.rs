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

//! The lookup component of one node.
//!
//! Superpeers form a ring ordered by node id and split the metadata between
//! them: a superpeer keeps the CIDTree of every creator in `(predecessor, me)`
//! and replicates it on its next `backup_count` successors. Peers only route
//! requests to the responsible superpeer.
//!
//! All state sits behind three mutexes which are always taken in the order
//! overlay, trees, mappings and never held across a network call.

mod failure;
mod handlers;
mod promotion;
mod stabilization;

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use dxram_common::AppId;
use dxram_types::{
    chunk_id::{creator_id, ChunkId},
    hash::hash_app_id,
    BackupRange, Locations, NodeId, NodeRole, INVALID_NODE_ID,
};
use snafu::ensure;
use tracing::{debug, info, warn};

use self::{failure::FailureGate, stabilization::StabilizationState};
pub use self::promotion::PromotionOutcome;
use crate::{
    boot::BootRef,
    cid_tree::{CidTree, RangeStart},
    config::LookupConfig,
    err::{
        BootSnafu, InvalidRangeSnafu, NotResponsibleSnafu, Result, RetriesExhaustedSnafu, RoleMismatchSnafu,
        UnexpectedResponseSnafu,
    },
    event::{EventSink, NoopEventSink},
    id_table::IdTable,
    message::{JoinReply, JoinState, LookupMessage, INCOMING_SUBTYPES, LOOKUP_MESSAGE_TYPE},
    network::{Envelope, MessageReceiver, NetworkRef},
    overlay::OverlayState,
    range::{is_node_in_range, Interval},
    recovery::{LoggingRecovery, RecoveryTrigger},
    retry::{self, RetryPolicy},
};

/// Locks `mutex`, ignoring poisoning: every critical section leaves the
/// state consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

pub type LookupComponentRef = Arc<LookupComponent>;

/// What a superpeer answered to a routed request.
enum Reply<T> {
    Done(T),
    /// The superpeer is not responsible for the target.
    Refused,
    Unexpected(LookupMessage),
}

pub struct LookupComponentBuilder {
    config: LookupConfig,
    network: NetworkRef,
    boot: BootRef,
    events: Arc<dyn EventSink>,
    recovery: Arc<dyn RecoveryTrigger>,
}

impl LookupComponentBuilder {
    pub fn config(mut self, config: LookupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn recovery(mut self, recovery: Arc<dyn RecoveryTrigger>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn build(self) -> LookupComponentRef {
        let me = self.boot.node_id();
        let total = self
            .config
            .expected_superpeers
            .unwrap_or_else(|| self.boot.expected_superpeers());
        let overlay = OverlayState::new(me, self.boot.node_role(), total, self.config.backup_count);
        let retry = RetryPolicy::from_config(&self.config);
        Arc::new_cyclic(|this| LookupComponent {
            me,
            retry,
            config: self.config,
            network: self.network,
            boot: self.boot,
            events: self.events,
            recovery: self.recovery,
            overlay: Mutex::new(overlay),
            trees: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(IdTable::new()),
            failures: FailureGate::default(),
            promoting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stabilization: Mutex::new(StabilizationState::default()),
            worker: Mutex::new(None),
            this: this.clone(),
        })
    }
}

pub struct LookupComponent {
    me: NodeId,
    config: LookupConfig,
    retry: RetryPolicy,
    network: NetworkRef,
    boot: BootRef,
    events: Arc<dyn EventSink>,
    recovery: Arc<dyn RecoveryTrigger>,

    overlay: Mutex<OverlayState>,
    /// CIDTrees by creator: the ones this superpeer is responsible for and
    /// the replicas it backs up.
    trees: Mutex<BTreeMap<NodeId, CidTree>>,
    mappings: Mutex<IdTable>,

    failures: FailureGate,
    promoting: AtomicBool,
    stopped: AtomicBool,
    stabilization: Mutex<StabilizationState>,
    worker: Mutex<Option<stabilization::StabilizationWorker>>,
    this: Weak<LookupComponent>,
}

impl Debug for LookupComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupComponent")
            .field("me", &format_args!("0x{:04X}", self.me))
            .field("overlay", &*lock(&self.overlay))
            .finish_non_exhaustive()
    }
}

impl LookupComponent {
    pub fn builder(network: NetworkRef, boot: BootRef) -> LookupComponentBuilder {
        LookupComponentBuilder {
            config: LookupConfig::default(),
            network,
            boot,
            events: Arc::new(NoopEventSink),
            recovery: Arc::new(LoggingRecovery),
        }
    }

    /// Registers the message handlers and enters the overlay: the bootstrap
    /// opens a new ring, everybody else joins through it. Superpeers start
    /// their stabilization worker afterwards.
    pub fn start(&self) -> Result<()> {
        let receiver: Weak<dyn MessageReceiver> = self.this.clone();
        for subtype in INCOMING_SUBTYPES {
            self.network.register(LOOKUP_MESSAGE_TYPE, *subtype, receiver.clone());
        }

        let role = self.boot.node_role();
        let bootstrap = self.boot.bootstrap_id();
        ensure!(
            bootstrap != INVALID_NODE_ID,
            BootSnafu { reason: "no bootstrap superpeer is known" }
        );
        lock(&self.overlay).set_bootstrap(bootstrap);

        if bootstrap == self.me {
            ensure!(
                role.is_superpeer(),
                BootSnafu { reason: format!("bootstrap 0x{bootstrap:04X} must be a superpeer, not a {role}") }
            );
            lock(&self.overlay).set_successor(Some(self.me));
            info!("0x{:04X} opens the superpeer overlay", self.me);
        } else {
            self.join(bootstrap)?;
        }

        if role.is_superpeer() {
            self.start_stabilization()?;
        }
        Ok(())
    }

    /// Stops the stabilization worker and waits for it. The worker is never
    /// started again, not even by a later promotion.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }

    fn join(&self, bootstrap: NodeId) -> Result<()> {
        let is_superpeer = self.is_superpeer();
        let max_hops = self.boot.expected_superpeers() + self.retry.max_retries;
        let mut contact = bootstrap;
        let mut hops = 0;
        let mut failures = 0;
        loop {
            match self.request(contact, LookupMessage::JoinRequest { node: self.me, is_superpeer }) {
                Ok(LookupMessage::JoinResponse(reply)) => match *reply {
                    JoinReply::Redirect(next) => {
                        hops += 1;
                        ensure!(
                            hops <= max_hops,
                            RetriesExhaustedSnafu { operation: "join", attempts: hops }
                        );
                        debug!("join: 0x{contact:04X} redirects to 0x{next:04X}");
                        contact = next;
                    }
                    JoinReply::Accepted(state) => {
                        self.apply_join(contact, state);
                        return Ok(());
                    }
                },
                Ok(other) => {
                    return UnexpectedResponseSnafu { node: contact, operation: "join", got: other.name() }.fail();
                }
                Err(e) if e.is_network_failure() => {
                    failures += 1;
                    ensure!(
                        failures < self.retry.max_retries,
                        RetriesExhaustedSnafu { operation: "join", attempts: failures }
                    );
                    warn!("join via 0x{contact:04X} failed: {e}");
                    std::thread::sleep(self.retry.delay(failures - 1));
                    contact = self.boot.bootstrap_id();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_join(&self, contact: NodeId, state: JoinState) {
        if self.is_superpeer() {
            {
                let mut overlay = lock(&self.overlay);
                overlay.replace_superpeers(state.superpeers);
                overlay.replace_peers(state.peers);
                overlay.set_successor(state.successor);
                overlay.set_predecessor(state.predecessor);
            }
            self.store_backups(state.trees, state.mappings);
            info!("0x{:04X} joined the overlay: {}", self.me, self.overlay_to_string());
        } else {
            let mut overlay = lock(&self.overlay);
            overlay.replace_superpeers(state.superpeers);
            overlay.insert_superpeer(contact);
            overlay.set_my_superpeer(Some(contact));
            info!("peer 0x{:04X} joined at superpeer 0x{contact:04X}", self.me);
        }
    }

    // Client operations.

    /// Where the chunk `chunk_id` lives, `None` if it was removed or never
    /// existed.
    pub fn get(&self, chunk_id: ChunkId) -> Result<Option<Locations>> {
        self.call_responsible(
            "lookup",
            creator_id(chunk_id),
            || LookupMessage::LookupRequest { chunk_id },
            |response| match response {
                LookupMessage::LookupResponse { locations } => Reply::Done(locations),
                other => Reply::Unexpected(other),
            },
        )
    }

    /// Every backup range of `node`'s own chunks and of the chunks migrated
    /// to it.
    pub fn get_all_backup_ranges(&self, node: NodeId) -> Result<Vec<BackupRange>> {
        self.call_responsible(
            "get backup ranges",
            node,
            || LookupMessage::GetBackupRangesRequest { node },
            |response| match response {
                LookupMessage::GetBackupRangesResponse { ranges: Some(ranges) } => Reply::Done(ranges),
                LookupMessage::GetBackupRangesResponse { ranges: None } => Reply::Refused,
                other => Reply::Unexpected(other),
            },
        )
    }

    /// Tells the superpeer responsible for `owner` that this node restored
    /// all of its chunks.
    pub fn update_all_after_recovery(&self, owner: NodeId) -> Result<()> {
        let mut check = !self.overlay_is_stable();
        retry::with_backoff(&self.retry, "update all", |_| {
            let Some(superpeer) = self.route(owner, check) else {
                return ControlFlow::Continue(());
            };
            match self.notify(superpeer, LookupMessage::UpdateAllMessage { owner }) {
                Ok(()) => ControlFlow::Break(()),
                Err(e) => {
                    warn!("update all for 0x{owner:04X} at 0x{superpeer:04X}: {e}");
                    self.failure_handling(superpeer);
                    check = true;
                    ControlFlow::Continue(())
                }
            }
        })
    }

    /// Registers a new backup range of the calling peer. `locations.primary`
    /// must be this peer.
    pub fn init_range(&self, start: RangeStart, locations: Locations) -> Result<()> {
        self.ensure_peer("init range")?;
        let creator = locations.primary;
        self.call_responsible(
            "init range",
            creator,
            || LookupMessage::InitRangeRequest { start, locations: locations.clone(), backup: false },
            accept_success,
        )
    }

    pub fn migrate(&self, chunk_id: ChunkId, node: NodeId) -> Result<()> {
        self.call_responsible(
            "migrate",
            creator_id(chunk_id),
            || LookupMessage::MigrateRequest { chunk_id, node, backup: false },
            accept_success,
        )
    }

    /// Migrates `start..=end`, which must belong to one creator.
    pub fn migrate_range(&self, start: ChunkId, end: ChunkId, node: NodeId) -> Result<()> {
        ensure!(
            creator_id(start) == creator_id(end) && start <= end,
            InvalidRangeSnafu { start, end }
        );
        self.call_responsible(
            "migrate range",
            creator_id(start),
            || LookupMessage::MigrateRangeRequest { start, end, node, backup: false },
            accept_success,
        )
    }

    /// Removes chunks; they are grouped by creator, one request per group.
    pub fn remove(&self, chunk_ids: &[ChunkId]) -> Result<()> {
        self.ensure_peer("remove")?;
        let mut by_creator: BTreeMap<NodeId, Vec<ChunkId>> = BTreeMap::new();
        for cid in chunk_ids {
            by_creator.entry(creator_id(*cid)).or_default().push(*cid);
        }
        for (creator, chunk_ids) in by_creator {
            self.call_responsible(
                "remove",
                creator,
                || LookupMessage::RemoveRequest { chunk_ids: chunk_ids.clone(), backup: false },
                accept_success,
            )?;
        }
        Ok(())
    }

    /// Maps the application id `id` to `chunk_id`, replacing an older
    /// mapping.
    pub fn insert_id(&self, id: AppId, chunk_id: ChunkId) -> Result<()> {
        self.call_responsible(
            "insert id",
            hash_app_id(id),
            || LookupMessage::InsertIdRequest { id, chunk_id, backup: false },
            accept_success,
        )
    }

    pub fn get_chunk_id(&self, id: AppId) -> Result<Option<ChunkId>> {
        self.call_responsible(
            "get chunk id",
            hash_app_id(id),
            || LookupMessage::GetChunkIdRequest { id },
            |response| match response {
                LookupMessage::GetChunkIdResponse { responsible: true, chunk_id } => Reply::Done(chunk_id),
                LookupMessage::GetChunkIdResponse { responsible: false, .. } => Reply::Refused,
                other => Reply::Unexpected(other),
            },
        )
    }

    /// Number of mappings in the whole overlay. Every superpeer counts only
    /// the mappings it is responsible for, so replicas are not counted twice.
    pub fn get_mapping_count(&self) -> Result<u64> {
        let superpeers = lock(&self.overlay).superpeers().to_vec();
        let mut count = if self.is_superpeer() { self.responsible_mapping_count() } else { 0 };
        for superpeer in superpeers {
            match self.request(superpeer, LookupMessage::GetMappingCountRequest)? {
                LookupMessage::GetMappingCountResponse { count: c } => count += c,
                other => {
                    return UnexpectedResponseSnafu {
                        node: superpeer,
                        operation: "get mapping count",
                        got: other.name(),
                    }
                    .fail();
                }
            }
        }
        Ok(count)
    }

    /// Whether the chunks of `creator` may be accessed on it directly.
    /// Superpeers create no chunks. Any other creator is contacted: a superpeer
    /// sends it the current superpeer list, a peer only pings it so the
    /// creator's view of the ring is left alone.
    pub fn creator_available(&self, creator: NodeId) -> bool {
        let (is_superpeer, superpeers) = {
            let overlay = lock(&self.overlay);
            if overlay.superpeers().contains(&creator) {
                return false;
            }
            (overlay.is_superpeer(), overlay.superpeers().to_vec())
        };
        if creator == self.me {
            return !is_superpeer;
        }
        let message = if is_superpeer {
            LookupMessage::SendSuperpeersMessage { superpeers }
        } else {
            LookupMessage::PingSuperpeerMessage
        };
        match self.notify(creator, message) {
            Ok(()) => true,
            Err(e) => {
                debug!("creator 0x{creator:04X} is not available: {e}");
                false
            }
        }
    }

    /// Whether no other superpeer answers a ping. Peers are never the last.
    pub fn is_last_superpeer(&self) -> bool {
        let superpeers = {
            let overlay = lock(&self.overlay);
            if !overlay.is_superpeer() {
                return false;
            }
            overlay.superpeers().to_vec()
        };
        !superpeers
            .into_iter()
            .filter(|superpeer| *superpeer != self.me)
            .any(|superpeer| self.notify(superpeer, LookupMessage::PingSuperpeerMessage).is_ok())
    }

    // Introspection.

    pub fn node_id(&self) -> NodeId { self.me }

    pub fn role(&self) -> NodeRole { lock(&self.overlay).role() }

    pub fn is_superpeer(&self) -> bool { lock(&self.overlay).is_superpeer() }

    pub fn superpeers(&self) -> Vec<NodeId> { lock(&self.overlay).superpeers().to_vec() }

    pub fn peers(&self) -> Vec<NodeId> { lock(&self.overlay).peers().to_vec() }

    pub fn predecessor(&self) -> Option<NodeId> { lock(&self.overlay).predecessor() }

    pub fn successor(&self) -> Option<NodeId> { lock(&self.overlay).successor() }

    pub fn my_superpeer(&self) -> Option<NodeId> { lock(&self.overlay).my_superpeer() }

    pub fn bootstrap(&self) -> Option<NodeId> { lock(&self.overlay).bootstrap() }

    pub fn overlay_is_stable(&self) -> bool { lock(&self.overlay).is_stable() }

    pub fn overlay_to_string(&self) -> String { lock(&self.overlay).to_string() }

    /// Creators of every CIDTree stored here, own or replica.
    pub fn tree_creators(&self) -> Vec<NodeId> { lock(&self.trees).keys().copied().collect() }

    pub fn cid_tree(&self, creator: NodeId) -> Option<CidTree> { lock(&self.trees).get(&creator).cloned() }

    /// Mappings stored here, own or replica.
    pub fn mapping_len(&self) -> usize { lock(&self.mappings).len() }

    pub fn config(&self) -> &LookupConfig { &self.config }

    // Routing.

    fn ensure_peer(&self, operation: &'static str) -> Result<()> {
        let role = self.role();
        ensure!(!role.is_superpeer(), RoleMismatchSnafu { operation, role });
        Ok(())
    }

    /// Sends a request to the superpeer responsible for `target` until one
    /// accepts it. Refusals and unreachable superpeers switch to the checked
    /// route for the following attempts.
    fn call_responsible<T>(
        &self,
        operation: &'static str,
        target: NodeId,
        request: impl Fn() -> LookupMessage,
        accept: impl Fn(LookupMessage) -> Reply<T>,
    ) -> Result<T> {
        let mut check = !self.overlay_is_stable();
        let mut refused_by = None;
        let outcome = retry::with_backoff(&self.retry, operation, |_| {
            let Some(superpeer) = self.route(target, check) else {
                warn!("{operation}: no superpeer known for 0x{target:04X}");
                return ControlFlow::Continue(());
            };
            match self.request(superpeer, request()) {
                Ok(response) => match accept(response) {
                    Reply::Done(v) => ControlFlow::Break(Ok(v)),
                    Reply::Refused => {
                        debug!("{operation}: 0x{superpeer:04X} is not responsible for 0x{target:04X}");
                        refused_by = Some(superpeer);
                        check = true;
                        ControlFlow::Continue(())
                    }
                    Reply::Unexpected(other) => ControlFlow::Break(
                        UnexpectedResponseSnafu { node: superpeer, operation, got: other.name() }.fail(),
                    ),
                },
                Err(e) if e.is_network_failure() => {
                    warn!("{operation}: {e}");
                    self.failure_handling(superpeer);
                    refused_by = None;
                    check = true;
                    ControlFlow::Continue(())
                }
                Err(e) => ControlFlow::Break(Err(e)),
            }
        });
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_retries_exhausted() => match refused_by {
                Some(node) => NotResponsibleSnafu { node, target, operation }.fail(),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// The superpeer responsible for `target`. Unless `check` is false the
    /// local guess is verified by walking the ring with successor queries.
    fn route(&self, target: NodeId, check: bool) -> Option<NodeId> {
        let (mut responsible, predecessor) = lock(&self.overlay).route(target)?;
        let Some(mut predecessor) = predecessor else {
            return Some(responsible);
        };
        if !check {
            return Some(responsible);
        }

        let hops = lock(&self.overlay).superpeers().len() + 1;
        for _ in 0..hops {
            let response = self.request(predecessor, LookupMessage::AskAboutSuccessorRequest);
            let successor = match response {
                Ok(LookupMessage::AskAboutSuccessorResponse { successor: Some(s) }) => s,
                Ok(_) => break,
                Err(e) => {
                    warn!("route to 0x{target:04X}: {e}");
                    self.failure_handling(predecessor);
                    return lock(&self.overlay).route(target).map(|(r, _)| r);
                }
            };
            if successor == responsible {
                break;
            }
            if is_node_in_range(target, predecessor, successor, Interval::UpperClosed) {
                responsible = successor;
                break;
            }
            predecessor = successor;
        }
        Some(responsible)
    }

    fn request(&self, destination: NodeId, message: LookupMessage) -> Result<LookupMessage> {
        let envelope = message.into_envelope(self.me, destination)?;
        let response = self.network.send_sync(envelope, self.config.rpc_timeout)?;
        LookupMessage::decode(&response.payload)
    }

    fn notify(&self, destination: NodeId, message: LookupMessage) -> Result<()> {
        self.network.send(message.into_envelope(self.me, destination)?)
    }

    // Local state helpers shared by the handlers.

    /// Superpeers are responsible for the creators in `(predecessor, me)`.
    fn is_responsible_for_creator(&self, creator: NodeId) -> bool {
        let overlay = lock(&self.overlay);
        if !overlay.is_superpeer() {
            return false;
        }
        overlay.is_only_superpeer()
            || overlay
                .predecessor()
                .is_some_and(|p| is_node_in_range(creator, p, self.me, Interval::Open))
    }

    /// Mappings are placed by the hash of the application id, in
    /// `[predecessor, me]`.
    fn is_responsible_for_hash(&self, hash: NodeId) -> bool {
        let overlay = lock(&self.overlay);
        if !overlay.is_superpeer() {
            return false;
        }
        overlay.is_only_superpeer()
            || overlay
                .predecessor()
                .is_some_and(|p| is_node_in_range(hash, p, self.me, Interval::Closed))
    }

    fn responsible_mapping_count(&self) -> u64 {
        let predecessor = {
            let overlay = lock(&self.overlay);
            if overlay.is_only_superpeer() {
                None
            } else {
                overlay.predecessor()
            }
        };
        let mappings = lock(&self.mappings);
        match predecessor {
            Some(p) => mappings.count_in_range(p, self.me, Interval::UpperClosed) as u64,
            None => mappings.len() as u64,
        }
    }

    fn trees_in_range(&self, start: NodeId, end: NodeId, interval: Interval) -> Vec<CidTree> {
        lock(&self.trees)
            .values()
            .filter(|t| is_node_in_range(t.creator(), start, end, interval))
            .cloned()
            .collect()
    }

    fn store_backups(&self, trees: Vec<CidTree>, mappings: Vec<(AppId, ChunkId)>) {
        if !trees.is_empty() {
            let mut stored = lock(&self.trees);
            for tree in trees {
                stored.insert(tree.creator(), tree);
            }
        }
        if !mappings.is_empty() {
            lock(&self.mappings).put_all(mappings);
        }
    }

    /// Sends `message` to the backup superpeers of this node. A backup that
    /// misses an update catches up in the next backup maintenance.
    fn replicate(&self, operation: &'static str, message: impl Fn() -> LookupMessage) {
        let backups = lock(&self.overlay).backup_superpeers(self.me);
        for backup in backups {
            if let Err(e) = self.request(backup, message()) {
                warn!("{operation}: replica at 0x{backup:04X} missed the update: {e}");
            }
        }
    }
}

fn accept_success(response: LookupMessage) -> Reply<()> {
    match response {
        LookupMessage::InitRangeResponse { success }
        | LookupMessage::MigrateResponse { success }
        | LookupMessage::MigrateRangeResponse { success }
        | LookupMessage::RemoveResponse { success }
        | LookupMessage::InsertIdResponse { success } => {
            if success {
                Reply::Done(())
            } else {
                Reply::Refused
            }
        }
        other => Reply::Unexpected(other),
    }
}

impl MessageReceiver for LookupComponent {
    fn on_incoming_message(&self, message: Envelope) -> Option<Envelope> {
        let source = message.source;
        let request = match LookupMessage::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("drop undecodable message from 0x{source:04X}: {e}");
                return None;
            }
        };
        let response = self.dispatch(source, request)?;
        match response.into_envelope(self.me, source) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("failed to answer 0x{source:04X}: {e}");
                None
            }
        }
    }
}
