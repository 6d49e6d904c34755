use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use dashmap::{DashMap, DashSet};
use dxram_types::{hash::NodeIdFilter, NodeEntry, NodeId, NodeRole, INVALID_NODE_ID};
use snafu::{ensure, OptionExt};
use tracing::{info, warn};

use crate::{
    component::lock,
    err::{BootSnafu, Result},
};

/// Identity and membership as one node sees it.
pub trait BootComponent: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn node_role(&self) -> NodeRole;

    fn bootstrap_id(&self) -> NodeId;

    /// Total number of superpeers the cluster is configured with.
    fn expected_superpeers(&self) -> usize;

    /// Whether `node` holds a persistent registration, i.e. data may be
    /// backed up on it.
    fn node_available(&self, node: NodeId) -> bool;

    fn report_node_failure(&self, node: NodeId, is_superpeer: bool);

    fn promote_to_superpeer(&self);

    /// Replaces the failed bootstrap with this node unless another node got
    /// there first. Returns the bootstrap in charge afterwards.
    fn elect_bootstrap(&self, failed: NodeId) -> NodeId;
}

pub type BootRef = Arc<dyn BootComponent>;

struct IdAllocator {
    filter: NodeIdFilter,
    seed: i32,
}

/// Cluster membership for an in-process cluster.
///
/// New node ids are CRC16 hashes of an increasing seed, probed until the id
/// is unused. The first registered superpeer becomes the bootstrap.
pub struct NodeRegistry {
    entries: DashMap<NodeId, NodeEntry>,
    ids: Mutex<IdAllocator>,
    bootstrap: Mutex<Option<NodeId>>,
    failed: DashSet<NodeId>,
    expected_superpeers: usize,
}

impl NodeRegistry {
    pub fn new(expected_superpeers: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ids: Mutex::new(IdAllocator {
                filter: NodeIdFilter::new(),
                seed: 1,
            }),
            bootstrap: Mutex::new(None),
            failed: DashSet::new(),
            expected_superpeers,
        })
    }

    pub fn register(&self, address: SocketAddr, role: NodeRole) -> Result<NodeId> {
        let id = {
            let mut ids = lock(&self.ids);
            let IdAllocator { filter, seed } = &mut *ids;
            filter.next_free(seed).context(BootSnafu {
                reason: "node id space exhausted",
            })?
        };
        self.insert(NodeEntry::new(id, address, role));
        Ok(id)
    }

    pub fn register_with_id(&self, id: NodeId, address: SocketAddr, role: NodeRole) -> Result<()> {
        ensure!(
            id != INVALID_NODE_ID,
            BootSnafu {
                reason: "0xFFFF is not a node id"
            }
        );
        {
            let mut ids = lock(&self.ids);
            ensure!(
                !ids.filter.contains(id),
                BootSnafu {
                    reason: format!("node id 0x{id:04X} is taken"),
                }
            );
            ids.filter.add(id);
        }
        self.insert(NodeEntry::new(id, address, role));
        Ok(())
    }

    fn insert(&self, entry: NodeEntry) {
        info!("register {entry}");
        if entry.role.is_superpeer() {
            let mut bootstrap = lock(&self.bootstrap);
            if bootstrap.is_none() {
                *bootstrap = Some(entry.node_id);
            }
        }
        self.entries.insert(entry.node_id, entry);
    }

    pub fn entry(&self, node: NodeId) -> Option<NodeEntry> { self.entries.get(&node).map(|e| e.clone()) }

    pub fn bootstrap(&self) -> Option<NodeId> { *lock(&self.bootstrap) }

    pub fn is_failed(&self, node: NodeId) -> bool { self.failed.contains(&node) }

    pub fn nodes_with_role(&self, role: NodeRole) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.role == role && !self.failed.contains(&e.node_id))
            .map(|e| e.node_id)
            .collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn boot_handle(self: &Arc<Self>, node: NodeId) -> Arc<RegistryBoot> {
        Arc::new(RegistryBoot {
            registry: self.clone(),
            node,
        })
    }
}

/// A node's view of a [NodeRegistry].
pub struct RegistryBoot {
    registry: Arc<NodeRegistry>,
    node: NodeId,
}

impl BootComponent for RegistryBoot {
    fn node_id(&self) -> NodeId { self.node }

    fn node_role(&self) -> NodeRole {
        self.registry
            .entries
            .get(&self.node)
            .map(|e| e.role)
            .unwrap_or(NodeRole::Peer)
    }

    fn bootstrap_id(&self) -> NodeId { self.registry.bootstrap().unwrap_or(INVALID_NODE_ID) }

    fn expected_superpeers(&self) -> usize { self.registry.expected_superpeers }

    fn node_available(&self, node: NodeId) -> bool {
        self.registry
            .entries
            .get(&node)
            .is_some_and(|e| e.role.is_persistent())
    }

    fn report_node_failure(&self, node: NodeId, is_superpeer: bool) {
        if self.registry.failed.insert(node) {
            warn!(
                "0x{:04X} reports failure of {} 0x{node:04X}",
                self.node,
                if is_superpeer { "superpeer" } else { "peer" }
            );
        }
    }

    fn promote_to_superpeer(&self) {
        if let Some(mut entry) = self.registry.entries.get_mut(&self.node) {
            entry.role = NodeRole::Superpeer;
        }
    }

    fn elect_bootstrap(&self, failed: NodeId) -> NodeId {
        let mut bootstrap = lock(&self.registry.bootstrap);
        if *bootstrap == Some(failed) || bootstrap.is_none() {
            info!("0x{:04X} becomes the bootstrap, replacing 0x{failed:04X}", self.node);
            *bootstrap = Some(self.node);
        }
        bootstrap.unwrap_or(self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr { "127.0.0.1:22222".parse().unwrap() }

    #[test]
    fn hashed_ids_are_unique() {
        let registry = NodeRegistry::new(1);
        let sp = registry.register(addr(), NodeRole::Superpeer).unwrap();
        let peers: Vec<_> = (0..50)
            .map(|_| registry.register(addr(), NodeRole::Peer).unwrap())
            .collect();
        assert!(!peers.contains(&sp));
        assert!(!peers.contains(&INVALID_NODE_ID));
        let mut dedup = peers.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), 50);
        assert_eq!(registry.bootstrap(), Some(sp));
        assert_eq!(registry.nodes_with_role(NodeRole::Peer), dedup);
    }

    #[test]
    fn explicit_ids_and_roles() {
        let registry = NodeRegistry::new(2);
        registry.register_with_id(10, addr(), NodeRole::Peer).unwrap();
        registry.register_with_id(20, addr(), NodeRole::Superpeer).unwrap();
        registry.register_with_id(30, addr(), NodeRole::Monitor).unwrap();
        assert!(registry.register_with_id(20, addr(), NodeRole::Peer).is_err());
        assert!(registry.register_with_id(INVALID_NODE_ID, addr(), NodeRole::Peer).is_err());

        let boot = registry.boot_handle(10);
        assert_eq!(boot.bootstrap_id(), 20);
        assert_eq!(boot.expected_superpeers(), 2);
        assert!(boot.node_available(10));
        assert!(!boot.node_available(30));
        assert!(!boot.node_available(40));

        boot.promote_to_superpeer();
        assert_eq!(boot.node_role(), NodeRole::Superpeer);
    }

    #[test]
    fn bootstrap_election_is_first_come() {
        let registry = NodeRegistry::new(3);
        for id in [1, 2, 3] {
            registry.register_with_id(id, addr(), NodeRole::Superpeer).unwrap();
        }
        assert_eq!(registry.bootstrap(), Some(1));
        assert_eq!(registry.boot_handle(3).elect_bootstrap(1), 3);
        assert_eq!(registry.boot_handle(2).elect_bootstrap(1), 3);

        registry.boot_handle(3).report_node_failure(1, true);
        assert!(registry.is_failed(1));
        assert_eq!(registry.nodes_with_role(NodeRole::Superpeer), vec![2, 3]);
    }
}
