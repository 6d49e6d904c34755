use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use crossbeam_channel::Receiver;
use dxram_types::{NodeId, NodeRole};
use tracing::info;

use crate::{
    boot::NodeRegistry,
    component::{LookupComponent, LookupComponentRef},
    config::LookupConfig,
    err::Result,
    event::{ChannelEventSink, OverlayEvent},
    network::LocalNetwork,
    recovery::{LoggingRecovery, RecoveryTrigger},
};

/// An in-process overlay: every node runs its lookup component on a shared
/// [LocalNetwork] and registers with one [NodeRegistry].
pub struct Cluster {
    network: Arc<LocalNetwork>,
    registry: Arc<NodeRegistry>,
    config: LookupConfig,
    events: Arc<ChannelEventSink>,
    received: Receiver<OverlayEvent>,
    recovery: Arc<dyn RecoveryTrigger>,
    nodes: BTreeMap<NodeId, LookupComponentRef>,
}

impl Cluster {
    pub fn new(expected_superpeers: usize, config: LookupConfig) -> Self {
        let (events, received) = ChannelEventSink::new();
        Self {
            network: LocalNetwork::new(),
            registry: NodeRegistry::new(expected_superpeers),
            config,
            events: Arc::new(events),
            received,
            recovery: Arc::new(LoggingRecovery),
            nodes: BTreeMap::new(),
        }
    }

    /// Recovery used by nodes added from now on.
    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryTrigger>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Starts a superpeer. The first one opens the ring.
    pub fn add_superpeer(&mut self, id: NodeId) -> Result<LookupComponentRef> { self.add(id, NodeRole::Superpeer) }

    pub fn add_peer(&mut self, id: NodeId) -> Result<LookupComponentRef> { self.add(id, NodeRole::Peer) }

    fn add(&mut self, id: NodeId, role: NodeRole) -> Result<LookupComponentRef> {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, 22222));
        self.registry.register_with_id(id, address, role)?;
        let node = LookupComponent::builder(self.network.endpoint(id), self.registry.boot_handle(id))
            .config(self.config.clone())
            .events(self.events.clone())
            .recovery(self.recovery.clone())
            .build();
        node.start()?;
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&LookupComponentRef> { self.nodes.get(&id) }

    pub fn nodes(&self) -> impl Iterator<Item = &LookupComponentRef> { self.nodes.values() }

    pub fn registry(&self) -> &Arc<NodeRegistry> { &self.registry }

    /// Cuts `id` off the network; it neither sends nor receives any more.
    pub fn disconnect(&self, id: NodeId) {
        info!("disconnect 0x{id:04X}");
        self.network.disconnect(id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool { self.network.is_connected(id) }

    /// One stabilization round on every connected superpeer, in id order.
    pub fn stabilize_all(&self) {
        for (id, node) in &self.nodes {
            if self.network.is_connected(*id) && node.is_superpeer() {
                node.stabilize_once();
            }
        }
    }

    /// Events fired since the last call.
    pub fn drain_events(&self) -> Vec<OverlayEvent> { self.received.try_iter().collect() }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) { self.shutdown(); }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::Mutex,
        thread,
        time::Duration,
    };

    use dxram_types::{chunk_id::chunk_id, BackupRange, Locations};

    use super::*;
    use crate::{cid_tree::RangeStart, component::PromotionOutcome, message::LookupMessage, network::Network};

    fn config() -> LookupConfig {
        LookupConfig {
            stabilization_interval: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn own_range(creator: NodeId, backups: Vec<NodeId>) -> (RangeStart, Locations) {
        (RangeStart::Chunks(chunk_id(creator, 0)), Locations::new(creator, backups))
    }

    #[derive(Default)]
    struct RecordingRecovery {
        refuse: Vec<NodeId>,
        calls: Mutex<Vec<(NodeId, NodeId)>>,
    }

    impl RecoveryTrigger for RecordingRecovery {
        fn recover(&self, owner: NodeId, _range: &BackupRange, backup_peer: NodeId) -> bool {
            self.calls.lock().unwrap().push((owner, backup_peer));
            !self.refuse.contains(&backup_peer)
        }
    }

    #[test]
    fn single_superpeer_serves_its_peer() {
        let mut cluster = Cluster::new(1, config());
        let superpeer = cluster.add_superpeer(1).unwrap();
        let peer = cluster.add_peer(0x10).unwrap();
        assert_eq!(superpeer.peers(), vec![0x10]);
        assert_eq!(peer.my_superpeer(), Some(1));
        assert!(superpeer.is_last_superpeer());
        assert!(!peer.is_last_superpeer());

        let (start, locations) = own_range(0x10, vec![]);
        peer.init_range(start, locations).unwrap();
        assert_eq!(
            peer.get(chunk_id(0x10, 500)).unwrap(),
            Some(Locations::new(0x10, vec![]))
        );
        assert!(superpeer.init_range(start, Locations::new(1, vec![])).is_err());
    }

    fn ring_after_joining(order: [NodeId; 2]) -> Vec<(NodeId, Option<NodeId>, Option<NodeId>)> {
        let mut cluster = Cluster::new(3, config());
        cluster.add_superpeer(100).unwrap();
        for id in order {
            cluster.add_superpeer(id).unwrap();
        }
        [100, 200, 300]
            .into_iter()
            .map(|id| {
                let node = cluster.node(id).unwrap();
                (id, node.predecessor(), node.successor())
            })
            .collect()
    }

    #[test]
    fn join_order_does_not_matter() {
        let expected = vec![
            (100, Some(300), Some(200)),
            (200, Some(100), Some(300)),
            (300, Some(200), Some(100)),
        ];
        assert_eq!(ring_after_joining([200, 300]), expected);
        assert_eq!(ring_after_joining([300, 200]), expected);
    }

    /// Three superpeers with peers spread over the ring, every peer owning
    /// one backup range.
    fn three_superpeers() -> Cluster {
        let mut cluster = Cluster::new(3, config());
        for id in [1000, 20000, 40000] {
            cluster.add_superpeer(id).unwrap();
        }
        for id in [5000, 8000, 500, 60000] {
            let peer = cluster.add_peer(id).unwrap();
            let backups = if id == 8000 { vec![5000] } else { vec![8000] };
            let (start, locations) = own_range(id, backups);
            peer.init_range(start, locations).unwrap();
        }
        cluster
    }

    #[test]
    fn peers_join_their_responsible_superpeer() {
        let cluster = three_superpeers();
        assert_eq!(cluster.node(1000).unwrap().peers(), vec![500, 60000]);
        assert_eq!(cluster.node(20000).unwrap().peers(), vec![5000, 8000]);
        assert!(cluster.node(40000).unwrap().peers().is_empty());
        let peer = cluster.node(5000).unwrap();
        assert_eq!(peer.superpeers(), vec![1000, 20000, 40000]);
        assert!(peer.overlay_is_stable());

        // 20000 holds its own creators and backs up 1000's.
        let observer = cluster.node(20000).unwrap();
        assert_eq!(observer.tree_creators(), vec![500, 5000, 8000, 60000]);
    }

    #[test]
    fn metadata_updates_reach_the_replicas() {
        let cluster = three_superpeers();
        let peer = cluster.node(5000).unwrap();
        let cid = chunk_id(5000, 7);

        assert_eq!(peer.get(cid).unwrap(), Some(Locations::new(5000, vec![8000])));
        peer.migrate(cid, 8000).unwrap();
        assert_eq!(peer.get(cid).unwrap(), Some(Locations::new(8000, vec![])));
        peer.migrate_range(chunk_id(5000, 10), chunk_id(5000, 20), 8000).unwrap();
        assert_eq!(peer.get(chunk_id(5000, 15)).unwrap(), Some(Locations::new(8000, vec![])));
        peer.remove(&[cid]).unwrap();
        assert_eq!(peer.get(cid).unwrap(), None);

        let replica = cluster.node(40000).unwrap().cid_tree(5000).unwrap();
        assert_eq!(replica.get_metadata(cid), None);
        assert_eq!(replica.get_metadata(chunk_id(5000, 20)), Some(Locations::new(8000, vec![])));
        assert_eq!(
            replica.get_metadata(chunk_id(5000, 21)),
            Some(Locations::new(5000, vec![8000]))
        );

        assert!(peer
            .migrate_range(chunk_id(5000, 2), chunk_id(8000, 3), 500)
            .unwrap_err()
            .to_string()
            .contains("more than one creator"));
        assert_eq!(
            peer.get_all_backup_ranges(5000).unwrap(),
            vec![BackupRange::new(chunk_id(5000, 0), vec![8000])]
        );
    }

    #[test]
    fn id_mappings() {
        let cluster = three_superpeers();
        let peer = cluster.node(8000).unwrap();
        peer.insert_id(42, chunk_id(5000, 1)).unwrap();
        peer.insert_id(43, chunk_id(5000, 2)).unwrap();
        peer.insert_id(42, chunk_id(5000, 3)).unwrap();

        assert_eq!(peer.get_chunk_id(42).unwrap(), Some(chunk_id(5000, 3)));
        assert_eq!(peer.get_chunk_id(44).unwrap(), None);
        assert_eq!(peer.get_mapping_count().unwrap(), 2);
        // Every superpeer holds a replica.
        for id in [1000, 20000, 40000] {
            assert_eq!(cluster.node(id).unwrap().mapping_len(), 2);
        }
    }

    #[test]
    fn failed_predecessor_is_replaced_by_a_peer() {
        let cluster = three_superpeers();
        let observer = cluster.node(20000).unwrap();
        let all_peers: BTreeSet<NodeId> = [500, 5000, 8000, 60000].into();

        cluster.disconnect(1000);
        observer.failure_handling(1000);

        let promoted = cluster.node(500).unwrap();
        assert!(promoted.is_superpeer());
        assert_eq!(cluster.registry().entry(500).unwrap().role, NodeRole::Superpeer);
        assert_eq!(cluster.registry().bootstrap(), Some(20000));

        let observed: BTreeSet<NodeId> = observer.tree_creators().into_iter().collect();
        assert!(observed.is_superset(&all_peers));
        let mut peers: BTreeSet<NodeId> = observer.peers().into_iter().collect();
        peers.extend(promoted.peers());
        peers.insert(500);
        assert_eq!(peers, all_peers);

        assert_eq!(observer.predecessor(), Some(500));
        assert_eq!(promoted.successor(), Some(20000));
        assert_eq!(promoted.predecessor(), Some(40000));
        assert_eq!(cluster.node(40000).unwrap().successor(), Some(500));
        assert!(!promoted.cid_tree(500).unwrap().is_active());

        let events = cluster.drain_events();
        let promotions = events
            .iter()
            .filter(|e| matches!(e, OverlayEvent::PromotionStarted { .. }))
            .count();
        assert_eq!(promotions, 1);
        assert!(events.contains(&OverlayEvent::NodeFailure { node: 1000, role: NodeRole::Superpeer }));
        assert!(events.contains(&OverlayEvent::PeerPromoted { node: 500 }));

        // A peer still routing to the failed superpeer finds the new one.
        let peer = cluster.node(5000).unwrap();
        assert_eq!(
            peer.get(chunk_id(60000, 3)).unwrap(),
            Some(Locations::new(60000, vec![8000]))
        );
        assert_eq!(peer.superpeers(), vec![20000, 40000]);

        cluster.stabilize_all();
        assert_eq!(cluster.node(40000).unwrap().superpeers(), vec![500, 20000]);
        for (id, predecessor, successor) in [(500, 40000, 20000), (20000, 500, 40000), (40000, 20000, 500)] {
            let node = cluster.node(id).unwrap();
            assert_eq!((node.predecessor(), node.successor()), (Some(predecessor), Some(successor)));
            assert!(node.overlay_is_stable());
        }
    }

    #[test]
    fn failed_peer_is_recovered_once() {
        let recovery = Arc::new(RecordingRecovery {
            refuse: vec![0x20],
            ..Default::default()
        });
        let mut cluster = Cluster::new(1, config()).with_recovery(recovery.clone());
        let superpeer = cluster.add_superpeer(1).unwrap();
        for id in [0x10, 0x20, 0x30] {
            cluster.add_peer(id).unwrap();
        }
        let (start, locations) = own_range(0x10, vec![0x20, 0x30]);
        cluster.node(0x10).unwrap().init_range(start, locations).unwrap();

        cluster.disconnect(0x10);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| superpeer.failure_handling(0x10));
            }
        });
        superpeer.failure_handling(0x10);

        assert_eq!(*recovery.calls.lock().unwrap(), vec![(0x10, 0x20), (0x10, 0x30)]);
        assert_eq!(superpeer.peers(), vec![0x20, 0x30]);
        assert!(!superpeer.cid_tree(0x10).unwrap().is_active());
        assert!(cluster.registry().is_failed(0x10));

        let failures: Vec<_> = cluster
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, OverlayEvent::NodeFailure { .. }))
            .collect();
        assert_eq!(failures, vec![OverlayEvent::NodeFailure { node: 0x10, role: NodeRole::Peer }]);
    }

    #[test]
    fn last_superpeer_is_the_one_nobody_answers() {
        let mut cluster = Cluster::new(2, config());
        let superpeer = cluster.add_superpeer(100).unwrap();
        cluster.add_superpeer(200).unwrap();
        let peer = cluster.add_peer(50).unwrap();
        assert!(!superpeer.is_last_superpeer());

        // 200 is still listed, it only stopped answering.
        cluster.disconnect(200);
        assert_eq!(superpeer.superpeers(), vec![200]);
        assert!(superpeer.is_last_superpeer());
        assert!(!peer.is_last_superpeer());
    }

    #[test]
    fn creators_are_available_while_they_answer() {
        let cluster = three_superpeers();
        let observer = cluster.node(20000).unwrap();
        assert!(observer.creator_available(5000));
        assert!(!observer.creator_available(1000));
        assert!(!observer.creator_available(20000));

        // A peer asking leaves the creator's view of the ring alone.
        let peer = cluster.node(8000).unwrap();
        assert!(peer.creator_available(500));
        assert!(peer.creator_available(8000));
        assert_eq!(cluster.node(500).unwrap().superpeers(), vec![1000, 20000, 40000]);
        assert_eq!(cluster.node(500).unwrap().my_superpeer(), Some(1000));

        cluster.disconnect(5000);
        assert!(!observer.creator_available(5000));
        assert!(!peer.creator_available(5000));
    }

    fn delegate(cluster: &Cluster, to: NodeId, hops: u16) {
        let message = LookupMessage::DelegatePromotePeerMessage { hops }.into_envelope(7, to).unwrap();
        cluster.network.endpoint(7).send(message).unwrap();
    }

    #[test]
    fn delegated_promotion_stops_after_two_rounds() {
        let cluster = three_superpeers();
        cluster.drain_events();

        // Every superpeer knows two others, so four hops is the limit.
        delegate(&cluster, 20000, 4);
        delegate(&cluster, 40000, 3);
        assert!(cluster.drain_events().is_empty());
        assert_eq!(cluster.node(1000).unwrap().peers(), vec![500, 60000]);
        assert_eq!(cluster.node(20000).unwrap().peers(), vec![5000, 8000]);

        // 40000 has no peer to spare and passes the promotion on.
        delegate(&cluster, 40000, 1);
        let promoted: Vec<NodeId> = cluster
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                OverlayEvent::PeerPromoted { node } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(promoted.len(), 1);
        assert!([500, 5000, 8000, 60000].contains(&promoted[0]));
        assert!(cluster.node(promoted[0]).unwrap().is_superpeer());
        assert!(cluster.node(40000).unwrap().peers().is_empty());
    }

    #[test]
    fn join_drops_trees_outside_the_backed_up_area() {
        let mut cluster = Cluster::new(5, config());
        for id in [10000, 20000, 30000, 40000] {
            cluster.add_superpeer(id).unwrap();
        }
        for id in [15000, 25000, 35000, 45000] {
            let peer = cluster.add_peer(id).unwrap();
            let (start, locations) = own_range(id, vec![]);
            peer.init_range(start, locations).unwrap();
        }
        // With four superpeers every one backs up all others.
        let observer = cluster.node(20000).unwrap().clone();
        assert_eq!(observer.tree_creators(), vec![15000, 25000, 35000, 45000]);

        cluster.add_superpeer(50000).unwrap();
        for _ in 0..5 {
            cluster.stabilize_all();
        }
        assert_eq!(observer.superpeers(), vec![10000, 30000, 40000, 50000]);
        // 25000 belongs to 30000, which 20000 no longer backs up.
        assert_eq!(observer.tree_creators(), vec![15000, 35000, 45000]);
        assert!(cluster.node(30000).unwrap().cid_tree(25000).is_some());
    }

    #[test]
    fn restored_chunks_are_found_at_the_restorer() {
        let cluster = three_superpeers();
        let owner = cluster.node(5000).unwrap();
        owner.migrate(chunk_id(5000, 9), 500).unwrap();

        cluster.disconnect(5000);
        let restorer = cluster.node(60000).unwrap();
        restorer.update_all_after_recovery(5000).unwrap();

        let peer = cluster.node(8000).unwrap();
        assert_eq!(
            peer.get(chunk_id(5000, 3)).unwrap(),
            Some(Locations::new(60000, vec![8000]))
        );
        assert_eq!(peer.get(chunk_id(5000, 9)).unwrap(), Some(Locations::new(500, vec![])));
        assert_eq!(cluster.node(20000).unwrap().cid_tree(5000).unwrap().restorer(), Some(60000));
    }

    #[test]
    fn stopped_peer_refuses_promotion() {
        let mut cluster = Cluster::new(2, config());
        let superpeer = cluster.add_superpeer(100).unwrap();
        for id in [10, 20, 30] {
            cluster.add_peer(id).unwrap();
        }
        let candidate = cluster.node(20).unwrap().clone();
        candidate.shutdown();

        assert_eq!(superpeer.promote(20, true), PromotionOutcome::Failed);
        assert!(!candidate.is_superpeer());
        assert_eq!(candidate.role(), NodeRole::Peer);
        assert_eq!(cluster.registry().entry(20).unwrap().role, NodeRole::Peer);
        assert_eq!(candidate.my_superpeer(), Some(100));
        assert!(candidate.tree_creators().is_empty());
        assert_eq!(superpeer.peers(), vec![10, 20, 30]);
    }
}
