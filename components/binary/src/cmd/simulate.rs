use std::collections::BTreeSet;

use clap::Args;
use dxram_common::RING_SIZE;
use dxram_lookup::{Cluster, LookupConfig, RangeStart};
use dxram_types::{chunk_id::chunk_id, Locations, NodeId};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use snafu::{ensure_whatever, OptionExt, ResultExt, Whatever};
use tracing::info;

const OVERLAY_OPTIONS_HEADER: &str = "OVERLAY";

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 4, help = "Number of superpeers, spread evenly over the ring", help_heading = OVERLAY_OPTIONS_HEADER)]
    superpeers: u16,

    #[arg(long, default_value_t = 8, help = "Number of peers", help_heading = OVERLAY_OPTIONS_HEADER)]
    peers: u16,

    #[arg(long, default_value_t = 100, help = "Chunks each peer looks up after the ranges are set")]
    chunks: u64,

    #[arg(long, help = "Disconnect this superpeer (by position on the ring) and let the overlay repair itself")]
    fail_superpeer: Option<usize>,

    #[arg(long, help = "Seed for the peer ids, random when unset")]
    seed: Option<u64>,
}

impl SimulateArgs {
    pub fn run(self, config: LookupConfig) -> Result<(), Whatever> {
        ensure_whatever!(self.superpeers > 0, "at least one superpeer is needed");
        ensure_whatever!(
            u32::from(self.superpeers) + u32::from(self.peers) < u32::from(NodeId::MAX),
            "not enough node ids for {} nodes",
            u32::from(self.superpeers) + u32::from(self.peers)
        );
        let seed = self.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);

        let superpeers = superpeer_ids(self.superpeers);
        let peers = peer_ids(&mut rng, &superpeers, self.peers);
        info!(seed, ?superpeers, peers = peers.len(), "starting overlay");

        let mut cluster = Cluster::new(superpeers.len(), config);
        for id in &superpeers {
            cluster.add_superpeer(*id).with_whatever_context(|e| format!("superpeer 0x{id:04X}: {e}"))?;
        }
        for id in &peers {
            let peer = cluster.add_peer(*id).with_whatever_context(|e| format!("peer 0x{id:04X}: {e}"))?;
            let backups: Vec<NodeId> = peers
                .choose_multiple(&mut rng, 3)
                .copied()
                .filter(|backup| backup != id)
                .collect();
            peer.init_range(RangeStart::Chunks(chunk_id(*id, 0)), Locations::new(*id, backups))
                .with_whatever_context(|e| format!("init range of 0x{id:04X}: {e}"))?;
            peer.insert_id(u32::from(*id), chunk_id(*id, 1))
                .with_whatever_context(|e| format!("insert id of 0x{id:04X}: {e}"))?;
        }
        cluster.stabilize_all();
        let looked_up = self.check_lookups(&cluster, &peers, &mut rng)?;
        println!("seed: {seed}");
        println!("{looked_up} lookups answered");

        if let Some(position) = self.fail_superpeer {
            let failed = *superpeers
                .get(position)
                .with_whatever_context(|| format!("there are only {} superpeers", superpeers.len()))?;
            ensure_whatever!(superpeers.len() > 1, "the last superpeer cannot fail");
            let successor = superpeers[(position + 1) % superpeers.len()];

            cluster.disconnect(failed);
            let observer = cluster.node(successor).whatever_context("successor is not running")?;
            observer.failure_handling(failed);
            cluster.stabilize_all();
            cluster.stabilize_all();

            for event in cluster.drain_events() {
                println!("event: {event:?}");
            }
            let looked_up = self.check_lookups(&cluster, &peers, &mut rng)?;
            println!("{looked_up} lookups answered after 0x{failed:04X} failed");
        }

        for node in cluster.nodes().filter(|n| n.is_superpeer() && cluster.is_connected(n.node_id())) {
            println!("{}", node.overlay_to_string());
            println!("  mappings {}", node.mapping_len());
        }
        cluster.shutdown();
        Ok(())
    }

    /// Every connected peer looks up chunks of random creators and the id of
    /// one random peer.
    fn check_lookups(&self, cluster: &Cluster, peers: &[NodeId], rng: &mut StdRng) -> Result<u64, Whatever> {
        let live: Vec<NodeId> = peers.iter().copied().filter(|p| cluster.is_connected(*p)).collect();
        let mut answered = 0;
        for id in &live {
            let node = cluster.node(*id).whatever_context("peer is not running")?;
            for _ in 0..self.chunks {
                let Some(&creator) = live.choose(rng) else { break };
                let cid = chunk_id(creator, rng.gen_range(0..1 << 20));
                let locations = node
                    .get(cid)
                    .with_whatever_context(|e| format!("0x{id:04X} failed to look up 0x{cid:016X}: {e}"))?
                    .with_whatever_context(|| format!("0x{cid:016X} has no location"))?;
                ensure_whatever!(
                    locations.primary == creator,
                    "0x{cid:016X} is located at 0x{:04X}",
                    locations.primary
                );
                answered += 1;
            }
            if let Some(&other) = live.choose(rng) {
                let found = node
                    .get_chunk_id(u32::from(other))
                    .with_whatever_context(|e| format!("0x{id:04X} failed to resolve an id: {e}"))?;
                ensure_whatever!(found == Some(chunk_id(other, 1)), "id of 0x{other:04X} resolved to {found:?}");
            }
        }
        Ok(answered)
    }
}

/// `count` ids spread evenly over the ring, never 0.
fn superpeer_ids(count: u16) -> Vec<NodeId> {
    let step = RING_SIZE / u32::from(count);
    (0..u32::from(count)).map(|i| (i * step + step / 2) as NodeId).collect()
}

fn peer_ids(rng: &mut StdRng, taken: &[NodeId], count: u16) -> Vec<NodeId> {
    let taken: BTreeSet<NodeId> = taken.iter().copied().collect();
    let mut peers = BTreeSet::new();
    while peers.len() < usize::from(count) {
        let id: NodeId = rng.gen_range(1..NodeId::MAX);
        if !taken.contains(&id) {
            peers.insert(id);
        }
    }
    peers.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn superpeers_are_spread() {
        assert_eq!(superpeer_ids(1), vec![0x8000]);
        assert_eq!(superpeer_ids(4), vec![0x2000, 0x6000, 0xA000, 0xE000]);
    }

    #[test]
    fn peers_avoid_superpeer_ids() {
        let mut rng = StdRng::seed_from_u64(1);
        let superpeers = superpeer_ids(2);
        let peers = peer_ids(&mut rng, &superpeers, 50);
        assert_eq!(peers.len(), 50);
        assert!(peers.iter().all(|p| !superpeers.contains(p)));
    }

    #[test]
    fn every_peer_resolves_every_creator() {
        let config = LookupConfig {
            stabilization_interval: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(4),
            ..Default::default()
        };
        let args = SimulateArgs {
            superpeers: 4,
            peers: 6,
            chunks: 5,
            fail_superpeer: None,
            seed: Some(3),
        };
        args.run(config).unwrap();
    }
}
