//! Iterative Kademlia `find_node` and `get_peers`. Both share the same
//! shortlist/frontier management and termination rules (§4.G); they're
//! kept as separate driver loops because `get_peers` accumulates peer
//! values and announce tokens alongside the node frontier, which
//! `find_node` has no use for.

use std::collections::HashSet;
use std::net::SocketAddr;

use core::NodeId;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::trace;

use crate::bprotocol::CompactNodeInfo;
use crate::dht::Dht;

pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_MAX_QUERIES: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct LookupConfig {
    pub alpha: usize,
    pub k: usize,
    pub max_iterations: usize,
    pub max_queries: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            alpha: DEFAULT_ALPHA,
            k: crate::routing_table::DEFAULT_K,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_queries: DEFAULT_MAX_QUERIES,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    id: NodeId,
    addr: SocketAddr,
    queried: bool,
}

struct Frontier {
    target: NodeId,
    seen: HashSet<(NodeId, SocketAddr)>,
    candidates: Vec<Candidate>,
}

impl Frontier {
    fn seeded(dht: &Dht, target: NodeId, k: usize) -> Self {
        let mut f = Frontier { target, seen: HashSet::new(), candidates: Vec::new() };
        for n in dht.routing_table().read().closest(&target, k) {
            f.insert(n.id, n.addr);
        }
        f
    }

    fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        if self.seen.insert((id, addr)) {
            self.candidates.push(Candidate { id, addr, queried: false });
        }
    }

    fn insert_compact(&mut self, nodes: impl IntoIterator<Item = CompactNodeInfo>) {
        for n in nodes {
            self.insert(n.id, SocketAddr::V4(n.addr));
        }
    }

    fn sort(&mut self) {
        let target = self.target;
        self.candidates.sort_by(|a, b| target.distance(&a.id).cmp(&target.distance(&b.id)).then(a.id.cmp(&b.id)));
    }

    /// Up to `alpha` of the closest not-yet-queried candidates, marked
    /// queried as they're handed out.
    fn next_round(&mut self, alpha: usize) -> Vec<Candidate> {
        self.sort();
        let picked: Vec<Candidate> = self.candidates.iter().filter(|c| !c.queried).take(alpha).copied().collect();
        for p in &picked {
            if let Some(c) = self.candidates.iter_mut().find(|c| c.id == p.id && c.addr == p.addr) {
                c.queried = true;
            }
        }
        picked
    }

    fn closest(&mut self, k: usize) -> Vec<Candidate> {
        self.sort();
        self.candidates.iter().take(k).copied().collect()
    }
}

pub async fn find_node(dht: &Dht, target: NodeId, cfg: LookupConfig) -> Vec<CompactNodeInfo> {
    let mut frontier = Frontier::seeded(dht, target, cfg.k);
    let mut queries_issued = 0usize;

    for iteration in 0..cfg.max_iterations {
        let round = frontier.next_round(cfg.alpha);
        let converged = round.is_empty()
            || queries_issued >= cfg.max_queries
            || frontier.closest(cfg.k).iter().all(|c| c.queried);
        if converged {
            trace!(iteration, queries_issued, "find_node lookup converged");
            break;
        }
        queries_issued += round.len();

        let mut futs = FuturesUnordered::new();
        for cand in round {
            let dht = dht.clone();
            futs.push(async move { dht.query_find_node(cand.addr, target).await.ok() });
        }
        while let Some(result) = futs.next().await {
            if let Some((_id, nodes)) = result {
                frontier.insert_compact(nodes);
            }
        }
    }

    frontier
        .closest(cfg.k)
        .into_iter()
        .filter_map(|c| match c.addr {
            SocketAddr::V4(v4) => Some(CompactNodeInfo { id: c.id, addr: v4 }),
            SocketAddr::V6(_) => None,
        })
        .collect()
}

pub struct GetPeersOutcome {
    pub peers: Vec<SocketAddr>,
    /// `(node id, addr, token)` for the closest responding nodes,
    /// suitable for a follow-up `announce_peer` even when no peers were
    /// ever returned.
    pub announce_targets: Vec<(NodeId, SocketAddr, Vec<u8>)>,
}

pub async fn get_peers(dht: &Dht, info_hash: NodeId, cfg: LookupConfig) -> GetPeersOutcome {
    let mut frontier = Frontier::seeded(dht, info_hash, cfg.k);
    let mut peer_seen: HashSet<SocketAddr> = HashSet::new();
    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut announce_targets: Vec<(NodeId, SocketAddr, Vec<u8>)> = Vec::new();
    let mut queries_issued = 0usize;

    for iteration in 0..cfg.max_iterations {
        let round = frontier.next_round(cfg.alpha);
        let converged = round.is_empty()
            || queries_issued >= cfg.max_queries
            || frontier.closest(cfg.k).iter().all(|c| c.queried);
        if converged {
            trace!(iteration, queries_issued, "get_peers lookup converged");
            break;
        }
        queries_issued += round.len();

        let mut futs = FuturesUnordered::new();
        for cand in round {
            let dht = dht.clone();
            futs.push(async move {
                let result = dht.query_get_peers(cand.addr, info_hash).await.ok();
                (cand, result)
            });
        }
        while let Some((cand, result)) = futs.next().await {
            if let Some((resp_id, result)) = result {
                for v in result.values {
                    if peer_seen.insert(v) {
                        peers.push(v);
                    }
                }
                frontier.insert_compact(result.nodes);
                announce_targets.push((resp_id, cand.addr, result.token));
            }
        }
    }

    // `announce_peer` should target the nodes closest to the hash, not
    // simply the order replies arrived in.
    announce_targets.sort_by(|a, b| info_hash.distance(&a.0).cmp(&info_hash.distance(&b.0)));
    announce_targets.truncate(cfg.k);

    GetPeersOutcome { peers, announce_targets }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_dedups_by_id_and_addr() {
        let id = NodeId::random();
        let addr = SocketAddr::from(([1, 2, 3, 4], 6881));
        let mut f = Frontier { target: NodeId::random(), seen: HashSet::new(), candidates: Vec::new() };
        f.insert(id, addr);
        f.insert(id, addr);
        assert_eq!(f.candidates.len(), 1);
    }
}
