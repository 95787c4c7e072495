//! K-bucket routing table keyed by XOR distance to the local node ID.
//!
//! Buckets are represented as `(prefix, depth)` pairs rather than as an
//! explicit binary trie of bucket objects: a bucket's range is exactly the
//! set of IDs sharing its `prefix`'s first `depth` bits. Splitting a
//! bucket replaces it with two buckets at `depth + 1`; every other bucket
//! is left untouched, so only the branch containing the local ID ever
//! grows deeper — matching the invariant that only that branch may split.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use core::NodeId;
use tracing::{debug, trace};

pub const DEFAULT_K: usize = 8;
const MAX_DEPTH: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    /// Set once this node failed to answer a ping it was given a chance
    /// to answer. A bad node is never considered "questionable" again.
    pub failed_ping: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Node { id, addr, last_seen: Instant::now(), failed_ping: false }
    }

    pub fn status(&self, now: Instant, questionable_after: Duration) -> NodeStatus {
        if self.failed_ping {
            return NodeStatus::Bad;
        }
        if now.saturating_duration_since(self.last_seen) > questionable_after {
            NodeStatus::Questionable
        } else {
            NodeStatus::Good
        }
    }
}

#[derive(Debug)]
struct KBucket {
    prefix: NodeId,
    depth: usize,
    nodes: Vec<Node>,
    last_changed: Instant,
}

impl KBucket {
    fn contains(&self, id: &NodeId) -> bool {
        shares_prefix(&self.prefix, id, self.depth)
    }
}

fn shares_prefix(a: &NodeId, b: &NodeId, bits: usize) -> bool {
    for bit in 0..bits {
        let byte = bit / 8;
        let mask = 1u8 << (7 - (bit % 8));
        if (a.as_bytes()[byte] & mask) != (b.as_bytes()[byte] & mask) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The node was inserted or an existing entry was refreshed.
    Added,
    /// A bad entry was evicted to make room.
    Replaced { evicted: NodeId },
    /// The bucket was full of good nodes and not eligible to split; the
    /// newcomer was dropped.
    Dropped,
    /// The bucket was full but held a questionable entry: the caller must
    /// ping `probe_node_id` and report back via [`RoutingTable::resolve_probe`].
    NeedsProbe { probe_node_id: NodeId, newcomer: Node },
}

pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    questionable_after: Duration,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self::with_capacity(local_id, DEFAULT_K)
    }

    pub fn with_capacity(local_id: NodeId, k: usize) -> Self {
        RoutingTable {
            local_id,
            k,
            questionable_after: Duration::from_secs(15 * 60),
            buckets: vec![KBucket {
                prefix: NodeId::default(),
                depth: 0,
                nodes: Vec::new(),
                last_changed: Instant::now(),
            }],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_idx_containing(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .expect("buckets partition the full id space")
    }

    pub fn add(&mut self, node: Node) -> AddOutcome {
        loop {
            let idx = self.bucket_idx_containing(&node.id);
            let bucket = &mut self.buckets[idx];

            if let Some(existing) = bucket.nodes.iter_mut().find(|n| n.id == node.id) {
                existing.addr = node.addr;
                existing.last_seen = node.last_seen;
                existing.failed_ping = false;
                bucket.last_changed = Instant::now();
                return AddOutcome::Added;
            }

            if bucket.nodes.len() < self.k {
                bucket.nodes.push(node);
                bucket.last_changed = Instant::now();
                return AddOutcome::Added;
            }

            let now = Instant::now();
            if let Some(bad_idx) =
                bucket.nodes.iter().position(|n| n.status(now, self.questionable_after) == NodeStatus::Bad)
            {
                let evicted = bucket.nodes[bad_idx].id;
                bucket.nodes[bad_idx] = node;
                bucket.last_changed = Instant::now();
                return AddOutcome::Replaced { evicted };
            }

            if bucket.contains(&self.local_id) && bucket.depth < MAX_DEPTH {
                self.split(idx);
                continue;
            }

            let questionable = bucket
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.status(now, self.questionable_after) == NodeStatus::Questionable)
                .min_by_key(|(_, n)| n.last_seen);

            return match questionable {
                Some((_, n)) => AddOutcome::NeedsProbe { probe_node_id: n.id, newcomer: node },
                None => AddOutcome::Dropped,
            };
        }
    }

    /// Resolves a [`AddOutcome::NeedsProbe`] after the caller has pinged
    /// `probe_node_id`. On probe failure the probed node is evicted for
    /// the newcomer; on success the newcomer is dropped.
    pub fn resolve_probe(&mut self, probe_node_id: NodeId, probe_succeeded: bool, newcomer: Node) -> AddOutcome {
        let idx = self.bucket_idx_containing(&probe_node_id);
        let bucket = &mut self.buckets[idx];
        if probe_succeeded {
            if let Some(n) = bucket.nodes.iter_mut().find(|n| n.id == probe_node_id) {
                n.last_seen = Instant::now();
            }
            return AddOutcome::Dropped;
        }
        match bucket.nodes.iter().position(|n| n.id == probe_node_id) {
            Some(pos) => {
                bucket.nodes[pos] = newcomer;
                bucket.last_changed = Instant::now();
                AddOutcome::Replaced { evicted: probe_node_id }
            }
            None => AddOutcome::Dropped,
        }
    }

    fn split(&mut self, idx: usize) {
        let depth = self.buckets[idx].depth;
        let base_prefix = self.buckets[idx].prefix;
        let new_bit_mask = 1u8 << (7 - (depth % 8));
        let new_bit_byte = depth / 8;

        let mut prefix0 = base_prefix;
        prefix0.set_bit(depth, false);
        let mut prefix1 = base_prefix;
        prefix1.set_bit(depth, true);

        let (mut nodes0, mut nodes1) = (Vec::new(), Vec::new());
        for node in self.buckets[idx].nodes.drain(..) {
            if node.id.as_bytes()[new_bit_byte] & new_bit_mask == 0 {
                nodes0.push(node);
            } else {
                nodes1.push(node);
            }
        }

        let now = Instant::now();
        self.buckets[idx] = KBucket { prefix: prefix0, depth: depth + 1, nodes: nodes0, last_changed: now };
        self.buckets.insert(
            idx + 1,
            KBucket { prefix: prefix1, depth: depth + 1, nodes: nodes1, last_changed: now },
        );
        debug!(depth = depth + 1, "split routing table bucket");
    }

    /// Up to `k` nodes closest to `target`, sorted by XOR distance; stable
    /// on ties by node ID.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut all: Vec<Node> = self.buckets.iter().flat_map(|b| b.nodes.iter().cloned()).collect();
        all.sort_by(|a, b| target.distance(&a.id).cmp(&target.distance(&b.id)).then(a.id.cmp(&b.id)));
        all.truncate(k);
        all
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter().cloned()).collect()
    }

    /// A random ID inside the given bucket's range, used to trigger a
    /// `find_node` when that bucket has gone quiet.
    pub fn refresh_candidate(&self, bucket_idx: usize) -> Option<NodeId> {
        self.buckets.get(bucket_idx).map(|b| b.prefix.random_with_prefix(b.depth))
    }

    /// Indices of buckets that haven't changed in at least `interval`.
    pub fn stale_buckets(&self, interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| now.saturating_duration_since(b.last_changed) >= interval)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_failed_ping(&mut self, id: &NodeId) {
        let idx = self.bucket_idx_containing(id);
        if let Some(n) = self.buckets[idx].nodes.iter_mut().find(|n| n.id == *id) {
            n.failed_ping = true;
            trace!(id = %id, "marked node bad after failed ping");
        }
    }

    /// Plain `{id, addr, last_seen}` tuples for persistence, discarding
    /// the in-memory-only `failed_ping` flag (a reloaded node starts
    /// unknown, not bad).
    pub fn snapshot_entries(&self) -> Vec<(NodeId, SocketAddr, Instant)> {
        self.buckets.iter().flat_map(|b| b.nodes.iter().map(|n| (n.id, n.addr, n.last_seen))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[test]
    fn add_up_to_k_nodes_succeeds() {
        let local = NodeId::random();
        let mut rt = RoutingTable::new(local);
        for i in 0..DEFAULT_K {
            let outcome = rt.add(Node::new(NodeId::random(), addr(1000 + i as u16)));
            assert_eq!(outcome, AddOutcome::Added);
        }
        assert_eq!(rt.len(), DEFAULT_K);
    }

    #[test]
    fn splitting_only_happens_on_local_id_bucket() {
        // All-zero local id; fill far-away bucket (high bit set) beyond k
        // without ever touching the local-id branch.
        let local = NodeId([0u8; 20]);
        let mut rt = RoutingTable::with_capacity(local, 2);
        for _ in 0..2 {
            let mut id = NodeId::random();
            id.set_bit(0, true); // far branch, won't contain local id
            rt.add(Node::new(id, addr(2000)));
        }
        let mut id = NodeId::random();
        id.set_bit(0, true);
        let outcome = rt.add(Node::new(id, addr(2001)));
        assert!(matches!(outcome, AddOutcome::NeedsProbe { .. } | AddOutcome::Dropped));
        assert_eq!(rt.bucket_count(), 1, "far bucket never splits");
    }

    #[test]
    fn local_id_bucket_splits_when_full() {
        let local = NodeId::random();
        let mut rt = RoutingTable::with_capacity(local, 2);
        // All random ids initially land in the single root bucket, which
        // contains the local id, so it should split rather than drop.
        for i in 0..8 {
            rt.add(Node::new(NodeId::random(), addr(3000 + i)));
        }
        assert!(rt.bucket_count() > 1);
    }

    #[test]
    fn closest_is_sorted_by_xor_distance() {
        let local = NodeId::random();
        let mut rt = RoutingTable::with_capacity(local, 20);
        let target = NodeId::random();
        for i in 0..10 {
            rt.add(Node::new(NodeId::random(), addr(4000 + i)));
        }
        let closest = rt.closest(&target, 5);
        assert!(closest.len() <= 5);
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
        }
    }

    #[test]
    fn bad_node_is_evicted_before_probing_questionable() {
        let local = NodeId::random();
        let mut rt = RoutingTable::with_capacity(local, 1);
        let bad_id = NodeId::random();
        rt.add(Node::new(bad_id, addr(5000)));
        rt.mark_failed_ping(&bad_id);
        let outcome = rt.add(Node::new(NodeId::random(), addr(5001)));
        assert!(matches!(outcome, AddOutcome::Replaced { evicted } if evicted == bad_id));
    }

    #[test]
    fn refresh_candidate_falls_inside_bucket_range() {
        let local = NodeId::random();
        let rt = RoutingTable::with_capacity(local, 8);
        let candidate = rt.refresh_candidate(0).unwrap();
        assert!(shares_prefix(&candidate, &rt.buckets[0].prefix, 0));
    }
}
