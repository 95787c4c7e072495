//! Maps info hash -> set of peer endpoints with timestamps. Each
//! info hash's bucket is locked independently (via `DashMap`'s sharding),
//! never the whole map.

use std::net::SocketAddr;
use std::time::Duration;

use core::NodeId;
use dashmap::DashMap;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy)]
pub struct PeerEntry {
    pub endpoint: SocketAddr,
    pub announced_at: Instant,
    pub expires_at: Instant,
}

pub struct PeerStore {
    peers: DashMap<NodeId, Vec<PeerEntry>>,
}

impl PeerStore {
    pub fn new() -> Self {
        PeerStore { peers: DashMap::new() }
    }

    /// Upserts a peer endpoint for `hash`, refreshing its TTL if already
    /// present.
    pub fn announce(&self, hash: NodeId, endpoint: SocketAddr, ttl: Duration) {
        let now = Instant::now();
        let mut entry = self.peers.entry(hash).or_default();
        if let Some(existing) = entry.iter_mut().find(|p| p.endpoint == endpoint) {
            existing.announced_at = now;
            existing.expires_at = now + ttl;
        } else {
            entry.push(PeerEntry { endpoint, announced_at: now, expires_at: now + ttl });
        }
    }

    /// Up to `limit` non-expired endpoints, oldest first. Expiration is
    /// checked lazily here; a periodic sweep additionally reclaims space
    /// for hashes nobody queries.
    pub fn peers(&self, hash: NodeId, limit: usize) -> Vec<SocketAddr> {
        let now = Instant::now();
        match self.peers.get(&hash) {
            Some(entries) => entries.iter().filter(|p| p.expires_at > now).take(limit).map(|p| p.endpoint).collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, hash: NodeId, endpoint: SocketAddr) -> bool {
        let now = Instant::now();
        self.peers.get(&hash).is_some_and(|entries| entries.iter().any(|p| p.endpoint == endpoint && p.expires_at > now))
    }

    pub fn known_hashes(&self) -> Vec<NodeId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Evicts expired entries across the whole map; intended to run on a
    /// fixed interval (default 1 min) as a backstop to lazy expiration.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.peers.retain(|_, entries| {
            entries.retain(|p| p.expires_at > now);
            !entries.is_empty()
        });
    }

    pub fn snapshot(&self) -> Vec<(NodeId, Vec<PeerEntry>)> {
        self.peers.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), port))
    }

    #[test]
    fn announced_peer_is_visible_until_ttl() {
        let store = PeerStore::new();
        let hash = NodeId::random();
        store.announce(hash, ep(1), Duration::from_secs(60));
        assert_eq!(store.peers(hash, 10), vec![ep(1)]);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let store = PeerStore::new();
        let hash = NodeId::random();
        store.announce(hash, ep(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.peers(hash, 10).is_empty());
    }

    #[test]
    fn sweep_removes_expired_hash_buckets() {
        let store = PeerStore::new();
        let hash = NodeId::random();
        store.announce(hash, ep(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        store.sweep_expired();
        assert!(store.known_hashes().is_empty());
    }

    #[test]
    fn re_announce_refreshes_ttl_without_duplicating() {
        let store = PeerStore::new();
        let hash = NodeId::random();
        store.announce(hash, ep(1), Duration::from_secs(60));
        store.announce(hash, ep(1), Duration::from_secs(60));
        assert_eq!(store.peers(hash, 10).len(), 1);
    }
}
