//! Discovers nodes and info hashes by continually widening the routing
//! table and refreshing peer lists for a caller-chosen set of "monitored"
//! hashes. Never terminates on its own — the application lifecycle starts
//! and stops it via the shared `CancellationToken` on the underlying
//! [`Dht`].

use std::collections::HashSet;
use std::time::Duration;

use core::NodeId;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug_span, trace};

use crate::dht::Dht;
use crate::lookup::{self, LookupConfig};

pub const DEFAULT_PARALLEL_CRAWLS: usize = 10;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const MONITORED_HASHES_PER_TICK: usize = 20;

#[derive(Clone, Copy, Debug)]
pub struct CrawlerConfig {
    pub parallel_crawls: usize,
    pub refresh_interval: Duration,
    pub bucket_refresh_interval: Duration,
    pub lookup: LookupConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            parallel_crawls: DEFAULT_PARALLEL_CRAWLS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            lookup: LookupConfig::default(),
        }
    }
}

/// Info hashes the crawler actively keeps alive with periodic
/// `get_peers`, typically because the acquisition manager has a task in
/// flight for them.
pub struct Crawler {
    dht: Dht,
    config: CrawlerConfig,
    monitored: RwLock<HashSet<NodeId>>,
}

impl Crawler {
    pub fn new(dht: Dht, config: CrawlerConfig) -> Self {
        Crawler { dht, config, monitored: RwLock::new(HashSet::new()) }
    }

    pub fn monitor(&self, info_hash: NodeId) {
        self.monitored.write().insert(info_hash);
    }

    pub fn unmonitor(&self, info_hash: NodeId) {
        self.monitored.write().remove(&info_hash);
    }

    /// Spawns the crawl tick and bucket-refresher workers under the DHT's
    /// cancellation token.
    pub fn start(self: std::sync::Arc<Self>) {
        let this = self.clone();
        core::spawn::spawn_with_cancel(debug_span!("crawler_tick"), this.dht.cancellation_token().clone(), {
            let this = this.clone();
            async move {
                let mut interval = tokio::time::interval(this.config.refresh_interval);
                loop {
                    interval.tick().await;
                    this.tick().await;
                }
            }
        });

        core::spawn::spawn_with_cancel(debug_span!("bucket_refresher"), this.dht.cancellation_token().clone(), {
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    this.refresh_stale_buckets().await;
                }
            }
        });
    }

    async fn tick(&self) {
        self.sample_and_discover().await;
        self.refresh_monitored_hashes().await;
    }

    /// Samples up to `parallel_crawls` known nodes and issues a
    /// `find_node` with a random target for each — the core discovery
    /// mechanism: responses widen both the routing table (via the DHT
    /// engine's own response handling) and the candidate pool for future
    /// ticks.
    async fn sample_and_discover(&self) {
        let nodes = self.dht.routing_table().read().all_nodes();
        if nodes.is_empty() {
            return;
        }
        let mut rng = rand::rng();
        let sample: Vec<_> = nodes
            .choose_multiple(&mut rng, self.config.parallel_crawls.min(nodes.len()))
            .cloned()
            .collect();

        let mut futs = FuturesUnordered::new();
        for node in sample {
            let dht = self.dht.clone();
            let target = NodeId::random();
            futs.push(async move { dht.query_find_node(node.addr, target).await });
        }
        while futs.next().await.is_some() {}
        trace!(count = self.config.parallel_crawls, "crawl tick sampled nodes");
    }

    async fn refresh_monitored_hashes(&self) {
        let hashes: Vec<NodeId> = self.monitored.read().iter().copied().take(MONITORED_HASHES_PER_TICK).collect();
        for hash in hashes {
            let outcome = lookup::get_peers(&self.dht, hash, self.config.lookup).await;
            for peer in outcome.peers {
                self.dht.peer_store().announce(hash, peer, crate::peer_store::DEFAULT_TTL);
            }
        }
    }

    async fn refresh_stale_buckets(&self) {
        let stale = self.dht.routing_table().read().stale_buckets(self.config.bucket_refresh_interval);
        for bucket_idx in stale {
            let candidate = { self.dht.routing_table().read().refresh_candidate(bucket_idx) };
            if let Some(target) = candidate {
                lookup::find_node(&self.dht, target, self.config.lookup).await;
            }
        }
    }
}
