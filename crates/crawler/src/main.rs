//! Mainline DHT crawler and torrent metadata harvester binary: wires the
//! DHT engine, crawl loop, tracker announce client and metadata
//! acquisition pipeline together, restoring and periodically persisting
//! state on disk.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acquisition::{AcquisitionConfig, AcquisitionManager, ConnectionPool, HealthTracker};
use clap::Parser;
use core::{BroadcastEventPublisher, Event, EventPublisher, NodeId};
use dht::crawler::{Crawler, CrawlerConfig};
use dht::lookup::LookupConfig;
use dht::persistence::{self, Paths};
use dht::{Dht, DhtConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, info, trace, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BOOTSTRAP_NODES: &[&str] =
    &["router.bittorrent.com:6881", "dht.transmissionbt.com:6881", "router.utorrent.com:6881"];

#[derive(Parser)]
#[command(version, author, about = "Mainline DHT crawler and torrent metadata harvester")]
struct Opts {
    /// UDP port the DHT engine listens on. 0 picks an ephemeral port.
    #[arg(long = "dht-port", default_value_t = 0, env = "CRAWLER_DHT_PORT")]
    dht_port: u16,

    /// Comma-separated host:port bootstrap nodes. Defaults to the
    /// well-known public bootstrap routers.
    #[arg(long = "dht-bootstrap-nodes", env = "CRAWLER_DHT_BOOTSTRAP_NODES")]
    dht_bootstrap_nodes: Option<String>,

    #[arg(long = "dht-k-bucket-size", default_value_t = dht::routing_table::DEFAULT_K, env = "CRAWLER_DHT_K_BUCKET_SIZE")]
    dht_k_bucket_size: usize,

    #[arg(long = "dht-alpha", default_value_t = dht::lookup::DEFAULT_ALPHA, env = "CRAWLER_DHT_ALPHA")]
    dht_alpha: usize,

    #[arg(long = "dht-max-iterations", default_value_t = dht::lookup::DEFAULT_MAX_ITERATIONS, env = "CRAWLER_DHT_MAX_ITERATIONS")]
    dht_max_iterations: usize,

    #[arg(long = "dht-max-queries", default_value_t = dht::lookup::DEFAULT_MAX_QUERIES, env = "CRAWLER_DHT_MAX_QUERIES")]
    dht_max_queries: usize,

    #[arg(long = "dht-transaction-timeout-ms", default_value_t = 15_000, env = "CRAWLER_DHT_TRANSACTION_TIMEOUT_MS")]
    dht_transaction_timeout_ms: u64,

    #[arg(long = "dht-bucket-refresh-interval-s", default_value_t = 900, env = "CRAWLER_DHT_BUCKET_REFRESH_INTERVAL_S")]
    dht_bucket_refresh_interval_s: u64,

    #[arg(long = "metadata-max-concurrent", default_value_t = acquisition::manager::DEFAULT_MAX_CONCURRENT, env = "CRAWLER_METADATA_MAX_CONCURRENT")]
    metadata_max_concurrent: usize,

    #[arg(long = "metadata-acquisition-timeout-s", default_value_t = 60, env = "CRAWLER_METADATA_ACQUISITION_TIMEOUT_S")]
    metadata_acquisition_timeout_s: u64,

    #[arg(long = "metadata-max-retry-count", default_value_t = acquisition::manager::DEFAULT_MAX_ATTEMPTS, env = "CRAWLER_METADATA_MAX_RETRY_COUNT")]
    metadata_max_retry_count: u32,

    #[arg(long = "metadata-retry-delay-base-s", default_value_t = 300, env = "CRAWLER_METADATA_RETRY_DELAY_BASE_S")]
    metadata_retry_delay_base_s: u64,

    #[arg(long = "pool-connect-timeout-ms", default_value_t = 5_000, env = "CRAWLER_POOL_CONNECT_TIMEOUT_MS")]
    pool_connect_timeout_ms: u64,

    #[arg(long = "crawler-parallel-crawls", default_value_t = dht::crawler::DEFAULT_PARALLEL_CRAWLS, env = "CRAWLER_PARALLEL_CRAWLS")]
    crawler_parallel_crawls: usize,

    #[arg(long = "crawler-refresh-interval-s", default_value_t = 15, env = "CRAWLER_REFRESH_INTERVAL_S")]
    crawler_refresh_interval_s: u64,

    /// Directory holding `node_id`, `routing_table.dat`, `peers.dat`.
    #[arg(long = "data-dir", default_value = "./crawler-data", env = "CRAWLER_DATA_DIR")]
    data_dir: PathBuf,

    /// Directory validated metadata blobs are written to as `<hex-hash>.torrent`.
    #[arg(long = "metadata-dir", default_value = "./crawler-data/metadata", env = "CRAWLER_METADATA_DIR")]
    metadata_dir: PathBuf,

    /// A single info hash (hex) to monitor eagerly in addition to whatever
    /// the crawl loop discovers on its own.
    #[arg(long = "watch", env = "CRAWLER_WATCH_HASH")]
    watch: Option<String>,
}

fn resolve_bootstrap_nodes(raw: Option<&str>) -> Vec<SocketAddr> {
    let entries: Vec<String> = match raw {
        Some(s) => s.split(',').map(|s| s.trim().to_string()).collect(),
        None => DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
    };
    entries
        .into_iter()
        .filter_map(|entry| match entry.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!(%entry, "failed to resolve bootstrap node: {e}");
                None
            }
        })
        .collect()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = Opts::parse();

    let events = Arc::new(BroadcastEventPublisher::default());
    let cancel = CancellationToken::new();

    std::fs::create_dir_all(&opts.data_dir)?;
    let paths = Paths::under(&opts.data_dir);
    let local_id = persistence::load_or_create_node_id(&paths.node_id)?;
    info!(%local_id, "loaded local node id");

    let dht_config = DhtConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], opts.dht_port)),
        local_id: Some(local_id),
        k_bucket_size: opts.dht_k_bucket_size,
        max_inflight_transactions: dht::transactions::DEFAULT_MAX_INFLIGHT,
        transaction_timeout: Duration::from_millis(opts.dht_transaction_timeout_ms),
        peer_ttl: dht::peer_store::DEFAULT_TTL,
        events: events.clone() as Arc<dyn EventPublisher>,
    };
    let dht = Dht::new(dht_config, cancel.clone()).await?;
    info!(local_addr = ?dht.local_addr()?, "dht engine listening");

    restore_routing_table(&dht, &paths);
    restore_peer_store(&dht, &paths);

    let bootstrap_nodes = resolve_bootstrap_nodes(opts.dht_bootstrap_nodes.as_deref());
    if !bootstrap_nodes.is_empty() {
        if let Err(e) = dht.bootstrap(&bootstrap_nodes).await {
            warn!("dht bootstrap failed: {e:#}");
        }
    }

    let lookup_config =
        LookupConfig { alpha: opts.dht_alpha, k: opts.dht_k_bucket_size, max_iterations: opts.dht_max_iterations, max_queries: opts.dht_max_queries };
    let crawler_config = CrawlerConfig {
        parallel_crawls: opts.crawler_parallel_crawls,
        refresh_interval: Duration::from_secs(opts.crawler_refresh_interval_s),
        bucket_refresh_interval: Duration::from_secs(opts.dht_bucket_refresh_interval_s),
        lookup: lookup_config,
    };
    let crawler = Arc::new(Crawler::new(dht.clone(), crawler_config));
    crawler.clone().start();

    if let Some(hex) = opts.watch.as_deref() {
        match hex.parse::<NodeId>() {
            Ok(hash) => crawler.monitor(hash),
            Err(_) => warn!(%hex, "--watch value is not a valid 40-hex-char info hash"),
        }
    }

    let health = Arc::new(HealthTracker::default());
    let pool = Arc::new(ConnectionPool::new(health.clone(), Duration::from_millis(opts.pool_connect_timeout_ms)));
    let acquisition_config = AcquisitionConfig {
        max_concurrent: opts.metadata_max_concurrent,
        base_delay: Duration::from_secs(opts.metadata_retry_delay_base_s),
        max_attempts: opts.metadata_max_retry_count,
        acquisition_timeout: Duration::from_secs(opts.metadata_acquisition_timeout_s),
        metadata_dir: opts.metadata_dir.clone(),
        events: events.clone() as Arc<dyn EventPublisher>,
        ..AcquisitionConfig::default()
    };
    let our_peer_id = core::peer_id::generate_peer_id("CR");
    let acquisition = AcquisitionManager::new(acquisition_config, pool.clone(), health.clone(), our_peer_id);

    spawn_event_bridge(events.clone(), crawler.clone(), acquisition.clone(), dht.clone());
    spawn_acquisition_tick(acquisition.clone(), pool.clone(), cancel.clone());
    spawn_persistence_snapshotter(dht.clone(), paths.clone(), cancel.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    if let Err(e) = snapshot_now(&dht, &paths) {
        warn!("final persistence snapshot failed: {e:#}");
    }
    Ok(())
}

fn restore_routing_table(dht: &Dht, paths: &Paths) {
    match persistence::load_routing_table_snapshot(&paths.routing_table, persistence::DEFAULT_STALENESS_THRESHOLD) {
        Ok(entries) => {
            let mut table = dht.routing_table().write();
            for entry in entries {
                table.add(dht::routing_table::Node::new(entry.id, entry.addr));
            }
            info!(restored = table.all_nodes().len(), "restored routing table from snapshot");
        }
        Err(e) => warn!("failed to load routing table snapshot: {e:#}"),
    }
}

fn restore_peer_store(dht: &Dht, paths: &Paths) {
    match persistence::load_peers_snapshot(&paths.peers) {
        Ok(entries) => {
            let mut count = 0;
            for (hash, records) in entries {
                for record in records {
                    dht.peer_store().announce(hash, record.addr, dht::peer_store::DEFAULT_TTL);
                    count += 1;
                }
            }
            info!(restored = count, "restored peer store from snapshot");
        }
        Err(e) => warn!("failed to load peer store snapshot: {e:#}"),
    }
}

fn snapshot_now(dht: &Dht, paths: &Paths) -> dht::Result<()> {
    persistence::save_routing_table_snapshot(&paths.routing_table, &dht.routing_table().read())?;
    let entries = dht.peer_store().snapshot();
    persistence::save_peers_snapshot(&paths.peers, &entries)?;
    Ok(())
}

fn spawn_persistence_snapshotter(dht: Dht, paths: Paths, cancel: CancellationToken) {
    core::spawn::spawn_with_cancel(debug_span!("persistence_snapshotter"), cancel, async move {
        let mut interval = tokio::time::interval(persistence::DEFAULT_SNAPSHOT_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = snapshot_now(&dht, &paths) {
                warn!("periodic persistence snapshot failed: {e:#}");
            }
        }
    });
}

fn spawn_acquisition_tick(acquisition: AcquisitionManager, pool: Arc<ConnectionPool>, cancel: CancellationToken) {
    core::spawn::spawn_with_cancel(debug_span!("acquisition_queue_processor"), cancel.clone(), async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            acquisition.tick().await;
        }
    });
    core::spawn::spawn_with_cancel(debug_span!("pool_maintenance"), cancel, async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            pool.maintenance();
        }
    });
}

/// Bridges DHT discovery events into the crawl/acquisition pipeline:
/// a newly discovered info hash becomes a monitored hash and an
/// acquisition task; every peer announced for a hash already being
/// acquired is fed in as another candidate.
fn spawn_event_bridge(events: Arc<BroadcastEventPublisher>, crawler: Arc<Crawler>, acquisition: AcquisitionManager, dht: Dht) {
    let mut rx = events.subscribe();
    let cancel = dht.cancellation_token().clone();
    core::spawn::spawn_with_cancel(debug_span!("event_bridge"), cancel, async move {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bridge fell behind, skipped events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                Event::InfoHashDiscovered { info_hash } => {
                    crawler.monitor(info_hash);
                    let candidates = dht.peer_store().peers(info_hash, 50);
                    acquisition.submit(info_hash, 0, candidates, Vec::new());
                }
                Event::PeerDiscovered { info_hash, addr } => {
                    acquisition.add_candidates(&info_hash, &[addr]);
                }
                Event::MetadataAcquired { info_hash, total_size, .. } => {
                    info!(%info_hash, total_size, "metadata acquired, unmonitoring hash");
                    crawler.unmonitor(info_hash);
                }
                Event::SystemError { context, message } => {
                    warn!(%context, %message, "system error event");
                }
                other => trace!(?other, "dht event"),
            }
        }
    });
}
