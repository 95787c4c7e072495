//! Queue-driven, concurrency-capped metadata acquisition orchestrator.
//! Wraps the connection pool ([`crate::pool`]), health tracker
//! ([`crate::health`]) and per-connection exchange driver
//! ([`crate::exchange`]) into the `queued -> active -> backoff` lifecycle
//! from the acquisition task model.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core::{Event, EventPublisher, NodeId, NullEventPublisher};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};
use tracker_comms::TrackerSession;
use url::Url;

use crate::exchange;
use crate::health::HealthTracker;
use crate::pool::{ConnectionPool, ReleaseOutcome};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound on simultaneous peer-exchange attempts within one task;
/// not named in the spec's config keys, just a sane ceiling so a hash
/// with hundreds of known peers doesn't open hundreds of sockets at once.
const MAX_PEERS_PER_TASK: usize = 8;

#[derive(Clone)]
pub struct AcquisitionConfig {
    pub max_concurrent: usize,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub connection_timeout: Duration,
    pub acquisition_timeout: Duration,
    pub metadata_dir: PathBuf,
    pub events: Arc<dyn EventPublisher>,
    /// Port reported to trackers in announce requests. This crawler never
    /// accepts incoming peer connections, so 0 (the BEP 3 convention for
    /// "not listening") is the correct default.
    pub announce_port: u16,
    pub http_client: reqwest::Client,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            metadata_dir: PathBuf::from("metadata"),
            events: Arc::new(NullEventPublisher),
            announce_port: 0,
            http_client: reqwest::Client::new(),
        }
    }
}

struct QueuedTask {
    info_hash: NodeId,
    priority: i32,
    seq: u64,
    candidates: Vec<SocketAddr>,
    trackers: Vec<Url>,
    attempt_count: u32,
}

struct ActiveTask {
    priority: i32,
    cancel: CancellationToken,
}

struct BackoffTask {
    priority: i32,
    candidates: Vec<SocketAddr>,
    trackers: Vec<Url>,
    attempt_count: u32,
    retry_at: Instant,
}

enum Outcome {
    Success(exchange::MetadataBlob),
    Failed,
    Cancelled,
}

/// Cancels a spawned background task's token when dropped, so a tracker
/// session doesn't outlive the acquisition attempt that started it
/// regardless of how that attempt ends.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct Inner {
    config: AcquisitionConfig,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthTracker>,
    our_peer_id: NodeId,
    queued: Mutex<VecDeque<QueuedTask>>,
    active: Mutex<HashMap<NodeId, ActiveTask>>,
    backoff: Mutex<HashMap<NodeId, BackoffTask>>,
    next_seq: AtomicU64,
}

/// Cheaply cloneable handle; all state lives behind the shared `Inner`.
#[derive(Clone)]
pub struct AcquisitionManager {
    inner: Arc<Inner>,
}

impl AcquisitionManager {
    pub fn new(config: AcquisitionConfig, pool: Arc<ConnectionPool>, health: Arc<HealthTracker>, our_peer_id: NodeId) -> Self {
        AcquisitionManager {
            inner: Arc::new(Inner {
                config,
                pool,
                health,
                our_peer_id,
                queued: Mutex::new(VecDeque::new()),
                active: Mutex::new(HashMap::new()),
                backoff: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    fn is_known(&self, info_hash: &NodeId) -> bool {
        self.inner.active.lock().contains_key(info_hash)
            || self.inner.backoff.lock().contains_key(info_hash)
            || self.inner.queued.lock().iter().any(|t| &t.info_hash == info_hash)
    }

    /// Submits a new info hash for acquisition. A no-op if one is already
    /// queued, active, or backing off for this hash, per "at most one
    /// AcquisitionTask per info hash".
    pub fn submit(&self, info_hash: NodeId, priority: i32, candidates: Vec<SocketAddr>, trackers: Vec<Url>) {
        if self.is_known(&info_hash) {
            return;
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queued.lock().push_back(QueuedTask { info_hash, priority, seq, candidates, trackers, attempt_count: 0 });
    }

    /// Feeds newly discovered peers into an existing task, wherever it
    /// currently sits.
    pub fn add_candidates(&self, info_hash: &NodeId, peers: &[SocketAddr]) {
        if peers.is_empty() {
            return;
        }
        let mut queued = self.inner.queued.lock();
        if let Some(task) = queued.iter_mut().find(|t| &t.info_hash == info_hash) {
            task.candidates.extend_from_slice(peers);
            return;
        }
        drop(queued);
        let mut backoff = self.inner.backoff.lock();
        if let Some(task) = backoff.get_mut(info_hash) {
            task.candidates.extend_from_slice(peers);
        }
    }

    /// Raises priority; downgrades are ignored per the spec.
    pub fn raise_priority(&self, info_hash: &NodeId, new_priority: i32) {
        let mut queued = self.inner.queued.lock();
        if let Some(task) = queued.iter_mut().find(|t| &t.info_hash == info_hash) {
            if new_priority > task.priority {
                task.priority = new_priority;
            }
            return;
        }
        drop(queued);
        let mut active = self.inner.active.lock();
        if let Some(task) = active.get_mut(info_hash) {
            if new_priority > task.priority {
                task.priority = new_priority;
            }
        }
    }

    /// Cancels a task in any state. Active providers are torn down
    /// promptly via their cancellation token; their pool slots are
    /// released without charging the health tracker.
    pub fn cancel(&self, info_hash: &NodeId) {
        if let Some(task) = self.inner.active.lock().remove(info_hash) {
            task.cancel.cancel();
        }
        self.inner.backoff.lock().remove(info_hash);
        self.inner.queued.lock().retain(|t| &t.info_hash != info_hash);
    }

    /// Promotes backoff tasks whose retry time has passed, then fills
    /// active slots from the queue by priority desc, FIFO on ties. Locks
    /// are taken in a fixed order (active, backoff, queued) to avoid
    /// deadlocking against `cancel`/`add_candidates`.
    pub async fn tick(&self) {
        let mut active = self.inner.active.lock();
        let mut backoff = self.inner.backoff.lock();
        let mut queued = self.inner.queued.lock();

        let now = Instant::now();
        let ready: Vec<NodeId> = backoff.iter().filter(|(_, t)| now >= t.retry_at).map(|(h, _)| *h).collect();
        for hash in ready {
            let task = backoff.remove(&hash).expect("key just observed present");
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            queued.push_back(QueuedTask {
                info_hash: hash,
                priority: task.priority,
                seq,
                candidates: task.candidates,
                trackers: task.trackers,
                attempt_count: task.attempt_count,
            });
        }

        while active.len() < self.inner.config.max_concurrent {
            let Some(idx) = Self::pick_next(&queued) else { break };
            let task = queued.remove(idx).expect("index returned by pick_next is in bounds");
            let cancel = CancellationToken::new();
            active.insert(task.info_hash, ActiveTask { priority: task.priority, cancel: cancel.clone() });
            let handle = self.clone();
            let span = debug_span!("acquisition_task", info_hash = %task.info_hash);
            let QueuedTask { info_hash, priority, candidates, trackers, attempt_count, .. } = task;
            core::spawn::spawn(span, async move {
                let outcome = handle.run_task(info_hash, candidates.clone(), trackers.clone(), attempt_count, cancel).await;
                handle.on_task_finished(info_hash, priority, candidates, trackers, attempt_count, outcome).await;
            });
        }
    }

    fn pick_next(queued: &VecDeque<QueuedTask>) -> Option<usize> {
        queued
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(idx, _)| idx)
    }

    async fn run_task(
        &self,
        info_hash: NodeId,
        candidates: Vec<SocketAddr>,
        trackers: Vec<Url>,
        attempt_count: u32,
        cancel: CancellationToken,
    ) -> Outcome {
        let deadline = tokio::time::sleep(self.inner.config.acquisition_timeout);
        tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = deadline => {
                debug!(%info_hash, attempt_count, "acquisition attempt timed out");
                Outcome::Failed
            }
            outcome = self.run_providers(info_hash, candidates, trackers) => outcome,
        }
    }

    async fn run_providers(&self, info_hash: NodeId, candidates: Vec<SocketAddr>, trackers: Vec<Url>) -> Outcome {
        let mut peers: Vec<SocketAddr> = self.inner.health.prioritize(candidates);
        peers.truncate(MAX_PEERS_PER_TASK);

        if peers.is_empty() && trackers.is_empty() {
            return Outcome::Failed;
        }

        let mut attempts = FuturesUnordered::new();
        for endpoint in peers {
            attempts.push(self.attempt_peer(endpoint, info_hash));
        }

        let tracker = self.spawn_tracker_session(info_hash, trackers);
        let (_guard, mut tracker_rx) = match tracker {
            Some((guard, rx)) => (Some(guard), Some(rx)),
            None => (None, None),
        };

        loop {
            match (attempts.is_empty(), tracker_rx.is_some()) {
                (true, false) => break Outcome::Failed,
                (false, false) => {
                    if let Some(Ok(blob)) = attempts.next().await {
                        break Outcome::Success(blob);
                    }
                }
                (true, true) => match tracker_rx.as_mut().unwrap().recv().await {
                    Some(endpoint) => attempts.push(self.attempt_peer(endpoint, info_hash)),
                    None => tracker_rx = None,
                },
                (false, true) => {
                    tokio::select! {
                        result = attempts.next() => {
                            if let Some(Ok(blob)) = result {
                                break Outcome::Success(blob);
                            }
                        }
                        maybe_endpoint = tracker_rx.as_mut().unwrap().recv() => {
                            match maybe_endpoint {
                                Some(endpoint) => attempts.push(self.attempt_peer(endpoint, info_hash)),
                                None => tracker_rx = None,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Starts an announce session against `trackers` in the background,
    /// feeding discovered peer endpoints back through the returned
    /// channel. The session is cancelled when the returned guard drops,
    /// which covers both the success/failure return paths of
    /// `run_providers` and it being dropped early by the caller's own
    /// deadline. Returns `None` when the task has no tracker URLs, the
    /// common case for hashes discovered purely through the DHT.
    fn spawn_tracker_session(&self, info_hash: NodeId, trackers: Vec<Url>) -> Option<(CancelOnDrop, mpsc::Receiver<SocketAddr>)> {
        if trackers.is_empty() {
            return None;
        }
        let (tx, rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let session = TrackerSession::new(info_hash, self.inner.our_peer_id, self.inner.config.announce_port, self.inner.config.http_client.clone());
        let trackers: HashSet<Url> = trackers.into_iter().collect();
        core::spawn::spawn_with_cancel(debug_span!("tracker_session", %info_hash), token.clone(), async move {
            session.run(trackers, tx).await;
        });
        Some((CancelOnDrop(token), rx))
    }

    async fn attempt_peer(&self, endpoint: SocketAddr, info_hash: NodeId) -> Result<exchange::MetadataBlob, ()> {
        let mut conn = match self.inner.pool.acquire(endpoint).await {
            Ok(c) => c,
            Err(e) => {
                debug!(%endpoint, "pool acquire failed: {e}");
                return Err(());
            }
        };
        let result = exchange::run(
            &mut conn.stream,
            endpoint,
            info_hash,
            self.inner.our_peer_id,
            self.inner.config.events.as_ref(),
            self.inner.config.connection_timeout,
        )
        .await;
        match result {
            Ok(blob) => {
                self.inner.pool.release(conn, ReleaseOutcome::Ok);
                Ok(blob)
            }
            Err(e) => {
                debug!(%endpoint, %info_hash, "metadata exchange failed: {e}");
                self.inner.pool.release(conn, ReleaseOutcome::Failed);
                Err(())
            }
        }
    }

    async fn on_task_finished(
        &self,
        info_hash: NodeId,
        priority: i32,
        candidates: Vec<SocketAddr>,
        trackers: Vec<Url>,
        prior_attempts: u32,
        outcome: Outcome,
    ) {
        self.inner.active.lock().remove(&info_hash);
        match outcome {
            Outcome::Cancelled => {}
            Outcome::Success(blob) => {
                let name = metadata_name(&blob.bytes);
                let total_size = blob.bytes.len() as u32;
                if let Err(e) = self.persist_blob(&blob).await {
                    warn!(%info_hash, "failed to persist metadata blob: {e:#}");
                }
                self.inner.config.events.publish(Event::MetadataAcquired { info_hash, name, total_size });
                info!(%info_hash, total_size, "metadata acquired");
            }
            Outcome::Failed => {
                let attempt_count = prior_attempts + 1;
                if attempt_count >= self.inner.config.max_attempts {
                    self.inner.config.events.publish(Event::SystemError {
                        context: format!("acquisition {info_hash}"),
                        message: "exhausted retry attempts".to_string(),
                    });
                } else {
                    let retry_at = Instant::now() + self.inner.config.base_delay * 2u32.pow(attempt_count.min(16));
                    self.inner.backoff.lock().insert(info_hash, BackoffTask { priority, candidates, trackers, attempt_count, retry_at });
                }
            }
        }
    }

    async fn persist_blob(&self, blob: &exchange::MetadataBlob) -> std::io::Result<()> {
        fs::create_dir_all(&self.inner.config.metadata_dir).await?;
        let path = self.inner.config.metadata_dir.join(format!("{}.torrent", blob.info_hash.as_hex()));
        fs::write(path, &blob.bytes).await
    }
}

/// Pulls the `name` key out of a decoded `ut_metadata` info-dictionary, if
/// present and valid UTF-8. Acquisition still succeeds without it; spec
/// only requires the field be populated when the metadata actually carries
/// one.
fn metadata_name(bytes: &[u8]) -> Option<String> {
    let value = bencode::decode(bytes).ok()?;
    let name = value.get(b"name")?.as_bytes()?;
    String::from_utf8(name.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AcquisitionManager {
        let health = Arc::new(HealthTracker::default());
        let pool = Arc::new(ConnectionPool::new(health.clone(), Duration::from_millis(100)));
        AcquisitionManager::new(AcquisitionConfig::default(), pool, health, NodeId::random())
    }

    #[test]
    fn submit_is_idempotent_per_hash() {
        let mgr = manager();
        let hash = NodeId::random();
        mgr.submit(hash, 0, vec![], vec![]);
        mgr.submit(hash, 5, vec![], vec![]);
        assert_eq!(mgr.inner.queued.lock().len(), 1);
    }

    #[test]
    fn raise_priority_ignores_downgrades() {
        let mgr = manager();
        let hash = NodeId::random();
        mgr.submit(hash, 5, vec![], vec![]);
        mgr.raise_priority(&hash, 1);
        assert_eq!(mgr.inner.queued.lock()[0].priority, 5);
        mgr.raise_priority(&hash, 9);
        assert_eq!(mgr.inner.queued.lock()[0].priority, 9);
    }

    #[test]
    fn pick_next_prefers_priority_then_fifo() {
        let mut q = VecDeque::new();
        q.push_back(QueuedTask { info_hash: NodeId::random(), priority: 1, seq: 0, candidates: vec![], trackers: vec![], attempt_count: 0 });
        q.push_back(QueuedTask { info_hash: NodeId::random(), priority: 5, seq: 1, candidates: vec![], trackers: vec![], attempt_count: 0 });
        q.push_back(QueuedTask { info_hash: NodeId::random(), priority: 5, seq: 2, candidates: vec![], trackers: vec![], attempt_count: 0 });
        let idx = AcquisitionManager::pick_next(&q).unwrap();
        assert_eq!(idx, 1, "same priority ties break FIFO (lowest seq)");
    }

    #[tokio::test]
    async fn cancel_removes_task_from_every_set() {
        let mgr = manager();
        let hash = NodeId::random();
        mgr.submit(hash, 0, vec![], vec![]);
        mgr.cancel(&hash);
        assert!(!mgr.is_known(&hash));
    }

    #[tokio::test]
    async fn run_providers_announces_to_configured_trackers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hit_tx, hit_rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = hit_tx.send(());
                let body: &[u8] = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x00\x01e";
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(body).await;
            }
        });

        let mgr = manager();
        let tracker_url: Url = format!("http://{addr}/announce").parse().unwrap();
        let _ = tokio::time::timeout(Duration::from_millis(500), mgr.run_providers(NodeId::random(), vec![], vec![tracker_url])).await;
        assert!(hit_rx.await.is_ok(), "tracker endpoint was never contacted");
    }
}
