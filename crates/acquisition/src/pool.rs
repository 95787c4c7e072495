//! TCP connection reuse with a per-endpoint circuit breaker. Every pooled
//! connection is either idle in the pool or checked out to exactly one
//! caller; `release` decides whether it goes back to idle or is closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::health::{FailureReason, HealthTracker};

pub const DEFAULT_PER_ENDPOINT_LIMIT: usize = 5;
pub const DEFAULT_GLOBAL_LIMIT: usize = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("circuit open for endpoint")]
    CircuitOpen,
    #[error("per-endpoint connection limit reached")]
    PerEndpointLimit,
    #[error("global connection limit reached")]
    GlobalLimit,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection refused")]
    ConnectRefused,
    #[error("connect failed: {0}")]
    Io(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    Failed,
}

struct Idle {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
    use_count: u32,
    quality: f64,
}

struct PoolConfig {
    per_endpoint_limit: usize,
    global_limit: usize,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            per_endpoint_limit: DEFAULT_PER_ENDPOINT_LIMIT,
            global_limit: DEFAULT_GLOBAL_LIMIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }
}

#[derive(Default)]
struct State {
    idle: HashMap<SocketAddr, Vec<Idle>>,
    in_use_count: HashMap<SocketAddr, usize>,
    total_in_use: usize,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    health: Arc<HealthTracker>,
    connect_timeout: Duration,
}

impl Shared {
    fn undo_reservation(&self, endpoint: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_use_count.get_mut(&endpoint) {
            *count = count.saturating_sub(1);
        }
        state.total_in_use = state.total_in_use.saturating_sub(1);
    }
}

/// A checked-out connection. Must be returned to the pool via
/// [`ConnectionPool::release`] or [`ConnectionPool::release_cancelled`].
/// If it's dropped without either (e.g. its owning task future is
/// dropped mid-cancellation), the `Drop` impl below still frees its
/// pool-accounting slot, treated the same as an explicit cancellation
/// (no health charge) since a drop carries no outcome information.
pub struct PooledConnection {
    pub stream: TcpStream,
    pub endpoint: SocketAddr,
    pub created_at: Instant,
    pub use_count: u32,
    connect_latency_ms: f64,
    shared: Weak<Shared>,
    released: AtomicBool,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            trace!(endpoint = %self.endpoint, "pooled connection dropped without explicit release");
            shared.undo_reservation(self.endpoint);
        }
    }
}

pub struct ConnectionPool {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(health: Arc<HealthTracker>, connect_timeout: Duration) -> Self {
        ConnectionPool {
            shared: Arc::new(Shared {
                config: PoolConfig::default(),
                state: Mutex::new(State::default()),
                health,
                connect_timeout,
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Acquires a connection to `endpoint`: reuses an idle one if a
    /// healthy one is available, otherwise dials a new TCP connection.
    /// The circuit breaker is consulted before any socket I/O and before
    /// the per-endpoint/global caps.
    pub async fn acquire(&self, endpoint: SocketAddr) -> Result<PooledConnection, PoolError> {
        if self.shared.health.admit(endpoint).is_err() {
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.take_idle(endpoint) {
            trace!(%endpoint, "reusing pooled connection");
            return Ok(conn);
        }

        {
            let mut state = self.shared.state.lock();
            let per_endpoint = state.in_use_count.get(&endpoint).copied().unwrap_or(0);
            if per_endpoint >= self.shared.config.per_endpoint_limit {
                return Err(PoolError::PerEndpointLimit);
            }
            if state.total_in_use >= self.shared.config.global_limit {
                return Err(PoolError::GlobalLimit);
            }
            *state.in_use_count.entry(endpoint).or_insert(0) += 1;
            state.total_in_use += 1;
        }

        let started = Instant::now();
        let dial = tokio::time::timeout(self.shared.connect_timeout, TcpStream::connect(endpoint)).await;
        let stream = match dial {
            Err(_) => {
                self.shared.undo_reservation(endpoint);
                self.shared.health.record_failure(endpoint, FailureReason::ConnectTimeout);
                return Err(PoolError::ConnectTimeout);
            }
            Ok(Err(e)) => {
                self.shared.undo_reservation(endpoint);
                let reason = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    FailureReason::ConnectRefused
                } else {
                    FailureReason::ConnectTimeout
                };
                self.shared.health.record_failure(endpoint, reason);
                return Err(if matches!(reason, FailureReason::ConnectRefused) {
                    PoolError::ConnectRefused
                } else {
                    PoolError::Io(e)
                });
            }
            Ok(Ok(s)) => s,
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            stream,
            endpoint,
            created_at: Instant::now(),
            use_count: 1,
            connect_latency_ms: latency_ms,
            shared: Arc::downgrade(&self.shared),
            released: AtomicBool::new(false),
        })
    }

    fn take_idle(&self, endpoint: SocketAddr) -> Option<PooledConnection> {
        let mut state = self.shared.state.lock();
        let bucket = state.idle.get_mut(&endpoint)?;
        while let Some(idle) = bucket.pop() {
            if !Self::still_fresh(&idle, &self.shared.config) || !Self::peek_alive(&idle.stream) {
                trace!(%endpoint, "discarding stale/dead idle connection");
                continue;
            }
            *state.in_use_count.entry(endpoint).or_insert(0) += 1;
            state.total_in_use += 1;
            return Some(PooledConnection {
                stream: idle.stream,
                endpoint,
                created_at: idle.created_at,
                use_count: idle.use_count + 1,
                connect_latency_ms: 0.0,
                shared: Arc::downgrade(&self.shared),
                released: AtomicBool::new(false),
            });
        }
        None
    }

    fn still_fresh(idle: &Idle, config: &PoolConfig) -> bool {
        idle.last_used.elapsed() < config.idle_timeout && idle.created_at.elapsed() < config.max_lifetime && idle.quality > 0.0
    }

    /// Best-effort peer-closed detection: a non-blocking zero-length peek.
    /// Any readiness at all (even `Ok(0)`, a close) or an unexpected error
    /// marks the connection dead; `WouldBlock` means it's genuinely idle.
    fn peek_alive(stream: &TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => false,
            Ok(_) => false,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Returns a connection to the pool (or closes it). On `Ok`, the first
    /// observation of a connection records a health success using its
    /// connect latency; on `Failed`, it's dropped and charged as a
    /// failure.
    pub fn release(&self, conn: PooledConnection, outcome: ReleaseOutcome) {
        let endpoint = conn.endpoint;
        conn.released.store(true, Ordering::Release);
        self.shared.undo_reservation(endpoint);

        match outcome {
            ReleaseOutcome::Ok => {
                if conn.connect_latency_ms > 0.0 {
                    self.shared.health.record_success(endpoint, conn.connect_latency_ms);
                }
                let mut state = self.shared.state.lock();
                state.idle.entry(endpoint).or_default().push(Idle {
                    stream: conn.stream,
                    created_at: conn.created_at,
                    last_used: Instant::now(),
                    use_count: conn.use_count,
                    quality: 1.0,
                });
            }
            ReleaseOutcome::Failed => {
                debug!(%endpoint, "closing connection after failed outcome");
                self.shared.health.record_failure(endpoint, FailureReason::PeerClosed);
            }
        }
    }

    /// Releases a connection for a cancelled task. Distinguishable from
    /// `release(.., Failed)`: the pool slot is freed but the health
    /// tracker is left untouched since cancellation isn't the
    /// endpoint's fault.
    pub fn release_cancelled(&self, conn: PooledConnection) {
        conn.released.store(true, Ordering::Release);
        self.shared.undo_reservation(conn.endpoint);
    }

    /// Closes idle connections past their idle timeout or max lifetime.
    pub fn maintenance(&self) {
        let mut state = self.shared.state.lock();
        let config = &self.shared.config;
        let mut emptied = Vec::new();
        for (endpoint, bucket) in state.idle.iter_mut() {
            bucket.retain(|idle| Self::still_fresh(idle, config));
            if bucket.is_empty() {
                emptied.push(*endpoint);
            }
        }
        for endpoint in emptied {
            state.idle.remove(&endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn circuit_open_denies_without_dialing() {
        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        let endpoint: SocketAddr = "10.255.255.1:1".parse().unwrap();
        for _ in 0..5 {
            health.record_failure(endpoint, FailureReason::ConnectRefused);
        }
        let pool = ConnectionPool::new(health, Duration::from_millis(50));
        assert!(matches!(pool.acquire(endpoint).await, Err(PoolError::CircuitOpen)));
    }

    #[tokio::test]
    async fn per_endpoint_limit_enforced() {
        let health = Arc::new(HealthTracker::default());
        let pool = ConnectionPool::new(health, Duration::from_millis(200));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut held = Vec::new();
        for _ in 0..DEFAULT_PER_ENDPOINT_LIMIT {
            held.push(pool.acquire(addr).await.unwrap());
        }
        assert!(matches!(pool.acquire(addr).await, Err(PoolError::PerEndpointLimit)));
        for conn in held {
            pool.release(conn, ReleaseOutcome::Ok);
        }
    }

    /// A connection dropped without an explicit `release` (e.g. its
    /// owning future was cancelled) must still free its pool-accounting
    /// slot, or a cancelled acquisition would permanently wedge the
    /// per-endpoint/global caps.
    #[tokio::test]
    async fn dropping_a_checked_out_connection_frees_its_slot() {
        let health = Arc::new(HealthTracker::default());
        let pool = ConnectionPool::new(health, Duration::from_millis(200));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut held = Vec::new();
        for _ in 0..DEFAULT_PER_ENDPOINT_LIMIT {
            held.push(pool.acquire(addr).await.unwrap());
        }
        assert!(matches!(pool.acquire(addr).await, Err(PoolError::PerEndpointLimit)));

        drop(held);

        assert!(pool.acquire(addr).await.is_ok(), "dropped connections must release their accounting slot");
    }
}
