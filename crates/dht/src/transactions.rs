//! Matches DHT responses to pending queries by transaction ID and enforces
//! per-transaction timeouts. `DashMap` plus a periodic sweep *is* the
//! concurrency primitive here — no separate lock is layered over it, and
//! callbacks (here, a oneshot sender) are always fired outside of any map
//! access.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::bprotocol::Response;
use crate::error::{Error, Result};

pub const DEFAULT_MAX_INFLIGHT: usize = 256;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    Error { code: i64, message: String },
    Timeout,
    Cancelled,
}

struct Pending {
    query_kind: &'static str,
    #[allow(dead_code)]
    remote: SocketAddr,
    created_at: Instant,
    timeout: Duration,
    responder: oneshot::Sender<Outcome>,
}

pub struct TransactionManager {
    max_inflight: usize,
    next_id: AtomicU32,
    pending: DashMap<Vec<u8>, Pending>,
}

impl TransactionManager {
    pub fn new(max_inflight: usize) -> Self {
        TransactionManager { max_inflight, next_id: AtomicU32::new(0), pending: DashMap::new() }
    }

    /// Registers a new outstanding query, returning its transaction ID and
    /// a receiver that resolves exactly once: on matched response, error,
    /// or timeout.
    pub fn register(
        &self,
        query_kind: &'static str,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<(Vec<u8>, oneshot::Receiver<Outcome>)> {
        if self.pending.len() >= self.max_inflight {
            return Err(Error::TooManyTransactions);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx_id = id.to_be_bytes().to_vec();
        let (responder, receiver) = oneshot::channel();
        self.pending.insert(
            tx_id.clone(),
            Pending { query_kind, remote, created_at: Instant::now(), timeout, responder },
        );
        Ok((tx_id, receiver))
    }

    /// Looks up which query kind a transaction ID was registered for,
    /// without removing it — used by the wire codec to know how to parse
    /// a response's `r` dict.
    pub fn query_kind(&self, tx_id: &[u8]) -> Option<&'static str> {
        self.pending.get(tx_id).map(|p| p.query_kind)
    }

    /// Dispatches the transaction's callback exactly once. A tx_id that
    /// isn't (or is no longer) pending is dropped silently — a late
    /// response racing a timeout, or a spoofed/garbage tx_id.
    pub fn complete(&self, tx_id: &[u8], outcome: Outcome) {
        if let Some((_, pending)) = self.pending.remove(tx_id) {
            let _ = pending.responder.send(outcome);
        } else {
            trace!(tx_id = ?tx_id, "late or unknown transaction response dropped");
        }
    }

    pub fn cancel_all(&self) {
        let keys: Vec<Vec<u8>> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.responder.send(Outcome::Cancelled);
            }
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.pending.len()
    }

    /// Moves every transaction whose deadline has passed out of the table
    /// and fires its timeout callback. Intended to run on a fixed
    /// interval (default 1s).
    pub fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|e| now.saturating_duration_since(e.created_at) >= e.value().timeout)
            .map(|e| e.key().clone())
            .collect();
        for tx_id in expired {
            self.complete(&tx_id, Outcome::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881))
    }

    #[tokio::test]
    async fn response_is_delivered_exactly_once() {
        let mgr = TransactionManager::new(DEFAULT_MAX_INFLIGHT);
        let (tx_id, rx) = mgr.register("ping", addr(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(mgr.query_kind(&tx_id), Some("ping"));
        mgr.complete(&tx_id, Outcome::Error { code: 1, message: "x".into() });
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Outcome::Error { .. }));
        // A second completion for the same (now-removed) tx_id is a noop.
        mgr.complete(&tx_id, Outcome::Timeout);
    }

    #[test]
    fn registering_past_the_cap_fails_fast() {
        let mgr = TransactionManager::new(1);
        let _first = mgr.register("ping", addr(), DEFAULT_TIMEOUT).unwrap();
        let second = mgr.register("ping", addr(), DEFAULT_TIMEOUT);
        assert!(matches!(second, Err(Error::TooManyTransactions)));
    }

    #[tokio::test]
    async fn sweep_fires_timeout_after_deadline() {
        let mgr = TransactionManager::new(DEFAULT_MAX_INFLIGHT);
        let (_tx_id, rx) = mgr.register("ping", addr(), Duration::from_millis(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.sweep_timeouts();
        assert!(matches!(rx.await.unwrap(), Outcome::Timeout));
    }
}
