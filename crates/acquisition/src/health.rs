//! Per-endpoint success/failure/latency tracking and the circuit-breaker
//! state derived from it. One [`HealthTracker`] is shared by the
//! connection pool (which consults it before dialing) and the
//! acquisition manager (which uses it to rank candidate peers).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

const HISTORY_CAPACITY: usize = 10;
const OPEN_FAILURE_THRESHOLD: u32 = 5;
const OPEN_SUCCESS_RATE_THRESHOLD: f64 = 0.2;
const OPEN_MIN_SAMPLES: usize = 3;
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);
/// A score at or above this is considered "known-healthy" by
/// [`HealthTracker::prioritize`]; spec.md leaves the exact split
/// unspecified, this workspace picks the midpoint of the [0,1] range.
const HEALTHY_SCORE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectTimeout,
    ConnectRefused,
    PeerClosed,
    ProtocolViolation,
    Corrupt,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct EndpointHealth {
    recent_results: VecDeque<bool>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    ewma_latency_ms: f64,
    last_attempt: Instant,
    open_since: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        EndpointHealth {
            recent_results: VecDeque::with_capacity(HISTORY_CAPACITY),
            consecutive_failures: 0,
            consecutive_successes: 0,
            ewma_latency_ms: 0.0,
            last_attempt: Instant::now(),
            open_since: None,
            half_open_probe_in_flight: false,
        }
    }
}

impl EndpointHealth {
    fn push_result(&mut self, ok: bool) {
        if self.recent_results.len() == HISTORY_CAPACITY {
            self.recent_results.pop_front();
        }
        self.recent_results.push_back(ok);
        self.last_attempt = Instant::now();
    }

    fn success_rate(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 1.0;
        }
        let ok = self.recent_results.iter().filter(|r| **r).count();
        ok as f64 / self.recent_results.len() as f64
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.push_result(true);
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        const ALPHA: f64 = 0.3;
        self.ewma_latency_ms = if self.ewma_latency_ms == 0.0 {
            latency_ms
        } else {
            ALPHA * latency_ms + (1.0 - ALPHA) * self.ewma_latency_ms
        };
    }

    fn record_failure(&mut self) {
        self.push_result(false);
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        if self.is_failing() && self.open_since.is_none() {
            self.open_since = Some(Instant::now());
        }
    }

    fn is_failing(&self) -> bool {
        self.consecutive_failures >= OPEN_FAILURE_THRESHOLD
            || (self.success_rate() < OPEN_SUCCESS_RATE_THRESHOLD && self.recent_results.len() >= OPEN_MIN_SAMPLES)
    }

    fn health_score(&self) -> f64 {
        let score = self.success_rate() - (0.1 * self.consecutive_failures as f64).min(0.5)
            + (0.05 * self.consecutive_successes as f64).min(0.3)
            - (self.ewma_latency_ms / 5000.0).min(0.2);
        score.clamp(0.0, 1.0)
    }

    /// Updates circuit bookkeeping for an outcome, returning the circuit
    /// state to report to the caller. Must be called with the endpoint's
    /// entry lock held so the half-open probe flag transitions
    /// atomically with the outcome.
    fn circuit_state_after(&mut self, reset_interval: Duration) -> CircuitState {
        if !self.is_failing() {
            self.open_since = None;
            self.half_open_probe_in_flight = false;
            return CircuitState::Closed;
        }
        let opened_at = *self.open_since.get_or_insert_with(Instant::now);
        if self.half_open_probe_in_flight {
            return CircuitState::Open;
        }
        if opened_at.elapsed() >= reset_interval {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }
}

pub struct HealthTracker {
    entries: DashMap<SocketAddr, EndpointHealth>,
    reset_interval: Duration,
}

impl HealthTracker {
    pub fn new(reset_interval: Duration) -> Self {
        HealthTracker { entries: DashMap::new(), reset_interval }
    }

    /// Called by the connection pool before dialing. `Ok(())` means the
    /// attempt may proceed (closed circuit, or the single permitted
    /// half-open probe); `Err` means deny without touching the socket.
    pub fn admit(&self, addr: SocketAddr) -> Result<(), ()> {
        let mut entry = self.entries.entry(addr).or_default();
        match entry.circuit_state_after(self.reset_interval) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(()),
            CircuitState::HalfOpen => {
                entry.half_open_probe_in_flight = true;
                trace!(%addr, "admitting half-open circuit probe");
                Ok(())
            }
        }
    }

    pub fn record_success(&self, addr: SocketAddr, latency_ms: f64) {
        let mut entry = self.entries.entry(addr).or_default();
        let was_half_open = entry.half_open_probe_in_flight;
        entry.record_success(latency_ms);
        entry.half_open_probe_in_flight = false;
        if was_half_open {
            debug!(%addr, "circuit closed after successful half-open probe");
            entry.open_since = None;
            entry.recent_results.clear();
            entry.recent_results.push_back(true);
        }
    }

    pub fn record_failure(&self, addr: SocketAddr, reason: FailureReason) {
        let mut entry = self.entries.entry(addr).or_default();
        let was_half_open = entry.half_open_probe_in_flight;
        entry.record_failure();
        entry.half_open_probe_in_flight = false;
        if was_half_open {
            debug!(%addr, ?reason, "half-open probe failed, circuit re-opened with a fresh timer");
            entry.open_since = Some(Instant::now());
        } else {
            trace!(%addr, ?reason, "recorded connection failure");
        }
    }

    pub fn circuit_state(&self, addr: SocketAddr) -> CircuitState {
        let mut entry = self.entries.entry(addr).or_default();
        entry.circuit_state_after(self.reset_interval)
    }

    pub fn health_score(&self, addr: SocketAddr) -> Option<f64> {
        self.entries.get(&addr).map(|e| e.health_score())
    }

    fn has_history(&self, addr: SocketAddr) -> bool {
        self.entries.get(&addr).is_some_and(|e| !e.recent_results.is_empty())
    }

    /// Orders candidates per §4.I: known-healthy by score desc, then
    /// unknown candidates in random order, then (only if the first two
    /// groups total fewer than 3) unhealthy candidates by score desc.
    pub fn prioritize(&self, candidates: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut healthy = Vec::new();
        let mut unknown = Vec::new();
        let mut unhealthy = Vec::new();

        for addr in candidates {
            if !self.has_history(addr) {
                unknown.push(addr);
                continue;
            }
            let score = self.health_score(addr).unwrap_or(0.0);
            if score >= HEALTHY_SCORE_THRESHOLD {
                healthy.push((addr, score));
            } else {
                unhealthy.push((addr, score));
            }
        }

        healthy.sort_by(|a, b| b.1.total_cmp(&a.1));
        unknown.shuffle(&mut rand::rng());
        unhealthy.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut out: Vec<SocketAddr> = healthy.into_iter().map(|(a, _)| a).collect();
        out.extend(unknown);
        if out.len() < OPEN_MIN_SAMPLES {
            out.extend(unhealthy.into_iter().map(|(a, _)| a));
        }
        out
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESET_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), port))
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let tracker = HealthTracker::new(Duration::from_secs(60));
        let addr = ep(1);
        for _ in 0..5 {
            tracker.record_failure(addr, FailureReason::ConnectRefused);
        }
        assert_eq!(tracker.circuit_state(addr), CircuitState::Open);
        assert!(tracker.admit(addr).is_err());
    }

    #[test]
    fn half_open_allows_exactly_one_probe_then_may_reopen() {
        let tracker = HealthTracker::new(Duration::from_millis(10));
        let addr = ep(2);
        for _ in 0..5 {
            tracker.record_failure(addr, FailureReason::ConnectRefused);
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(tracker.admit(addr).is_ok(), "first probe after reset interval is admitted");
        assert!(tracker.admit(addr).is_err(), "second concurrent attempt is denied while probing");
        tracker.record_failure(addr, FailureReason::ConnectRefused);
        assert_eq!(tracker.circuit_state(addr), CircuitState::Open);
    }

    #[test]
    fn successful_probe_closes_circuit_and_resets_history() {
        let tracker = HealthTracker::new(Duration::from_millis(10));
        let addr = ep(3);
        for _ in 0..5 {
            tracker.record_failure(addr, FailureReason::ConnectRefused);
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(tracker.admit(addr).is_ok());
        tracker.record_success(addr, 20.0);
        assert_eq!(tracker.circuit_state(addr), CircuitState::Closed);
        assert!(tracker.admit(addr).is_ok());
    }

    #[test]
    fn low_success_rate_with_enough_samples_opens_circuit() {
        let tracker = HealthTracker::new(Duration::from_secs(60));
        let addr = ep(4);
        tracker.record_success(addr, 10.0);
        for _ in 0..4 {
            tracker.record_failure(addr, FailureReason::PeerClosed);
        }
        assert_eq!(tracker.circuit_state(addr), CircuitState::Open);
    }

    #[test]
    fn prioritize_orders_healthy_then_unknown_then_unhealthy() {
        let tracker = HealthTracker::new(Duration::from_secs(60));
        let healthy = ep(10);
        let unhealthy = ep(11);
        let unknown = ep(12);
        tracker.record_success(healthy, 5.0);
        tracker.record_success(healthy, 5.0);
        tracker.record_failure(unhealthy, FailureReason::Timeout);
        tracker.record_failure(unhealthy, FailureReason::Timeout);

        let ranked = tracker.prioritize(vec![unhealthy, unknown, healthy]);
        // fewer than 3 healthy+unknown candidates here (1 healthy + 1
        // unknown = 2), so the unhealthy one is appended at the end.
        assert_eq!(ranked, vec![healthy, unknown, unhealthy]);
    }

    #[test]
    fn unhealthy_excluded_when_enough_better_candidates_exist() {
        let tracker = HealthTracker::new(Duration::from_secs(60));
        let unhealthy = ep(20);
        tracker.record_failure(unhealthy, FailureReason::Timeout);
        tracker.record_failure(unhealthy, FailureReason::Timeout);
        let unknowns = vec![ep(21), ep(22), ep(23)];
        let mut candidates = unknowns.clone();
        candidates.push(unhealthy);

        let ranked = tracker.prioritize(candidates);
        assert!(!ranked.contains(&unhealthy));
        assert_eq!(ranked.len(), 3);
    }
}
