//! # Per-Target Circuit Breaker
//!
//! A peer that keeps failing gets cut off for a while instead of eating a
//! full timeout on every request.
//!
//! ```text
//!            failures >= threshold              open timeout elapsed
//!   CLOSED ─────────────────────────► OPEN ─────────────────────────► HALF_OPEN
//!     ▲                                 ▲                                 │
//!     │     successes >= threshold      │          any failure            │
//!     └─────────────────────────────────┼─────────────────────────────────┤
//!                                       └─────────────────────────────────┘
//! ```
//!
//! Failures only count toward opening if they land inside the rolling
//! monitoring window; a peer that fails once an hour never trips. In
//! HALF_OPEN only a bounded number of probe requests are let through.
//!
//! Callers take a [`CircuitPermit`] before sending and settle it with the
//! outcome. A permit dropped without settling releases its probe slot and
//! records nothing, so a cancelled request never wedges a half-open circuit.
//!
//! Every state change bumps the circuit's epoch, and a permit remembers the
//! epoch it was issued in. An outcome that settles after the state moved on
//! is counted in the totals but cannot move the circuit, nor free a
//! half-open slot in a period it was never admitted to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitoring window that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long an open circuit fails fast before probing.
    pub open_timeout_ms: u64,
    /// Rolling window for counting failures while closed.
    pub monitoring_window_ms: u64,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
            half_open_max_probes: 2,
        }
    }
}

impl CircuitBreakerConfig {
    fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Errors that may or may not count against a circuit.
pub trait TripsBreaker {
    /// `true` if this failure says something about the target's health.
    fn trips_breaker(&self) -> bool;
}

/// Returned when a request is refused without being attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub target: String,
    /// Time until the circuit will admit a probe. Zero while half-open and
    /// saturated with probes.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every transition.
    epoch: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window_started_at: None,
            opened_at: None,
            probes_in_flight: 0,
            epoch: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn transition(&mut self, target: &str, to: CircuitState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.epoch += 1;
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                warn!(circuit = target, from = ?from, to = ?to, failures = self.consecutive_failures, "circuit opened");
            }
            CircuitState::HalfOpen => {
                info!(circuit = target, from = ?from, to = ?to, "circuit probing");
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.window_started_at = None;
                self.opened_at = None;
                info!(circuit = target, from = ?from, to = ?to, "circuit closed");
            }
        }
    }
}

/// Point-in-time view of one circuit, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub probes_in_flight: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// Milliseconds since the circuit last opened, if it's not closed.
    pub open_for_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Independent circuits, one per target key.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitRecord>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to send one request to `target`.
    pub fn try_acquire(self: &Arc<Self>, target: &str) -> Result<CircuitPermit, CircuitOpen> {
        let now = Instant::now();
        let mut record = self
            .circuits
            .entry(target.to_string())
            .or_insert_with(CircuitRecord::new);

        if record.state == CircuitState::Open {
            let opened_at = record.opened_at.unwrap_or(now);
            let open_for = now.saturating_duration_since(opened_at);
            let open_timeout = self.config.open_timeout();
            if open_for < open_timeout {
                record.total_rejections += 1;
                return Err(CircuitOpen {
                    target: target.to_string(),
                    retry_after: open_timeout - open_for,
                });
            }
            record.transition(target, CircuitState::HalfOpen, now);
        }

        let probe = record.state == CircuitState::HalfOpen;
        if probe {
            if record.probes_in_flight >= self.config.half_open_max_probes {
                record.total_rejections += 1;
                debug!(circuit = target, "half-open probe limit reached");
                return Err(CircuitOpen {
                    target: target.to_string(),
                    retry_after: Duration::ZERO,
                });
            }
            record.probes_in_flight += 1;
        }
        let epoch = record.epoch;
        drop(record);

        Ok(CircuitPermit {
            breaker: Arc::clone(self),
            target: target.to_string(),
            probe,
            epoch,
            settled: false,
        })
    }

    /// Run `operation` under the circuit for `target`, or `fallback` if the
    /// circuit refuses. Errors that don't trip the breaker are passed
    /// through without being counted.
    pub async fn execute<T, E, F, Fut, FB>(
        self: &Arc<Self>,
        target: &str,
        operation: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        E: TripsBreaker,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitOpen) -> Result<T, E>,
    {
        let permit = match self.try_acquire(target) {
            Ok(permit) => permit,
            Err(open) => return fallback(open),
        };
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) if e.trips_breaker() => permit.fail(),
            Err(_) => permit.release(),
        }
        result
    }

    /// Current state. Doesn't advance OPEN to HALF_OPEN; only an acquire
    /// does that.
    pub fn state(&self, target: &str) -> CircuitState {
        self.circuits
            .get(target)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// `true` if a request to `target` would be refused right now.
    pub fn is_open(&self, target: &str) -> bool {
        match self.circuits.get(target) {
            Some(record) => match record.state {
                CircuitState::Closed => false,
                CircuitState::Open => record
                    .opened_at
                    .map(|at| at.elapsed() < self.config.open_timeout())
                    .unwrap_or(false),
                CircuitState::HalfOpen => {
                    record.probes_in_flight >= self.config.half_open_max_probes
                }
            },
            None => false,
        }
    }

    pub fn metrics_for(&self, target: &str) -> Option<CircuitMetrics> {
        self.circuits.get(target).map(|r| to_metrics(r.key(), &r))
    }

    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        let mut all: Vec<CircuitMetrics> = self
            .circuits
            .iter()
            .map(|r| to_metrics(r.key(), r.value()))
            .collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    /// Number of circuits not in CLOSED.
    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|r| r.state != CircuitState::Closed)
            .count()
    }

    /// Forget a target entirely.
    pub fn reset(&self, target: &str) {
        if self.circuits.remove(target).is_some() {
            debug!(circuit = target, "circuit reset");
        }
    }

    fn record_outcome(&self, target: &str, success: bool, probe: bool, epoch: u64) {
        let now = Instant::now();
        let Some(mut record) = self.circuits.get_mut(target) else {
            // Reset while the request was in flight.
            return;
        };

        if record.epoch != epoch {
            if success {
                record.total_successes += 1;
            } else {
                record.total_failures += 1;
            }
            debug!(circuit = target, success, "outcome from an earlier circuit state ignored");
            return;
        }
        if probe {
            record.probes_in_flight = record.probes_in_flight.saturating_sub(1);
        }

        if success {
            record.total_successes += 1;
            record.consecutive_failures = 0;
            record.window_started_at = None;
            record.consecutive_successes += 1;
            if record.state == CircuitState::HalfOpen
                && record.consecutive_successes >= self.config.success_threshold
            {
                record.transition(target, CircuitState::Closed, now);
            }
            return;
        }

        record.total_failures += 1;
        record.consecutive_successes = 0;
        match record.state {
            CircuitState::Closed => {
                let window_expired = record
                    .window_started_at
                    .map(|start| now.saturating_duration_since(start) > self.config.monitoring_window())
                    .unwrap_or(true);
                if window_expired {
                    record.window_started_at = Some(now);
                    record.consecutive_failures = 0;
                }
                record.consecutive_failures += 1;
                if record.consecutive_failures >= self.config.failure_threshold {
                    record.transition(target, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                record.consecutive_failures += 1;
                record.transition(target, CircuitState::Open, now);
            }
            // Only a permit from an earlier epoch can settle while open,
            // and those return above.
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self, target: &str, epoch: u64) {
        if let Some(mut record) = self.circuits.get_mut(target) {
            if record.epoch == epoch {
                record.probes_in_flight = record.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

fn to_metrics(target: &str, record: &CircuitRecord) -> CircuitMetrics {
    CircuitMetrics {
        target: target.to_string(),
        state: record.state,
        consecutive_failures: record.consecutive_failures,
        consecutive_successes: record.consecutive_successes,
        probes_in_flight: record.probes_in_flight,
        total_successes: record.total_successes,
        total_failures: record.total_failures,
        total_rejections: record.total_rejections,
        open_for_ms: record
            .opened_at
            .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Permission to send one request. Settle it with the outcome.
#[must_use = "an unsettled permit records nothing"]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    target: String,
    probe: bool,
    epoch: u64,
    settled: bool,
}

impl CircuitPermit {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// `true` if this permit is one of the half-open probes.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settle(Some(true));
    }

    pub fn fail(mut self) {
        self.settle(Some(false));
    }

    /// Give the permit back without recording an outcome.
    pub fn release(mut self) {
        self.settle(None);
    }

    fn settle(&mut self, outcome: Option<bool>) {
        if self.settled {
            return;
        }
        self.settled = true;
        match outcome {
            Some(success) => {
                self.breaker
                    .record_outcome(&self.target, success, self.probe, self.epoch)
            }
            None if self.probe => self.breaker.release_probe(&self.target, self.epoch),
            None => {}
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        self.settle(None);
    }
}

impl std::fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("target", &self.target)
            .field("probe", &self.probe)
            .field("epoch", &self.epoch)
            .field("settled", &self.settled)
            .finish()
    }
}
