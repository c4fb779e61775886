//! # Correlation Registry
//!
//! Maps correlation ids to the continuation waiting on them. Four things can
//! complete a pending request: the peer's response, its timeout timer, the
//! target disconnecting, or the caller cancelling. They race freely; the
//! one that removes the entry from the map delivers the outcome and every
//! other path finds nothing and does nothing.
//!
//! Registration always happens before the request frame is sent. A peer
//! that answers faster than we can blink still finds its continuation.
//!
//! A request registered with a [`CircuitPermit`] settles it on whichever path
//! completes it, so a timeout reaches the breaker when the timer fires even
//! if nobody is awaiting the outcome yet.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::error::{DispatchError, RegistryError};
use crate::reliability::{CircuitPermit, LatencyEstimator, Measurement, TripsBreaker};
use crate::wire::ResponseEnvelope;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Entries older than this are swept as timed out even if their timer
    /// never fired. Must exceed the largest possible request timeout.
    pub stale_after_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 120_000,
        }
    }
}

/// New, globally unique correlation id.
pub fn new_correlation_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

type Completion = Result<ResponseEnvelope, DispatchError>;

struct PendingRequest {
    operation_type: String,
    target: String,
    created_at: Instant,
    expires_at: Instant,
    measurement: Measurement,
    permit: Option<CircuitPermit>,
    responder: oneshot::Sender<Completion>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    /// Feed the breaker, then wake the waiter.
    fn complete(mut self, outcome: Completion) {
        if let Some(permit) = self.permit.take() {
            match &outcome {
                Ok(_) => permit.succeed(),
                Err(e) if e.trips_breaker() => permit.fail(),
                Err(_) => permit.release(),
            }
        }
        // The caller may have stopped listening; that's fine.
        let _ = self.responder.send(outcome);
    }
}

/// Monitoring view of one pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub correlation_id: String,
    pub operation_type: String,
    pub target: String,
    pub age_ms: u64,
    pub expires_in_ms: u64,
}

/// The receiving half of a registration.
#[must_use = "a pending response must be awaited or the request is wasted"]
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: String,
    receiver: oneshot::Receiver<Completion>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the outcome. Safe to call through `&mut` so the caller can
    /// keep ownership across a cancelled await.
    pub async fn wait(&mut self) -> Completion {
        match (&mut self.receiver).await {
            Ok(completion) => completion,
            // Sender dropped without completing: the registry itself went
            // away. Treat it like a cancellation.
            Err(_) => Err(DispatchError::Cancelled {
                correlation_id: self.correlation_id.clone(),
            }),
        }
    }
}

struct RegistryInner {
    config: CorrelationConfig,
    pending: DashMap<String, PendingRequest>,
    latency: Arc<LatencyEstimator>,
}

/// Pending request table. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

impl CorrelationRegistry {
    pub fn new(config: CorrelationConfig, latency: Arc<LatencyEstimator>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                pending: DashMap::new(),
                latency,
            }),
        }
    }

    /// Register a continuation and arm its timeout.
    pub fn register(
        &self,
        correlation_id: &str,
        operation_type: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<PendingResponse, RegistryError> {
        self.insert(correlation_id, operation_type, target, target, timeout, None)
    }

    /// Register a request that holds a circuit permit. `target` is the
    /// channel the frame goes out on; `health_key` names the latency
    /// history and circuit the outcome is charged to.
    pub fn register_guarded(
        &self,
        correlation_id: &str,
        operation_type: &str,
        target: &str,
        health_key: &str,
        timeout: Duration,
        permit: CircuitPermit,
    ) -> Result<PendingResponse, RegistryError> {
        self.insert(
            correlation_id,
            operation_type,
            target,
            health_key,
            timeout,
            Some(permit),
        )
    }

    fn insert(
        &self,
        correlation_id: &str,
        operation_type: &str,
        target: &str,
        health_key: &str,
        timeout: Duration,
        permit: Option<CircuitPermit>,
    ) -> Result<PendingResponse, RegistryError> {
        let (responder, receiver) = oneshot::channel();
        let now = Instant::now();

        match self.inner.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                error!(correlation_id, "duplicate correlation id registration");
                return Err(RegistryError::DuplicateCorrelation(correlation_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    operation_type: operation_type.to_string(),
                    target: target.to_string(),
                    created_at: now,
                    expires_at: now + timeout,
                    measurement: self.inner.latency.start_measurement(health_key, operation_type),
                    permit,
                    responder,
                    timer: None,
                });
            }
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let id = correlation_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id);
            }
        });
        match self.inner.pending.get_mut(correlation_id) {
            Some(mut entry) => entry.timer = Some(timer),
            // Already completed in the meantime.
            None => timer.abort(),
        }

        trace!(
            correlation_id,
            operation = operation_type,
            peer = target,
            timeout_ms = timeout.as_millis() as u64,
            "request registered"
        );
        Ok(PendingResponse {
            correlation_id: correlation_id.to_string(),
            receiver,
        })
    }

    /// Deliver a peer's response. Returns `false` if nothing was waiting:
    /// a late duplicate, a response after timeout, or an id we never issued.
    pub fn resolve(&self, envelope: ResponseEnvelope) -> bool {
        let Some(pending) = self.inner.take(&envelope.correlation_id) else {
            debug!(
                correlation_id = %envelope.correlation_id,
                "response for unknown or already completed request"
            );
            return false;
        };

        self.inner.latency.complete_measurement(
            &pending.measurement,
            envelope.success,
            envelope.error.as_deref(),
        );
        let outcome = if envelope.success {
            Ok(envelope)
        } else {
            Err(DispatchError::Rejected {
                message: envelope
                    .error
                    .unwrap_or_else(|| "peer reported failure".to_string()),
                correlation_id: envelope.correlation_id,
            })
        };
        pending.complete(outcome);
        true
    }

    /// Complete with [`DispatchError::Cancelled`].
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let completed = self.fail(
            correlation_id,
            DispatchError::Cancelled {
                correlation_id: correlation_id.to_string(),
            },
        );
        if completed {
            debug!(correlation_id, "request cancelled");
        }
        completed
    }

    /// Complete with an arbitrary error. No latency sample is recorded;
    /// the peer never got a chance to answer.
    pub fn fail(&self, correlation_id: &str, error: DispatchError) -> bool {
        match self.inner.take(correlation_id) {
            Some(pending) => {
                pending.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove an entry without completing it. The waiter sees a
    /// cancellation and any permit is released unused. Used when the
    /// request never made it onto the wire.
    pub fn discard(&self, correlation_id: &str) -> bool {
        self.inner.take(correlation_id).is_some()
    }

    /// Fail every request pending on `target` with
    /// [`DispatchError::Unavailable`]. Returns how many were failed.
    pub fn reject_target(&self, target: &str, reason: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.target == target)
            .map(|entry| entry.key().clone())
            .collect();
        let rejected = ids
            .iter()
            .filter(|id| {
                self.fail(
                    id,
                    DispatchError::Unavailable {
                        target: target.to_string(),
                        reason: reason.to_string(),
                    },
                )
            })
            .count();
        if rejected > 0 {
            warn!(peer = target, rejected, reason, "pending requests rejected");
        }
        rejected
    }

    /// Time out entries that outlived the stale threshold. A backstop for
    /// timers that were lost; in normal operation this finds nothing.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let stale_after = Duration::from_millis(self.inner.config.stale_after_ms);
        let stale: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.created_at) >= stale_after)
            .map(|entry| entry.key().clone())
            .collect();
        let expired = stale.iter().filter(|id| self.inner.expire(id)).count();
        if expired > 0 {
            warn!(expired, "stale pending requests swept");
        }
        expired
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }

    /// Pending requests, oldest first.
    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut all: Vec<(Instant, PendingSummary)> = self
            .inner
            .pending
            .iter()
            .map(|entry| {
                let p = entry.value();
                (
                    p.created_at,
                    PendingSummary {
                        correlation_id: entry.key().clone(),
                        operation_type: p.operation_type.clone(),
                        target: p.target.clone(),
                        age_ms: millis(now.saturating_duration_since(p.created_at)),
                        expires_in_ms: millis(p.expires_at.saturating_duration_since(now)),
                    },
                )
            })
            .collect();
        all.sort_by_key(|(created, _)| *created);
        all.into_iter().map(|(_, summary)| summary).collect()
    }
}

impl RegistryInner {
    /// Remove an entry and disarm its timer. Whoever gets `Some` owns the
    /// completion.
    fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        let (_, pending) = self.pending.remove(correlation_id)?;
        if let Some(timer) = &pending.timer {
            timer.abort();
        }
        Some(pending)
    }

    /// Timeout path. Called from the request's own timer task, so it must
    /// not abort that timer.
    fn expire(&self, correlation_id: &str) -> bool {
        let Some((_, pending)) = self.pending.remove(correlation_id) else {
            return false;
        };
        let timeout_ms = millis(pending.expires_at.saturating_duration_since(pending.created_at));
        self.latency
            .complete_measurement(&pending.measurement, false, Some("timeout"));
        warn!(
            correlation_id,
            peer = %pending.target,
            operation = %pending.operation_type,
            timeout_ms,
            "request timed out"
        );
        pending.complete(Err(DispatchError::Timeout {
            correlation_id: correlation_id.to_string(),
            timeout_ms,
        }));
        true
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, LatencyConfig};
    use serde_json::json;

    fn make_registry() -> (CorrelationRegistry, Arc<LatencyEstimator>) {
        let latency = Arc::new(LatencyEstimator::new(LatencyConfig::default()));
        let registry = CorrelationRegistry::new(CorrelationConfig::default(), Arc::clone(&latency));
        (registry, latency)
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn response_completes_exactly_once() {
        let (registry, latency) = make_registry();
        let mut pending = registry.register("req-1", "print", "ch-1", SECOND).unwrap();

        assert!(registry.resolve(ResponseEnvelope::success("req-1", json!({"ok": true}))));
        // Late duplicate is dropped.
        assert!(!registry.resolve(ResponseEnvelope::success("req-1", json!({"ok": false}))));

        let response = pending.wait().await.unwrap();
        assert_eq!(response.payload, Some(json!({"ok": true})));
        assert!(registry.is_empty());
        assert_eq!(latency.sample_count("ch-1", "print"), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let (registry, _) = make_registry();
        let _first = registry.register("req-1", "print", "ch-1", SECOND).unwrap();
        let second = registry.register("req-1", "print", "ch-1", SECOND);
        assert_eq!(
            second.unwrap_err(),
            RegistryError::DuplicateCorrelation("req-1".into())
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_timeout_and_records_failure() {
        let (registry, latency) = make_registry();
        let mut pending = registry
            .register("req-1", "print", "ch-1", Duration::from_millis(500))
            .unwrap();

        let outcome = pending.wait().await;
        assert_eq!(
            outcome,
            Err(DispatchError::Timeout {
                correlation_id: "req-1".into(),
                timeout_ms: 500
            })
        );
        assert!(!registry.contains("req-1"));
        assert_eq!(latency.stats()[0].failures, 1);
        // A response arriving after the timeout is a no-op.
        assert!(!registry.resolve(ResponseEnvelope::success("req-1", json!(null))));
    }

    #[tokio::test]
    async fn peer_failure_becomes_rejected() {
        let (registry, _) = make_registry();
        let mut pending = registry.register("req-1", "print", "ch-1", SECOND).unwrap();
        registry.resolve(ResponseEnvelope::failure("req-1", "out of paper"));
        assert_eq!(
            pending.wait().await,
            Err(DispatchError::Rejected {
                correlation_id: "req-1".into(),
                message: "out of paper".into()
            })
        );
    }

    #[tokio::test]
    async fn cancel_wins_over_late_response() {
        let (registry, latency) = make_registry();
        let mut pending = registry.register("req-1", "print", "ch-1", SECOND).unwrap();
        assert!(registry.cancel("req-1"));
        assert!(!registry.cancel("req-1"));
        assert!(!registry.resolve(ResponseEnvelope::success("req-1", json!(1))));
        assert!(matches!(pending.wait().await, Err(DispatchError::Cancelled { .. })));
        assert_eq!(latency.tracked_pairs(), 0);
    }

    #[tokio::test]
    async fn reject_target_only_hits_that_target() {
        let (registry, _) = make_registry();
        let mut a1 = registry.register("a1", "print", "ch-a", SECOND).unwrap();
        let mut a2 = registry.register("a2", "cut", "ch-a", SECOND).unwrap();
        let _b1 = registry.register("b1", "print", "ch-b", SECOND).unwrap();

        assert_eq!(registry.reject_target("ch-a", "disconnected"), 2);
        assert!(matches!(a1.wait().await, Err(DispatchError::Unavailable { .. })));
        assert!(matches!(a2.wait().await, Err(DispatchError::Unavailable { .. })));
        assert!(registry.contains("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_catches_entries_past_stale_threshold() {
        let latency = Arc::new(LatencyEstimator::new(LatencyConfig::default()));
        let registry = CorrelationRegistry::new(
            CorrelationConfig { stale_after_ms: 1_000 },
            latency,
        );
        // Timer far beyond the stale threshold, as if it had been lost.
        let mut pending = registry
            .register("req-1", "print", "ch-1", Duration::from_secs(3_600))
            .unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(registry.sweep_expired(), 0);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(registry.sweep_expired(), 1);
        assert!(matches!(pending.wait().await, Err(DispatchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_break_resolution() {
        let (registry, _) = make_registry();
        let pending = registry.register("req-1", "print", "ch-1", SECOND).unwrap();
        drop(pending);
        assert!(registry.resolve(ResponseEnvelope::success("req-1", json!(null))));
    }

    #[tokio::test]
    async fn snapshot_lists_pending_oldest_first() {
        let (registry, _) = make_registry();
        let _a = registry.register("a", "print", "ch-1", SECOND).unwrap();
        let _b = registry.register("b", "cut", "ch-2", SECOND).unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|s| s.correlation_id == "a" && s.target == "ch-1"));
        assert!(snapshot.iter().all(|s| s.expires_in_ms <= 1_000));
    }

    fn make_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_permit_before_anyone_awaits() {
        let (registry, latency) = make_registry();
        let breaker = make_breaker();
        let permit = breaker.try_acquire("printer-1").unwrap();
        let mut pending = registry
            .register_guarded("req-1", "print", "ch-1", "printer-1", Duration::from_millis(500), permit)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(501)).await;
        let metrics = breaker.metrics_for("printer-1").unwrap();
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(latency.sample_count("printer-1", "print"), 1);
        assert_eq!(latency.sample_count("ch-1", "print"), 0);
        assert!(matches!(pending.wait().await, Err(DispatchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn guarded_outcomes_reach_the_breaker() {
        let (registry, _) = make_registry();
        let breaker = make_breaker();

        let permit = breaker.try_acquire("kds").unwrap();
        let _ok = registry
            .register_guarded("ok", "print", "ch-1", "kds", SECOND, permit)
            .unwrap();
        registry.resolve(ResponseEnvelope::success("ok", json!(null)));

        let permit = breaker.try_acquire("kds").unwrap();
        let _cancelled = registry
            .register_guarded("cancelled", "print", "ch-1", "kds", SECOND, permit)
            .unwrap();
        registry.cancel("cancelled");

        let permit = breaker.try_acquire("kds").unwrap();
        let _gone = registry
            .register_guarded("gone", "print", "ch-1", "kds", SECOND, permit)
            .unwrap();
        registry.reject_target("ch-1", "disconnected");

        let metrics = breaker.metrics_for("kds").unwrap();
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_returns_the_half_open_slot() {
        let (registry, _) = make_registry();
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            half_open_max_probes: 1,
            ..CircuitBreakerConfig::default()
        }));
        breaker.try_acquire("kds").unwrap().fail();
        tokio::time::advance(Duration::from_millis(30_000)).await;

        let permit = breaker.try_acquire("kds").unwrap();
        let _pending = registry
            .register_guarded("req-1", "print", "ch-1", "kds", SECOND, permit)
            .unwrap();
        assert!(breaker.try_acquire("kds").is_err());
        assert!(registry.discard("req-1"));
        assert!(breaker.try_acquire("kds").is_ok());
    }

    #[test]
    fn correlation_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1_000).map(|_| new_correlation_id()).collect();
        assert_eq!(ids.len(), 1_000);
    }
}
