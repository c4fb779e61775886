//! # Adaptive Latency Estimation
//!
//! Each (target, operation) pair keeps a bounded history of observed
//! durations. The timeout for the next request is a high percentile of the
//! *successful* samples, scaled by a safety factor and clamped to sane
//! bounds. Until a pair has enough samples we fall back to a fixed default.
//!
//! Failures are recorded too (they show up in stats) but never feed the
//! percentile. A timed-out request is, by definition, as long as the timeout
//! we gave it; letting that back in would ratchet timeouts up forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for timeout derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Timeout used until a pair has `min_samples` successful samples.
    pub default_timeout_ms: u64,
    /// Lower clamp for derived timeouts.
    pub min_timeout_ms: u64,
    /// Upper clamp for derived timeouts.
    pub max_timeout_ms: u64,
    /// Percentile of successful durations used as the base (0, 100].
    pub percentile: f64,
    /// Multiplier applied to the percentile.
    pub safety_factor: f64,
    /// Successful samples required before the estimate is trusted.
    pub min_samples: usize,
    /// Samples retained per (target, operation) pair.
    pub history_capacity: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 15_000,
            min_timeout_ms: 1_000,
            max_timeout_ms: 60_000,
            percentile: 95.0,
            safety_factor: 1.5,
            min_samples: 10,
            history_capacity: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Samples & Measurements
// ---------------------------------------------------------------------------

/// One observed request duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    pub target: String,
    pub operation_type: String,
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An in-progress measurement. Created when a request is dispatched and
/// completed exactly once when the outcome is known.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub id: u64,
    pub target: String,
    pub operation_type: String,
    pub started_at: Instant,
}

/// Summary statistics for one (target, operation) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub target: String,
    pub operation_type: String,
    pub samples: usize,
    pub failures: usize,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub timeout_ms: u64,
}

type PairKey = (String, String);

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Per-target, per-operation latency tracker.
pub struct LatencyEstimator {
    config: LatencyConfig,
    histories: DashMap<PairKey, VecDeque<LatencySample>>,
    next_measurement_id: AtomicU64,
}

impl LatencyEstimator {
    pub fn new(config: LatencyConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
            next_measurement_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LatencyConfig {
        &self.config
    }

    /// Start timing a request to `target`.
    pub fn start_measurement(&self, target: &str, operation_type: &str) -> Measurement {
        Measurement {
            id: self.next_measurement_id.fetch_add(1, Ordering::Relaxed),
            target: target.to_string(),
            operation_type: operation_type.to_string(),
            started_at: Instant::now(),
        }
    }

    /// Finish a measurement and record it. Returns the elapsed milliseconds.
    pub fn complete_measurement(
        &self,
        measurement: &Measurement,
        success: bool,
        error: Option<&str>,
    ) -> u64 {
        let elapsed = measurement.started_at.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.record(
            &measurement.target,
            &measurement.operation_type,
            duration_ms,
            success,
            error,
        );
        trace!(
            measurement = measurement.id,
            peer = %measurement.target,
            operation = %measurement.operation_type,
            duration_ms,
            success,
            "latency measurement completed"
        );
        duration_ms
    }

    /// Record an externally measured sample.
    pub fn record(
        &self,
        target: &str,
        operation_type: &str,
        duration_ms: u64,
        success: bool,
        error: Option<&str>,
    ) {
        let sample = LatencySample {
            target: target.to_string(),
            operation_type: operation_type.to_string(),
            duration_ms,
            success,
            timestamp: Utc::now(),
            error: error.map(str::to_string),
        };
        let mut history = self
            .histories
            .entry((target.to_string(), operation_type.to_string()))
            .or_default();
        while history.len() >= self.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(sample);
    }

    /// Timeout to use for the next request to `target`.
    pub fn timeout_for(&self, target: &str, operation_type: &str) -> Duration {
        let mut successes = self.successful_durations(target, operation_type);
        Duration::from_millis(self.derive_timeout_ms(&mut successes))
    }

    /// Percentile of successful durations, if any exist.
    pub fn percentile(&self, target: &str, operation_type: &str, pct: f64) -> Option<u64> {
        let mut successes = self.successful_durations(target, operation_type);
        successes.sort_unstable();
        percentile_of_sorted(&successes, pct)
    }

    /// Snapshot of every tracked pair.
    pub fn stats(&self) -> Vec<LatencyStats> {
        let mut stats: Vec<LatencyStats> = self
            .histories
            .iter()
            .map(|entry| {
                let (target, operation_type) = entry.key();
                let mut successes: Vec<u64> = entry
                    .value()
                    .iter()
                    .filter(|s| s.success)
                    .map(|s| s.duration_ms)
                    .collect();
                let failures = entry.value().len() - successes.len();
                successes.sort_unstable();
                let timeout_ms = self.derive_timeout_ms(&mut successes);
                LatencyStats {
                    target: target.clone(),
                    operation_type: operation_type.clone(),
                    samples: entry.value().len(),
                    failures,
                    p50_ms: percentile_of_sorted(&successes, 50.0),
                    p95_ms: percentile_of_sorted(&successes, 95.0),
                    p99_ms: percentile_of_sorted(&successes, 99.0),
                    timeout_ms,
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            (a.target.as_str(), a.operation_type.as_str())
                .cmp(&(b.target.as_str(), b.operation_type.as_str()))
        });
        stats
    }

    /// Number of retained samples for a pair.
    pub fn sample_count(&self, target: &str, operation_type: &str) -> usize {
        self.histories
            .get(&(target.to_string(), operation_type.to_string()))
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// Number of (target, operation) pairs being tracked.
    pub fn tracked_pairs(&self) -> usize {
        self.histories.len()
    }

    /// Forget everything about `target`. Called when a device is retired.
    pub fn forget_target(&self, target: &str) -> usize {
        let before = self.histories.len();
        self.histories.retain(|(t, _), _| t != target);
        before.saturating_sub(self.histories.len())
    }

    fn successful_durations(&self, target: &str, operation_type: &str) -> Vec<u64> {
        self.histories
            .get(&(target.to_string(), operation_type.to_string()))
            .map(|h| h.iter().filter(|s| s.success).map(|s| s.duration_ms).collect())
            .unwrap_or_default()
    }

    /// Sorts `successes` in place as a side effect.
    fn derive_timeout_ms(&self, successes: &mut [u64]) -> u64 {
        let cfg = &self.config;
        if successes.len() < cfg.min_samples {
            return cfg.default_timeout_ms;
        }
        successes.sort_unstable();
        let Some(base) = percentile_of_sorted(successes, cfg.percentile) else {
            return cfg.default_timeout_ms;
        };
        let scaled = (base as f64 * cfg.safety_factor).ceil() as u64;
        scaled.max(cfg.min_timeout_ms).min(cfg.max_timeout_ms)
    }
}

/// Nearest-rank percentile over an ascending slice.
pub(crate) fn percentile_of_sorted(sorted: &[u64], pct: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> LatencyConfig {
        LatencyConfig {
            history_capacity: 50,
            ..LatencyConfig::default()
        }
    }

    #[test]
    fn default_timeout_until_enough_samples() {
        let estimator = LatencyEstimator::new(make_config());
        for _ in 0..9 {
            estimator.record("printer-1", "print", 10, true, None);
        }
        assert_eq!(
            estimator.timeout_for("printer-1", "print"),
            Duration::from_millis(15_000)
        );
    }

    #[test]
    fn timeout_converges_to_scaled_percentile() {
        let estimator = LatencyEstimator::new(make_config());
        // 1_000..=1_900 in steps of 100: p95 by nearest rank is 1_900.
        for i in 0..10 {
            estimator.record("printer-1", "print", 1_000 + i * 100, true, None);
        }
        assert_eq!(
            estimator.timeout_for("printer-1", "print"),
            Duration::from_millis(2_850)
        );
    }

    #[test]
    fn derived_timeout_is_clamped() {
        let estimator = LatencyEstimator::new(make_config());
        for _ in 0..20 {
            estimator.record("fast", "ping", 5, true, None);
            estimator.record("slow", "ping", 50_000, true, None);
        }
        assert_eq!(estimator.timeout_for("fast", "ping"), Duration::from_millis(1_000));
        assert_eq!(estimator.timeout_for("slow", "ping"), Duration::from_millis(60_000));
    }

    #[test]
    fn failures_do_not_inflate_the_timeout() {
        let estimator = LatencyEstimator::new(make_config());
        for _ in 0..20 {
            estimator.record("drawer", "open", 1_000, true, None);
            estimator.record("drawer", "open", 59_000, false, Some("timeout"));
        }
        assert_eq!(estimator.timeout_for("drawer", "open"), Duration::from_millis(1_500));
        let stats = estimator.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].failures, 20);
    }

    #[test]
    fn history_is_bounded() {
        let estimator = LatencyEstimator::new(make_config());
        for i in 0..120 {
            estimator.record("kds", "render", i, true, None);
        }
        assert_eq!(estimator.sample_count("kds", "render"), 50);
        // Oldest samples went first, so the minimum retained is 70.
        assert_eq!(estimator.percentile("kds", "render", 0.1), Some(70));
    }

    #[test]
    fn pairs_are_tracked_independently() {
        let estimator = LatencyEstimator::new(make_config());
        for _ in 0..10 {
            estimator.record("a", "print", 2_000, true, None);
        }
        assert_eq!(estimator.timeout_for("a", "print"), Duration::from_millis(3_000));
        assert_eq!(estimator.timeout_for("a", "cut"), Duration::from_millis(15_000));
        assert_eq!(estimator.timeout_for("b", "print"), Duration::from_millis(15_000));
        assert_eq!(estimator.tracked_pairs(), 1);
    }

    #[test]
    fn forget_target_drops_all_operations() {
        let estimator = LatencyEstimator::new(make_config());
        estimator.record("a", "print", 1, true, None);
        estimator.record("a", "cut", 1, true, None);
        estimator.record("b", "print", 1, true, None);
        assert_eq!(estimator.forget_target("a"), 2);
        assert_eq!(estimator.tracked_pairs(), 1);
    }

    #[test]
    fn nearest_rank_percentile() {
        let sorted = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile_of_sorted(&sorted, 50.0), Some(50));
        assert_eq!(percentile_of_sorted(&sorted, 95.0), Some(100));
        assert_eq!(percentile_of_sorted(&sorted, 100.0), Some(100));
        assert_eq!(percentile_of_sorted(&[], 95.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_reports_elapsed_time() {
        let estimator = LatencyEstimator::new(make_config());
        let m = estimator.start_measurement("printer-2", "print");
        tokio::time::advance(Duration::from_millis(250)).await;
        let elapsed = estimator.complete_measurement(&m, true, None);
        assert_eq!(elapsed, 250);
        assert_eq!(estimator.sample_count("printer-2", "print"), 1);
    }
}
