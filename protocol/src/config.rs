//! # Protocol Configuration & Constants
//!
//! Every magic number in Tether lives here or in the `Default` impl of the
//! component config it belongs to. If you're hardcoding a timeout somewhere
//! else, you're doing it wrong and you owe the team coffee.
//!
//! [`HubConfig`] aggregates the per-component configs so a hub can be tuned
//! from a single TOML file. Every field is `#[serde(default)]`, so a config
//! file only needs to mention what it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::bridge::BridgeConfig;
use crate::hub::connections::ConnectionConfig;
use crate::hub::correlation::CorrelationConfig;
use crate::reliability::circuit::CircuitBreakerConfig;
use crate::reliability::idempotency::IdempotencyConfig;
use crate::reliability::latency::LatencyConfig;
use crate::reliability::rate_limit::RateLimitConfig;

// ---------------------------------------------------------------------------
// Wire Protocol Version
// ---------------------------------------------------------------------------

/// Wire protocol version spoken by this build. Bumped whenever a frame
/// changes shape in a way an older peer can't ignore.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Oldest peer protocol version the hub still accepts. Peers below this get
/// a polite `close` frame and nothing else.
pub const MIN_WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Network Defaults
// ---------------------------------------------------------------------------

/// Default port for the hub's HTTP + WebSocket surface.
pub const DEFAULT_HUB_PORT: u16 = 7400;

/// Default port for the Prometheus scrape endpoint. Kept clear of the
/// range extra in-process hub instances bind after `DEFAULT_HUB_PORT`.
pub const DEFAULT_METRICS_PORT: u16 = 7490;

/// Path peers connect to for the bidirectional channel.
pub const PEER_CHANNEL_PATH: &str = "/ws";

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// How often the hub pings each connected peer.
pub const HEARTBEAT_INTERVAL_MS: u64 = 25_000;

/// A peer that hasn't answered a ping for this long is flagged as degraded.
/// It stays connected; the transport decides when it's actually gone.
pub const DEGRADED_AFTER_MS: u64 = 60_000;

/// Cadence of the maintenance sweep (idempotency cache, rate windows, stale
/// correlations, silent cluster instances).
pub const SWEEP_INTERVAL_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Hub Configuration
// ---------------------------------------------------------------------------

/// Configuration errors. Raised at startup, never at request time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range or contradicts another value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a hub instance needs to know, in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Identifier of this hub instance within the cluster. Must be unique
    /// across instances sharing a bridge.
    pub instance_id: String,
    /// Interval between maintenance sweeps.
    pub sweep_interval_ms: u64,
    pub latency: LatencyConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub idempotency: IdempotencyConfig,
    pub rate_limit: RateLimitConfig,
    pub correlation: CorrelationConfig,
    pub connections: ConnectionConfig,
    pub bridge: BridgeConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            latency: LatencyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            correlation: CorrelationConfig::default(),
            connections: ConnectionConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl HubConfig {
    /// Default config with an explicit instance id. Handy for tests and for
    /// running several instances in one process.
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject configurations that would make the reliability layer
    /// misbehave. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }

        let latency = &self.latency;
        if latency.min_timeout_ms == 0 || latency.min_timeout_ms > latency.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "latency timeout bounds are inverted: min {} > max {}",
                latency.min_timeout_ms, latency.max_timeout_ms
            )));
        }
        if !(latency.min_timeout_ms..=latency.max_timeout_ms).contains(&latency.default_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "latency default timeout {}ms is outside [{}, {}]",
                latency.default_timeout_ms, latency.min_timeout_ms, latency.max_timeout_ms
            )));
        }
        if !(latency.percentile > 0.0 && latency.percentile <= 100.0) {
            return Err(ConfigError::Invalid("latency percentile must be in (0, 100]".into()));
        }
        if latency.safety_factor < 1.0 {
            return Err(ConfigError::Invalid("latency safety factor must be >= 1.0".into()));
        }
        if latency.history_capacity == 0 {
            return Err(ConfigError::Invalid("latency history capacity must be positive".into()));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0
            || breaker.success_threshold == 0
            || breaker.half_open_max_probes == 0
        {
            return Err(ConfigError::Invalid(
                "circuit breaker thresholds and probe limit must be positive".into(),
            ));
        }

        if self.idempotency.max_entries == 0 {
            return Err(ConfigError::Invalid("idempotency max_entries must be positive".into()));
        }

        // A stale sweep must never beat the timer that should have fired first.
        if self.correlation.stale_after_ms <= latency.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "correlation stale threshold {}ms must exceed the max timeout {}ms",
                self.correlation.stale_after_ms, latency.max_timeout_ms
            )));
        }

        if self.connections.heartbeat_interval_ms >= self.connections.degraded_after_ms {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be shorter than the degraded threshold".into(),
            ));
        }

        Ok(())
    }
}

fn default_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("hub-{}", &id[..8])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
