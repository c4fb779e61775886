//! Error types for the hub.
//!
//! [`DispatchError`] is what callers of the gateway see. It's the complete
//! list of ways a request can fail to produce a payload, and it serializes
//! so the HTTP layer can hand it straight to clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reliability::TripsBreaker;

/// Why a dispatch didn't produce a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// No live connection could serve the target, or the one chosen went
    /// away before answering.
    #[error("target {target} unavailable: {reason}")]
    Unavailable {
        /// The selector or channel that couldn't be served.
        target: String,
        reason: String,
    },

    /// The caller exceeded a rate limit. Nothing was sent.
    #[error("rate limited on {scope}, retry after {retry_after_secs}s")]
    RateLimited {
        /// Scope key that refused (`group:..` or `target:..`).
        scope: String,
        retry_after_secs: u64,
    },

    /// The target's circuit is open. Nothing was sent.
    #[error("circuit open for {target}, retry after {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    /// The peer didn't answer within the adaptive timeout.
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    /// The peer answered with `success: false`.
    #[error("request {correlation_id} rejected by peer: {message}")]
    Rejected {
        correlation_id: String,
        message: String,
    },

    /// The caller cancelled before an outcome arrived.
    #[error("request {correlation_id} cancelled")]
    Cancelled { correlation_id: String },
}

impl DispatchError {
    /// Stable short name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Unavailable { .. } => "unavailable",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Rejected { .. } => "rejected",
            DispatchError::Cancelled { .. } => "cancelled",
        }
    }

    /// How long the caller should wait before retrying, when we know.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::RateLimited { retry_after_secs, .. } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            DispatchError::CircuitOpen { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

impl TripsBreaker for DispatchError {
    /// Only failures that say something about the peer count. Refusals we
    /// generated ourselves, cancellations and disconnects don't.
    fn trips_breaker(&self) -> bool {
        matches!(
            self,
            DispatchError::Timeout { .. } | DispatchError::Rejected { .. }
        )
    }
}

/// Correlation registry contract violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A correlation id was registered twice. Ids are UUIDs, so this is a
    /// bug in whoever generated it.
    #[error("correlation id {0} is already registered")]
    DuplicateCorrelation(String),
}

/// Connection registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("channel {0} is already registered")]
    DuplicateChannel(String),

    #[error("unknown channel {0}")]
    UnknownChannel(String),

    /// The channel's outbound queue is gone; the socket task has exited.
    #[error("channel {0} is closed")]
    ChannelClosed(String),
}

/// Cluster bridge failures. All of them degrade the hub to single-instance
/// operation rather than failing requests outright.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("cluster bridge unavailable")]
    Unavailable,

    #[error("malformed bridge frame: {0}")]
    Malformed(String),
}
