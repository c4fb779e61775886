//! # Reliability Primitives
//!
//! Building blocks the transport gateway composes on every request. None of
//! them know what a connection or a peer is; they deal in opaque string keys
//! (`target`, `scope`, `idempotency key`) and monotonic time.
//!
//! | Component          | Keyed by                 | Answers                        |
//! |--------------------|--------------------------|--------------------------------|
//! | [`LatencyEstimator`] | (target, operation)    | "how long should I wait?"      |
//! | [`CircuitBreaker`]   | target                 | "should I even try?"           |
//! | [`IdempotencyCache`] | idempotency key        | "have I already done this?"    |
//! | [`RateLimiter`]      | scope                  | "is this caller going too fast?" |

pub mod circuit;
pub mod idempotency;
pub mod latency;
pub mod rate_limit;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitOpen, CircuitPermit, CircuitState,
    TripsBreaker,
};
pub use idempotency::{IdempotencyCache, IdempotencyCheck, IdempotencyConfig, IdempotencyKey};
pub use latency::{LatencyConfig, LatencyEstimator, LatencySample, LatencyStats, Measurement};
pub use rate_limit::{RateDecision, RateLimit, RateLimitConfig, RateLimiter, RateRejection};
