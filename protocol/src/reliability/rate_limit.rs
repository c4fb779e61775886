//! # Fixed-Window Rate Limiting
//!
//! Each scope key (`group:<id>`, `target:<device or channel>`) gets a
//! counter and a window reset time. The first request after the reset time
//! opens a new window. A rejected request does not consume quota.
//!
//! A dispatch is checked against several scopes at once: a coarse one for
//! each group the target belongs to and a fine one for the target itself.
//! [`RateLimiter::check_scopes`] peeks every scope before committing to any,
//! so a request refused by the fine scope doesn't burn coarse quota.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per window aimed at one group. Zero disables the limit.
    pub group_limit: u32,
    pub group_window_ms: u64,
    /// Requests per window aimed at one target. Zero disables the limit.
    pub target_limit: u32,
    pub target_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            group_limit: 120,
            group_window_ms: 60_000,
            target_limit: 30,
            target_window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn group(&self) -> RateLimit {
        RateLimit::new(self.group_limit, Duration::from_millis(self.group_window_ms))
    }

    pub fn target(&self) -> RateLimit {
        RateLimit::new(self.target_limit, Duration::from_millis(self.target_window_ms))
    }
}

/// `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == 0 || self.window.is_zero()
    }
}

/// Outcome of a single-scope check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Quota left in the current window after this request.
    pub remaining: u32,
    /// Whole seconds until the window resets, when refused. Never zero.
    pub retry_after_secs: Option<u64>,
}

/// Which scope refused a multi-scope check, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRejection {
    pub scope: String,
    pub retry_after_secs: u64,
}

struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window counters keyed by scope.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `scope` if quota allows.
    pub fn check(&self, scope: &str, limit: RateLimit) -> RateDecision {
        if limit.is_unlimited() {
            return RateDecision {
                allowed: true,
                remaining: u32::MAX,
                retry_after_secs: None,
            };
        }

        let now = Instant::now();
        let mut window = self
            .windows
            .entry(scope.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                reset_at: now + limit.window,
            });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + limit.window;
        }

        if window.count >= limit.limit {
            let retry = retry_after_secs(window.reset_at - now);
            debug!(scope, limit = limit.limit, retry_after_secs = retry, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: Some(retry),
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: limit.limit - window.count,
            retry_after_secs: None,
        }
    }

    /// Check several scopes, charging them only if every one has quota.
    ///
    /// The peek and the commit are separate steps, so two racing requests
    /// can both pass the peek for the last unit of quota. The loser is then
    /// refused at commit time, possibly after an earlier scope was charged.
    /// Over-counting by one under contention is acceptable; under-counting
    /// isn't possible.
    pub fn check_scopes(&self, scopes: &[(String, RateLimit)]) -> Result<(), RateRejection> {
        let now = Instant::now();
        for (scope, limit) in scopes {
            if let Some(retry_after_secs) = self.peek(scope, *limit, now) {
                debug!(scope = %scope, retry_after_secs, "rate limit exceeded");
                return Err(RateRejection {
                    scope: scope.clone(),
                    retry_after_secs,
                });
            }
        }
        for (scope, limit) in scopes {
            let decision = self.check(scope, *limit);
            if !decision.allowed {
                return Err(RateRejection {
                    scope: scope.clone(),
                    retry_after_secs: decision.retry_after_secs.unwrap_or(1),
                });
            }
        }
        Ok(())
    }

    /// Drop windows whose reset time has passed. They'd be reset on next
    /// use anyway; this just bounds memory for scopes that went quiet.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.windows.retain(|_, w| {
            let keep = w.reset_at > now;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Number of live scope windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// `Some(retry_after_secs)` if `scope` has no quota left.
    fn peek(&self, scope: &str, limit: RateLimit, now: Instant) -> Option<u64> {
        if limit.is_unlimited() {
            return None;
        }
        let window = self.windows.get(scope)?;
        if now >= window.reset_at || window.count < limit.limit {
            return None;
        }
        Some(retry_after_secs(window.reset_at - now))
    }
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(remaining: Duration) -> u64 {
    let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
    (millis.saturating_add(999) / 1_000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_minute(limit: u32) -> RateLimit {
        RateLimit::new(limit, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn allows_up_to_limit_then_refuses() {
        let limiter = RateLimiter::new();
        for expected_remaining in (0..3).rev() {
            let decision = limiter.check("target:printer-1", per_minute(3));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let refused = limiter.check("target:printer-1", per_minute(3));
        assert!(!refused.allowed);
        assert_eq!(refused.retry_after_secs, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_elapsing() {
        let limiter = RateLimiter::new();
        limiter.check("s", per_minute(1));
        tokio::time::advance(Duration::from_millis(59_500)).await;
        let refused = limiter.check("s", per_minute(1));
        assert_eq!(refused.retry_after_secs, Some(1));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check("s", per_minute(1)).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn refusals_do_not_consume_quota() {
        let limiter = RateLimiter::new();
        limiter.check("s", per_minute(1));
        for _ in 0..10 {
            assert!(!limiter.check("s", per_minute(1)).allowed);
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("s", per_minute(1)).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_scope_refusal_charges_nothing() {
        let limiter = RateLimiter::new();
        let group = ("group:store-1".to_string(), per_minute(10));
        let target = ("target:printer-1".to_string(), per_minute(1));

        assert!(limiter.check_scopes(&[group.clone(), target.clone()]).is_ok());
        let rejection = limiter
            .check_scopes(&[group.clone(), target.clone()])
            .unwrap_err();
        assert_eq!(rejection.scope, "target:printer-1");

        // Only the first, successful call charged the group.
        let decision = limiter.check("group:store-1", per_minute(10));
        assert_eq!(decision.remaining, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_means_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..1_000 {
            assert!(limiter.check("s", per_minute(0)).allowed);
        }
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_elapsed_windows() {
        let limiter = RateLimiter::new();
        limiter.check("a", per_minute(5));
        limiter.check("b", RateLimit::new(5, Duration::from_secs(120)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1_001)), 2);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
