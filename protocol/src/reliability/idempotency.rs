//! # Idempotency Cache
//!
//! Callers that may retry attach an idempotency key. The first request under
//! a key reaches the peer; its *successful* response is cached for a TTL and
//! replayed to every retry that arrives before the entry expires. Failed
//! outcomes are never cached, so a retry after a failure gets a fresh
//! attempt.
//!
//! Two requests carrying the same key that are both in flight at the same
//! time are *not* coalesced; both reach the peer. Coalescing would need a
//! pending-key table and a second waiter path, and hasn't been worth it.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a cached response stays replayable.
    pub ttl_ms: u64,
    /// Upper bound on cached entries. The soonest-to-expire go first.
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_entries: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// An idempotency key. Usually supplied by the caller; can also be derived
/// deterministically from the request's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from (target, operation, caller nonce) with BLAKE3.
    /// Same inputs, same key, across processes and restarts.
    pub fn derive(target: &str, operation_type: &str, nonce: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [target, operation_type, nonce] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        Self(format!("idem-{}", hex::encode(&digest.as_bytes()[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Result of looking a key up.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck<V> {
    /// Never seen, or expired. Go ahead.
    Fresh,
    /// Already answered. Here's the answer.
    Duplicate(V),
}

impl<V> IdempotencyCheck<V> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IdempotencyCheck::Duplicate(_))
    }

    pub fn cached(self) -> Option<V> {
        match self {
            IdempotencyCheck::Duplicate(v) => Some(v),
            IdempotencyCheck::Fresh => None,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL cache of successful responses keyed by idempotency key.
pub struct IdempotencyCache<V> {
    config: IdempotencyConfig,
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Look `key` up. Expired entries are evicted on the spot.
    pub fn check(&self, key: &str) -> IdempotencyCheck<V> {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                return IdempotencyCheck::Fresh;
            };
            if entry.expires_at > now {
                trace!(idempotency_key = key, "idempotency hit");
                return IdempotencyCheck::Duplicate(entry.value.clone());
            }
        }
        // Read guard is gone; the entry may have been refreshed meanwhile.
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        IdempotencyCheck::Fresh
    }

    /// Cache a successful response under `key`. `ttl` overrides the
    /// configured default.
    pub fn cache_response(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(Duration::from_millis(self.config.ttl_ms));
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop a key regardless of expiry.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every expired entry. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.entries.retain(|_, e| {
            let keep = e.expires_at > now;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "idempotency cache swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expired entries first; if still full, shed the soonest-to-expire
    /// until we're at 90% capacity.
    fn make_room(&self) {
        self.sweep();
        if self.entries.len() < self.config.max_entries {
            return;
        }
        let target = self.config.max_entries * 9 / 10;
        let mut by_expiry: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().expires_at))
            .collect();
        by_expiry.sort_by_key(|(_, at)| *at);
        let to_remove = by_expiry.len().saturating_sub(target);
        for (key, _) in by_expiry.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        debug!(shed = to_remove, "idempotency cache at capacity");
    }
}
