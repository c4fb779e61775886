//! Reconnection manager for a peer agent's link to the hub.
//!
//! ```text
//!   DISCONNECTED ──► CONNECTING ──► CONNECTED
//!        ▲                │              │
//!        └── backoff ◄────┴──── drop ◄───┘
//! ```
//!
//! The delay before attempt `n` is `min(max, base * 2^n)` scaled by a random
//! factor in `[min_jitter, 1]`. The attempt counter resets only once a
//! connection has stayed up for the stability window; a link that flaps
//! right after the handshake keeps backing off.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

/// Heartbeat round trips kept for the health score.
const LATENCY_SAMPLES: usize = 20;

/// Mean round trip at or below which latency doesn't hurt the health score.
const HEALTHY_LATENCY_MS: f64 = 100.0;

/// Mean round trip at which latency alone zeroes its half of the score.
const UNHEALTHY_LATENCY_MS: f64 = 5_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Lower bound of the random jitter factor, in `[0, 1]`.
    pub min_jitter: f64,
    /// How long a connection must survive before the attempt counter resets.
    pub stability_window_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Reconnects older than this no longer count against health.
    pub health_window_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            min_jitter: 0.5,
            stability_window_ms: 30_000,
            max_attempts: None,
            health_window_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "DISCONNECTED"),
            LinkState::Connecting => write!(f, "CONNECTING"),
            LinkState::Connected => write!(f, "CONNECTED"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}

/// Backoff delay for the given (zero-based) attempt.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponential = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_delay_ms);
    let floor = config.min_jitter.clamp(0.0, 1.0);
    let jitter = rand::thread_rng().gen_range(floor..=1.0);
    Duration::from_millis((exponential as f64 * jitter) as u64)
}

struct LinkInner {
    state: LinkState,
    attempt: u32,
    connected_at: Option<Instant>,
    sessions: u64,
    reconnects: VecDeque<Instant>,
    latencies: VecDeque<u64>,
}

pub struct ReconnectionManager {
    config: ReconnectConfig,
    inner: Mutex<LinkInner>,
    force: Notify,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                attempt: 0,
                connected_at: None,
                sessions: 0,
                reconnects: VecDeque::new(),
                latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
            force: Notify::new(),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Consecutive failed attempts since the last stable connection.
    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    pub fn mark_connecting(&self) {
        self.inner.lock().state = LinkState::Connecting;
    }

    pub fn mark_connected(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.state = LinkState::Connected;
        inner.connected_at = Some(now);
        if inner.sessions > 0 {
            inner.reconnects.push_back(now);
        }
        inner.sessions += 1;
        inner.latencies.clear();
        info!(session = inner.sessions, attempt = inner.attempt, "link connected");
    }

    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        if let Some(connected_at) = inner.connected_at.take() {
            let stable = Duration::from_millis(self.config.stability_window_ms);
            if connected_at.elapsed() >= stable {
                inner.attempt = 0;
            }
        }
        inner.state = LinkState::Disconnected;
    }

    /// Delay before the next attempt, counting it. Fails once the attempt
    /// budget is spent.
    pub fn next_delay(&self) -> Result<Duration, ReconnectError> {
        let mut inner = self.inner.lock();
        if let Some(max) = self.config.max_attempts {
            if inner.attempt >= max {
                return Err(ReconnectError::Exhausted {
                    attempts: inner.attempt,
                });
            }
        }
        let delay = backoff_delay(&self.config, inner.attempt);
        inner.attempt += 1;
        Ok(delay)
    }

    pub fn record_heartbeat(&self, latency_ms: u64) {
        let mut inner = self.inner.lock();
        if inner.latencies.len() == LATENCY_SAMPLES {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(latency_ms);
    }

    /// 0.0 (dead) to 1.0 (healthy). Half from recent heartbeat latency,
    /// half from how often the link dropped within the health window.
    pub fn health_score(&self) -> f64 {
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Connected {
            return 0.0;
        }

        let window = Duration::from_millis(self.config.health_window_ms);
        let now = Instant::now();
        while inner
            .reconnects
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            inner.reconnects.pop_front();
        }

        let latency = if inner.latencies.is_empty() {
            1.0
        } else {
            let mean = inner.latencies.iter().sum::<u64>() as f64 / inner.latencies.len() as f64;
            let span = UNHEALTHY_LATENCY_MS - HEALTHY_LATENCY_MS;
            1.0 - ((mean - HEALTHY_LATENCY_MS) / span).clamp(0.0, 1.0)
        };
        let stability = 1.0 / (1.0 + inner.reconnects.len() as f64 * 0.25);

        0.5 * latency + 0.5 * stability
    }

    /// Drop the current session, or cut short the backoff wait between
    /// attempts, and reconnect immediately. Only affects a manager already
    /// driven by [`Self::run`].
    pub fn force_reconnect(&self) {
        info!("forced reconnect requested");
        self.inner.lock().attempt = 0;
        self.force.notify_waiters();
    }

    /// Drive `session` forever, reconnecting after every drop.
    ///
    /// `session` connects, calls [`Self::mark_connected`] once the handshake
    /// is done, and returns when the link drops. Returns only when the
    /// attempt budget is spent.
    pub async fn run<F, Fut, E>(&self, mut session: F) -> Result<(), ReconnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        loop {
            self.mark_connecting();
            let forced = tokio::select! {
                outcome = session() => {
                    if let Err(e) = outcome {
                        warn!(error = %e, "link session failed");
                    }
                    false
                }
                _ = self.force.notified() => true,
            };
            self.mark_disconnected();
            if forced {
                continue;
            }

            let delay = self.next_delay()?;
            info!(
                attempt = self.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.force.notified() => {
                    info!("backoff cut short by forced reconnect");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = ReconnectConfig {
            min_jitter: 1.0,
            ..ReconnectConfig::default()
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(&cfg, 10), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(&cfg, 200), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = ReconnectConfig::default();
        for _ in 0..100 {
            let d = backoff_delay(&cfg, 2);
            assert!(d >= Duration::from_millis(2_000) && d <= Duration::from_millis(4_000));
        }
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let manager = ReconnectionManager::new(config());
        for _ in 0..3 {
            assert!(manager.next_delay().is_ok());
        }
        assert_eq!(
            manager.next_delay(),
            Err(ReconnectError::Exhausted { attempts: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stable_connection_resets_attempts() {
        let manager = ReconnectionManager::new(ReconnectConfig::default());
        manager.next_delay().unwrap();
        manager.next_delay().unwrap();

        manager.mark_connected();
        tokio::time::advance(Duration::from_secs(5)).await;
        manager.mark_disconnected();
        assert_eq!(manager.attempt(), 2, "short-lived link keeps backing off");

        manager.mark_connected();
        tokio::time::advance(Duration::from_secs(31)).await;
        manager.mark_disconnected();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn health_reflects_latency_and_flapping() {
        let manager = ReconnectionManager::new(ReconnectConfig::default());
        assert_eq!(manager.health_score(), 0.0);

        manager.mark_connected();
        assert_eq!(manager.health_score(), 1.0);

        manager.record_heartbeat(5_000);
        assert!((manager.health_score() - 0.5).abs() < 1e-9);

        for _ in 0..4 {
            manager.mark_disconnected();
            manager.mark_connected();
        }
        // Four reconnects: stability half is 1 / (1 + 1) = 0.5.
        assert!((manager.health_score() - 0.75).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(manager.health_score(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_budget() {
        let manager = ReconnectionManager::new(config());
        let calls = AtomicU32::new(0);
        let result = manager
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("connection refused") }
            })
            .await;
        assert_eq!(result, Err(ReconnectError::Exhausted { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_restarts_session_without_backoff() {
        let manager = Arc::new(ReconnectionManager::new(config()));
        let sessions = Arc::new(AtomicU32::new(0));

        let runner = {
            let manager = Arc::clone(&manager);
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                let m = Arc::clone(&manager);
                manager
                    .run(move || {
                        let m = Arc::clone(&m);
                        let sessions = Arc::clone(&sessions);
                        async move {
                            sessions.fetch_add(1, Ordering::SeqCst);
                            m.mark_connected();
                            std::future::pending::<Result<(), String>>().await
                        }
                    })
                    .await
            })
        };

        while sessions.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        manager.force_reconnect();
        while sessions.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.state(), LinkState::Connected);
        runner.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_cuts_backoff_short() {
        let manager = Arc::new(ReconnectionManager::new(ReconnectConfig {
            base_delay_ms: 30_000,
            min_jitter: 1.0,
            ..ReconnectConfig::default()
        }));
        let sessions = Arc::new(AtomicU32::new(0));

        let runner = {
            let manager = Arc::clone(&manager);
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                manager
                    .run(move || {
                        sessions.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>("connection refused") }
                    })
                    .await
            })
        };

        // First session fails at once; the runner is now in a 30 s backoff.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(sessions.load(Ordering::SeqCst), 1);

        manager.force_reconnect();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            sessions.load(Ordering::SeqCst),
            2,
            "forced reconnect must not wait out the backoff"
        );
        runner.abort();
    }
}
