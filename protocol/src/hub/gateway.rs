//! # Transport Gateway
//!
//! The hub's front door. Composes every registry and reliability primitive
//! into one `request_response` call, and handles everything that arrives
//! from peers.
//!
//! A dispatch goes through these steps, in this order:
//!
//! 1. **Idempotency**: A cached success under the same key is replayed
//!    without touching the peer.
//! 2. **Rate limit**: One coarse scope per group the target belongs to,
//!    then the target's own scope. The route is looked up first (a pure
//!    read) so both are known, but the quota is charged even when no
//!    target turns out to be reachable.
//! 3. **Resolve**: Local channels first, then remote ones via the cluster
//!    bridge. Among candidates the lowest heartbeat latency with a usable
//!    circuit wins.
//! 4. **Circuit**: Take a permit for the chosen target.
//! 5. **Register**: The continuation and the permit go into the
//!    correlation registry with an adaptive timeout, *before* anything is
//!    sent.
//! 6. **Send**: Local queue or bridge relay. If that fails the
//!    registration is withdrawn and the caller gets `Unavailable`.
//! 7. **Await**: Whatever completes the request settles the permit.
//!    Successes are cached under the idempotency key.
//!
//! Circuits and latency histories are keyed by device identity, which
//! survives reconnects, so a flapping device can't shed its breaker by
//! dropping the link. Channels without a device identity are keyed by
//! channel id, and that state is forgotten when the channel closes.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bridge::{ClusterBridge, RemotePeer};
use super::connections::{ChannelId, ConnectionRecord, ConnectionRegistry};
use super::correlation::{new_correlation_id, CorrelationRegistry, PendingResponse};
use super::error::{ConnectionError, DispatchError};
use super::monitoring::MonitoringSnapshot;
use crate::config::HubConfig;
use crate::reliability::{
    CircuitBreaker, IdempotencyCache, IdempotencyCheck, LatencyEstimator, RateLimiter,
};
use crate::wire::{
    EventEnvelope, HandshakeAck, HubFrame, PeerFrame, PeerHandshake, PeerRole, Ping,
    RequestEnvelope, ResponseEnvelope, WireError,
};

// ---------------------------------------------------------------------------
// Requests & Outcomes
// ---------------------------------------------------------------------------

/// Which peer(s) a request may go to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Exactly this channel.
    #[serde(rename_all = "camelCase")]
    Channel { channel_id: String },
    /// Whichever channel the device is currently connected on.
    #[serde(rename_all = "camelCase")]
    Device { device_identity: String },
    /// Any member of a group with the given role.
    #[serde(rename_all = "camelCase")]
    Group {
        group_id: String,
        #[serde(default = "default_group_role")]
        role: PeerRole,
    },
}

fn default_group_role() -> PeerRole {
    PeerRole::PeerAgent
}

impl TargetSelector {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        TargetSelector::Channel {
            channel_id: channel_id.into(),
        }
    }

    pub fn device(device_identity: impl Into<String>) -> Self {
        TargetSelector::Device {
            device_identity: device_identity.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        TargetSelector::Group {
            group_id: group_id.into(),
            role: PeerRole::PeerAgent,
        }
    }

    /// The group this selector is scoped to.
    pub fn group_scope(&self) -> Option<&str> {
        match self {
            TargetSelector::Group { group_id, .. } => Some(group_id),
            _ => None,
        }
    }

    /// The single target this selector names, if it names one.
    pub fn target_key(&self) -> Option<&str> {
        match self {
            TargetSelector::Channel { channel_id } => Some(channel_id),
            TargetSelector::Device { device_identity } => Some(device_identity),
            TargetSelector::Group { .. } => None,
        }
    }

    /// Does a channel with these attributes satisfy the selector?
    pub fn matches(
        &self,
        channel_id: &str,
        role: PeerRole,
        group_ids: &BTreeSet<String>,
        device_identity: Option<&str>,
    ) -> bool {
        match self {
            TargetSelector::Channel { channel_id: wanted } => wanted == channel_id,
            TargetSelector::Device {
                device_identity: wanted,
            } => device_identity == Some(wanted.as_str()),
            TargetSelector::Group {
                group_id,
                role: wanted,
            } => *wanted == role && group_ids.contains(group_id),
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Channel { channel_id } => write!(f, "channel:{channel_id}"),
            TargetSelector::Device { device_identity } => write!(f, "device:{device_identity}"),
            TargetSelector::Group { group_id, role } => write!(f, "group:{group_id}/{role}"),
        }
    }
}

/// A request as callers describe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub target: TargetSelector,
    pub operation_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl DispatchRequest {
    pub fn new(target: TargetSelector, operation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            target,
            operation_type: operation_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub correlation_id: String,
    pub payload: Value,
    /// Channel that produced the response.
    pub served_by: String,
    /// Hub instance that owns that channel.
    pub instance_id: String,
    pub elapsed_ms: u64,
    /// `true` when served from the idempotency cache.
    pub replayed: bool,
}

/// What a maintenance sweep cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idempotency_evicted: usize,
    pub rate_windows_evicted: usize,
    pub stale_requests: usize,
    pub degraded_channels: usize,
    pub silent_instances: usize,
    pub expired_relays: usize,
}

enum Route {
    Local(ConnectionRecord),
    Remote(RemotePeer),
}

impl Route {
    fn channel_id(&self) -> &str {
        match self {
            Route::Local(record) => record.channel_id.as_str(),
            Route::Remote(peer) => &peer.channel_id,
        }
    }

    fn health_key(&self) -> &str {
        match self {
            Route::Local(record) => {
                health_key(record.channel_id.as_str(), record.device_identity.as_deref())
            }
            Route::Remote(peer) => health_key(&peer.channel_id, peer.device_identity.as_deref()),
        }
    }

    fn group_ids(&self) -> &BTreeSet<String> {
        match self {
            Route::Local(record) => &record.group_ids,
            Route::Remote(peer) => &peer.group_ids,
        }
    }
}

/// Key for a peer's circuit and latency history.
fn health_key<'a>(channel_id: &'a str, device_identity: Option<&'a str>) -> &'a str {
    device_identity.unwrap_or(channel_id)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct TransportGateway {
    config: HubConfig,
    latency: Arc<LatencyEstimator>,
    breaker: Arc<CircuitBreaker>,
    idempotency: Arc<IdempotencyCache<DispatchOutcome>>,
    rate_limiter: RateLimiter,
    correlations: CorrelationRegistry,
    connections: ConnectionRegistry,
    bridge: RwLock<Option<Arc<ClusterBridge>>>,
    ping_nonce: AtomicU64,
}

impl TransportGateway {
    pub fn new(config: HubConfig) -> Self {
        let latency = Arc::new(LatencyEstimator::new(config.latency.clone()));
        Self {
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            idempotency: Arc::new(IdempotencyCache::new(config.idempotency.clone())),
            rate_limiter: RateLimiter::new(),
            correlations: CorrelationRegistry::new(config.correlation.clone(), Arc::clone(&latency)),
            connections: ConnectionRegistry::new(config.connections.clone()),
            latency,
            bridge: RwLock::new(None),
            ping_nonce: AtomicU64::new(1),
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.correlations
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn latency(&self) -> &Arc<LatencyEstimator> {
        &self.latency
    }

    pub fn idempotency_entries(&self) -> usize {
        self.idempotency.len()
    }

    pub fn rate_limit_windows(&self) -> usize {
        self.rate_limiter.len()
    }

    /// Drop a cached response so the next request under `key` reaches the
    /// peer again.
    pub fn forget_idempotency_key(&self, key: &str) -> bool {
        let removed = self.idempotency.invalidate(key);
        if removed {
            info!(idempotency_key = key, "cached response forgotten");
        }
        removed
    }

    pub fn attach_bridge(&self, bridge: Arc<ClusterBridge>) {
        *self.bridge.write() = Some(bridge);
    }

    pub fn bridge(&self) -> Option<Arc<ClusterBridge>> {
        self.bridge.read().clone()
    }

    /// The bridge, if attached and currently healthy.
    fn live_bridge(&self) -> Option<Arc<ClusterBridge>> {
        self.bridge().filter(|b| b.is_available())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send a request and wait for its outcome.
    pub async fn request_response(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.start(request).await?.outcome().await
    }

    /// Send a request and return a handle to its outcome. Dropping the
    /// handle before the outcome arrives cancels the request.
    pub async fn start(&self, request: DispatchRequest) -> Result<DispatchHandle, DispatchError> {
        let started = Instant::now();

        if let Some(key) = request.idempotency_key.as_deref() {
            if let IdempotencyCheck::Duplicate(mut cached) = self.idempotency.check(key) {
                debug!(
                    idempotency_key = key,
                    correlation_id = %cached.correlation_id,
                    "replaying cached response"
                );
                cached.replayed = true;
                cached.elapsed_ms = millis_since(started);
                return Ok(DispatchHandle {
                    state: HandleState::Replayed(cached),
                });
            }
        }

        let route = self.resolve_route(&request.target);
        self.check_rate_limits(&request.target, route.as_ref().ok())?;
        let route = route?;
        let channel_id = route.channel_id().to_string();
        let health_key = route.health_key().to_string();
        let instance_id = match &route {
            Route::Local(_) => self.config.instance_id.clone(),
            Route::Remote(peer) => peer.instance_id.clone(),
        };

        let permit = self.breaker.try_acquire(&health_key).map_err(|open| {
            debug!(peer = %channel_id, circuit = %health_key, "circuit open, failing fast");
            DispatchError::CircuitOpen {
                target: open.target,
                retry_after_ms: u64::try_from(open.retry_after.as_millis()).unwrap_or(u64::MAX),
            }
        })?;

        let correlation_id = new_correlation_id();
        let timeout = self.latency.timeout_for(&health_key, &request.operation_type);
        let pending = self
            .correlations
            .register_guarded(
                &correlation_id,
                &request.operation_type,
                &channel_id,
                &health_key,
                timeout,
                permit,
            )
            .map_err(|e| DispatchError::Unavailable {
                target: channel_id.clone(),
                reason: e.to_string(),
            })?;

        let envelope = RequestEnvelope::new(
            correlation_id.clone(),
            request.operation_type.clone(),
            request.payload,
            request.idempotency_key.clone(),
        );
        if let Err(reason) = self.send_request(&route, envelope).await {
            self.correlations.discard(&correlation_id);
            warn!(correlation_id = %correlation_id, peer = %channel_id, reason = %reason, "request could not be sent");
            return Err(DispatchError::Unavailable {
                target: channel_id,
                reason,
            });
        }

        debug!(
            correlation_id = %correlation_id,
            peer = %channel_id,
            instance = %instance_id,
            operation = %request.operation_type,
            timeout_ms = timeout.as_millis() as u64,
            "request dispatched"
        );
        Ok(DispatchHandle {
            state: HandleState::InFlight(InFlight {
                correlation_id,
                pending,
                correlations: self.correlations.clone(),
                idempotency: Arc::clone(&self.idempotency),
                idempotency_key: request.idempotency_key,
                served_by: channel_id,
                instance_id,
                started,
                settled: false,
            }),
        })
    }

    /// Cancel an in-flight request by id.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.correlations.cancel(correlation_id)
    }

    /// Charge every group of the resolved target and the target itself.
    /// With no route, fall back to what the selector names so requests to
    /// an absent target still spend quota.
    fn check_rate_limits(
        &self,
        target: &TargetSelector,
        route: Option<&Route>,
    ) -> Result<(), DispatchError> {
        let limits = &self.config.rate_limit;
        let mut scopes = Vec::new();
        match route {
            Some(route) => {
                for group in route.group_ids() {
                    scopes.push((format!("group:{group}"), limits.group()));
                }
                scopes.push((format!("target:{}", route.health_key()), limits.target()));
            }
            None => {
                if let Some(group) = target.group_scope() {
                    scopes.push((format!("group:{group}"), limits.group()));
                }
                if let Some(key) = target.target_key() {
                    scopes.push((format!("target:{key}"), limits.target()));
                }
            }
        }

        self.rate_limiter.check_scopes(&scopes).map_err(|rejection| {
            warn!(
                scope = %rejection.scope,
                retry_after_secs = rejection.retry_after_secs,
                "dispatch rate limited"
            );
            DispatchError::RateLimited {
                scope: rejection.scope,
                retry_after_secs: rejection.retry_after_secs,
            }
        })
    }

    fn resolve_route(&self, target: &TargetSelector) -> Result<Route, DispatchError> {
        let local: Vec<ConnectionRecord> = match target {
            TargetSelector::Channel { channel_id } => {
                self.connections.get(channel_id).into_iter().collect()
            }
            _ => self.connections.all().into_iter().filter(|r| {
                target.matches(
                    r.channel_id.as_str(),
                    r.role,
                    &r.group_ids,
                    r.device_identity.as_deref(),
                )
            }).collect(),
        };
        if let Some(record) = self.pick_local(local) {
            return Ok(Route::Local(record));
        }

        if let Some(bridge) = self.live_bridge() {
            let remote = bridge.resolve_remote(target);
            let first = remote.first().cloned();
            if let Some(peer) = remote
                .into_iter()
                .find(|p| {
                    !self
                        .breaker
                        .is_open(health_key(&p.channel_id, p.device_identity.as_deref()))
                })
                .or(first)
            {
                return Ok(Route::Remote(peer));
            }
        }

        Err(DispatchError::Unavailable {
            target: target.to_string(),
            reason: "no live connection".to_string(),
        })
    }

    /// Lowest mean heartbeat latency with a usable circuit. If every
    /// circuit is open, hand back the best candidate anyway so the caller
    /// gets a `CircuitOpen` rather than a misleading `Unavailable`.
    fn pick_local(&self, mut candidates: Vec<ConnectionRecord>) -> Option<ConnectionRecord> {
        candidates.sort_by(|a, b| {
            let la = a.mean_latency_ms().unwrap_or(f64::INFINITY);
            let lb = b.mean_latency_ms().unwrap_or(f64::INFINITY);
            la.total_cmp(&lb).then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        let first = candidates.first().cloned();
        candidates
            .into_iter()
            .find(|c| {
                !self
                    .breaker
                    .is_open(health_key(c.channel_id.as_str(), c.device_identity.as_deref()))
            })
            .or(first)
    }

    async fn send_request(&self, route: &Route, envelope: RequestEnvelope) -> Result<(), String> {
        match route {
            Route::Local(record) => self
                .connections
                .send(record.channel_id.as_str(), HubFrame::Request(envelope))
                .map_err(|e| e.to_string()),
            Route::Remote(peer) => match self.live_bridge() {
                Some(bridge) => bridge
                    .relay_request(peer, envelope)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("cluster bridge unavailable".to_string()),
            },
        }
    }

    /// Queue a request that another instance routed to one of our channels.
    pub fn dispatch_local(
        &self,
        channel_id: &str,
        envelope: RequestEnvelope,
    ) -> Result<(), ConnectionError> {
        self.connections.send(channel_id, HubFrame::Request(envelope))
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Fan an event out to every member of `group_id`, on this instance and
    /// (if bridged) every other. Returns local deliveries.
    pub async fn broadcast(&self, group_id: &str, event: &str, payload: Value) -> usize {
        let envelope = EventEnvelope::new(group_id, event, payload);
        let delivered = self.deliver_event(&envelope);
        if let Some(bridge) = self.live_bridge() {
            if let Err(e) = bridge.relay_broadcast(&envelope).await {
                warn!(group = group_id, error = %e, "broadcast not relayed to cluster");
            }
        }
        debug!(group = group_id, event, delivered, "event broadcast");
        delivered
    }

    /// Local-only delivery.
    pub fn deliver_event(&self, envelope: &EventEnvelope) -> usize {
        self.connections
            .list_by_group(&envelope.group_id)
            .iter()
            .filter(|record| {
                self.connections
                    .send(record.channel_id.as_str(), HubFrame::Event(envelope.clone()))
                    .is_ok()
            })
            .count()
    }

    // -----------------------------------------------------------------------
    // Channel Lifecycle
    // -----------------------------------------------------------------------

    /// Admit a channel after its `hello`. Sends `welcome` on success.
    pub async fn connect(
        &self,
        handshake: &PeerHandshake,
        outbound: mpsc::UnboundedSender<HubFrame>,
    ) -> Result<HandshakeAck, WireError> {
        let protocol_version = handshake.negotiate()?;
        let mut accepted = handshake.clone();
        accepted.protocol_version = protocol_version;

        let channel_id = ChannelId::generate();
        let record = self
            .connections
            .on_connect(channel_id.clone(), &accepted, outbound)
            .map_err(|e| WireError::HandshakeRejected(e.to_string()))?;

        let ack = HandshakeAck {
            channel_id: channel_id.to_string(),
            protocol_version,
            heartbeat_interval_ms: self.config.connections.heartbeat_interval_ms,
            joined_groups: record.group_ids.iter().cloned().collect(),
        };
        if let Err(e) = self
            .connections
            .send(channel_id.as_str(), HubFrame::Welcome(ack.clone()))
        {
            self.connections.on_disconnect(channel_id.as_str());
            return Err(WireError::HandshakeRejected(e.to_string()));
        }

        if let Some(bridge) = self.live_bridge() {
            bridge.announce_peer(&record).await;
        }
        Ok(ack)
    }

    /// Tear a channel down and fail everything pending on it. Returns the
    /// number of requests failed.
    pub async fn disconnect(&self, channel_id: &str) -> usize {
        let record = self.connections.on_disconnect(channel_id);
        let rejected = self
            .correlations
            .reject_target(channel_id, "target disconnected");
        if let Some(record) = record {
            self.forget_channel_health(channel_id, record.device_identity.as_deref());
            if let Some(bridge) = self.live_bridge() {
                bridge.announce_departure(channel_id).await;
            }
        }
        rejected
    }

    /// A channel keyed by its own id never comes back, so its circuit and
    /// latency history go with it. Device-keyed state is kept for the
    /// device's next connection.
    pub(crate) fn forget_channel_health(&self, channel_id: &str, device_identity: Option<&str>) {
        if device_identity.is_some() {
            return;
        }
        self.breaker.reset(channel_id);
        let pairs = self.latency.forget_target(channel_id);
        debug!(channel_id, latency_pairs = pairs, "channel health state dropped");
    }

    /// Handle one frame from an established channel.
    pub async fn handle_peer_frame(&self, channel_id: &str, frame: PeerFrame) {
        match frame {
            PeerFrame::Hello(_) => {
                warn!(channel_id, "unexpected hello on established channel");
            }
            PeerFrame::Response(envelope) => {
                self.handle_response(channel_id, envelope).await;
            }
            PeerFrame::Pong(pong) => {
                let rtt = pong.round_trip_ms(crate::wire::unix_millis());
                self.connections.record_heartbeat(channel_id, rtt);
            }
            PeerFrame::JoinGroup { group_id } => {
                if self.connections.join_group(channel_id, &group_id) {
                    self.reannounce(channel_id).await;
                }
            }
            PeerFrame::LeaveGroup { group_id } => {
                if self.connections.leave_group(channel_id, &group_id) {
                    self.reannounce(channel_id).await;
                }
            }
        }
    }

    /// Route a response to whoever is waiting for it: a local caller, or
    /// another instance that relayed the request here.
    pub async fn handle_response(&self, channel_id: &str, envelope: ResponseEnvelope) -> bool {
        let correlation_id = envelope.correlation_id.clone();
        let bridge = self.live_bridge();
        let relay_copy = bridge.as_ref().map(|_| envelope.clone());

        if self.correlations.resolve(envelope) {
            return true;
        }
        if let (Some(bridge), Some(envelope)) = (bridge, relay_copy) {
            if bridge.relay_response(envelope).await {
                return true;
            }
        }
        warn!(channel_id, correlation_id = %correlation_id, "response without a pending request");
        false
    }

    async fn reannounce(&self, channel_id: &str) {
        if let (Some(bridge), Some(record)) = (self.live_bridge(), self.connections.get(channel_id)) {
            bridge.announce_peer(&record).await;
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Ping every channel. Returns how many pings were queued.
    pub fn heartbeat_all(&self) -> usize {
        self.connections
            .all()
            .iter()
            .filter(|record| {
                let nonce = self.ping_nonce.fetch_add(1, Ordering::Relaxed);
                self.connections
                    .send(record.channel_id.as_str(), HubFrame::Ping(Ping::new(nonce)))
                    .is_ok()
            })
            .count()
    }

    /// One maintenance pass over every expiring structure.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            idempotency_evicted: self.idempotency.sweep(),
            rate_windows_evicted: self.rate_limiter.sweep(),
            stale_requests: self.correlations.sweep_expired(),
            degraded_channels: self.connections.degraded(Utc::now()).len(),
            ..SweepReport::default()
        };
        if let Some(bridge) = self.bridge() {
            let bridge_report = bridge.sweep(self).await;
            report.silent_instances = bridge_report.silent_instances;
            report.expired_relays = bridge_report.expired_relays;
        }
        if report != SweepReport::default() {
            info!(
                idempotency_evicted = report.idempotency_evicted,
                rate_windows_evicted = report.rate_windows_evicted,
                stale_requests = report.stale_requests,
                degraded_channels = report.degraded_channels,
                silent_instances = report.silent_instances,
                expired_relays = report.expired_relays,
                "maintenance sweep"
            );
        }
        report
    }

    pub fn monitoring_snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot::capture(self)
    }
}

fn millis_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Dispatch Handle
// ---------------------------------------------------------------------------

/// An in-flight (or replayed) dispatch.
#[must_use = "dropping a dispatch handle cancels the request"]
pub struct DispatchHandle {
    state: HandleState,
}

enum HandleState {
    Replayed(DispatchOutcome),
    InFlight(InFlight),
}

struct InFlight {
    correlation_id: String,
    pending: PendingResponse,
    correlations: CorrelationRegistry,
    idempotency: Arc<IdempotencyCache<DispatchOutcome>>,
    idempotency_key: Option<String>,
    served_by: String,
    instance_id: String,
    started: Instant,
    settled: bool,
}

impl DispatchHandle {
    /// `None` for replays, which never got a correlation id of their own.
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.state {
            HandleState::Replayed(_) => None,
            HandleState::InFlight(flight) => Some(&flight.correlation_id),
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.state, HandleState::Replayed(_))
    }

    /// Cancel the request. The awaiting side sees
    /// [`DispatchError::Cancelled`] unless an outcome already landed.
    pub fn cancel(&self) -> bool {
        match &self.state {
            HandleState::Replayed(_) => false,
            HandleState::InFlight(flight) => flight.correlations.cancel(&flight.correlation_id),
        }
    }

    pub async fn outcome(self) -> Result<DispatchOutcome, DispatchError> {
        match self.state {
            HandleState::Replayed(outcome) => Ok(outcome),
            HandleState::InFlight(mut flight) => flight.finish().await,
        }
    }
}

impl InFlight {
    async fn finish(&mut self) -> Result<DispatchOutcome, DispatchError> {
        let result = self.pending.wait().await;
        self.settled = true;
        let envelope = result?;
        let outcome = DispatchOutcome {
            correlation_id: self.correlation_id.clone(),
            payload: envelope.payload.unwrap_or(Value::Null),
            served_by: self.served_by.clone(),
            instance_id: self.instance_id.clone(),
            elapsed_ms: millis_since(self.started),
            replayed: false,
        };
        if let Some(key) = &self.idempotency_key {
            self.idempotency.cache_response(key, outcome.clone(), None);
        }
        Ok(outcome)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled && self.correlations.cancel(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "dispatch handle dropped, request cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn groups(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selector_matching() {
        let store = groups(&["store-1"]);
        let by_group = TargetSelector::group("store-1");
        assert!(by_group.matches("ch-1", PeerRole::PeerAgent, &store, Some("p1")));
        assert!(!by_group.matches("ch-1", PeerRole::OperatorClient, &store, None));
        assert!(!by_group.matches("ch-1", PeerRole::PeerAgent, &groups(&["store-2"]), None));

        let by_device = TargetSelector::device("p1");
        assert!(by_device.matches("ch-9", PeerRole::PeerAgent, &store, Some("p1")));
        assert!(!by_device.matches("ch-9", PeerRole::PeerAgent, &store, None));

        assert!(TargetSelector::channel("ch-1").matches("ch-1", PeerRole::OperatorClient, &store, None));
    }

    #[test]
    fn selector_wire_format() {
        let raw = json!({"kind": "group", "groupId": "store-4"});
        let selector: TargetSelector = serde_json::from_value(raw).unwrap();
        assert_eq!(selector, TargetSelector::group("store-4"));
        assert_eq!(selector.to_string(), "group:store-4/peer_agent");
        assert_eq!(selector.group_scope(), Some("store-4"));
        assert_eq!(selector.target_key(), None);
        assert_eq!(TargetSelector::device("p1").target_key(), Some("p1"));
    }

    #[test]
    fn health_key_prefers_device_identity() {
        assert_eq!(health_key("ch-1", Some("printer-1")), "printer-1");
        assert_eq!(health_key("ch-1", None), "ch-1");
    }

    #[test]
    fn dispatch_request_wire_format() {
        let raw = json!({
            "target": {"kind": "device", "deviceIdentity": "printer-2"},
            "operationType": "print",
            "idempotencyKey": "order-1"
        });
        let request: DispatchRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.target, TargetSelector::device("printer-2"));
        assert_eq!(request.payload, Value::Null);
        assert_eq!(request.idempotency_key.as_deref(), Some("order-1"));
    }

    #[tokio::test]
    async fn no_target_is_unavailable() {
        let gateway = TransportGateway::new(HubConfig::with_instance_id("hub-test"));
        let err = gateway
            .request_response(DispatchRequest::new(TargetSelector::device("ghost"), "print", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable { .. }));
        assert!(gateway.correlations().is_empty());
    }
}
