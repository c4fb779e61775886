//! # Cluster Bridge
//!
//! Lets several hub instances act as one. A peer is connected to exactly one
//! instance, but a request for it can arrive at any of them. Instances share
//! a pub/sub bus with two kinds of topics:
//!
//! - `<prefix>.cluster`: presence announcements, departures, heartbeats,
//!   broadcasts. Every instance listens.
//! - `<prefix>.inbox.<instance>`: point-to-point traffic (relayed requests,
//!   their responses, delivery failures). Only the named instance listens.
//!
//! ```text
//!   instance A                         bus                      instance B
//!   start(device X) ─ dispatch ────► inbox.B ──────────────► channel of X
//!   resolve(corr) ◄─ inbox.A ◄───── response ◄────────────── X answers
//! ```
//!
//! The correlation id never changes hands: A registered it, B only
//! remembers which instance to send the answer back to.
//!
//! If the bus fails, the bridge marks itself unavailable and the hub keeps
//! serving its own peers. Requests pending on remote peers are failed
//! immediately rather than left to time out. The maintenance loop retries
//! the subscription on every sweep.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connections::ConnectionRecord;
use super::error::{BridgeError, DispatchError};
use super::gateway::{TargetSelector, TransportGateway};
use crate::wire::{EventEnvelope, PeerRole, RequestEnvelope, ResponseEnvelope};

// ---------------------------------------------------------------------------
// Pub/Sub
// ---------------------------------------------------------------------------

/// The bus the bridge runs over. Delivery is at-most-once and unordered
/// across topics; the bridge doesn't need more.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Subscribe to `topic`. The receiver closing means the subscription
    /// is gone.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BridgeError>;
}

/// Process-local bus. Used to run several hub instances in one process and
/// in tests; [`InMemoryPubSub::set_online`] simulates an outage.
pub struct InMemoryPubSub {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
    online: AtomicBool,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl InMemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            online: AtomicBool::new(true),
        }
    }

    /// Going offline drops every topic, which closes every subscription.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.topics.clear();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        if !self.is_online() {
            return Err(BridgeError::Publish {
                topic: topic.to_string(),
                reason: "bus offline".to_string(),
            });
        }
        // No subscribers is not an error on a pub/sub bus.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BridgeError> {
        if !self.is_online() {
            return Err(BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: "bus offline".to_string(),
            });
        }
        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Bridge Frames
// ---------------------------------------------------------------------------

/// A peer connected to some other instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    pub instance_id: String,
    pub channel_id: String,
    pub role: PeerRole,
    pub group_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identity: Option<String>,
}

impl RemotePeer {
    fn from_record(instance_id: &str, record: &ConnectionRecord) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            channel_id: record.channel_id.to_string(),
            role: record.role,
            group_ids: record.group_ids.clone(),
            device_identity: record.device_identity.clone(),
        }
    }
}

/// Messages exchanged between instances. Every frame names the instance
/// that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Presence { origin: String, peer: RemotePeer },
    Departed { origin: String, channel_id: String },
    SyncRequest { origin: String },
    Heartbeat { origin: String },
    Dispatch {
        origin: String,
        channel_id: String,
        envelope: RequestEnvelope,
    },
    Response {
        origin: String,
        envelope: ResponseEnvelope,
    },
    Undeliverable {
        origin: String,
        correlation_id: String,
        channel_id: String,
        reason: String,
    },
    Broadcast { origin: String, event: EventEnvelope },
}

impl BridgeFrame {
    pub fn origin(&self) -> &str {
        match self {
            BridgeFrame::Presence { origin, .. }
            | BridgeFrame::Departed { origin, .. }
            | BridgeFrame::SyncRequest { origin }
            | BridgeFrame::Heartbeat { origin }
            | BridgeFrame::Dispatch { origin, .. }
            | BridgeFrame::Response { origin, .. }
            | BridgeFrame::Undeliverable { origin, .. }
            | BridgeFrame::Broadcast { origin, .. } => origin,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration & Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix for every topic. Instances must agree on it.
    pub topic_prefix: String,
    /// An instance we haven't heard from for this long is presumed dead,
    /// along with all of its peers.
    pub instance_timeout_ms: u64,
    /// How long we remember where to send the answer to a relayed request.
    pub relay_ttl_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "tether".to_string(),
            instance_timeout_ms: 90_000,
            relay_ttl_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub instance_id: String,
    pub available: bool,
    pub remote_instances: usize,
    pub remote_peers: usize,
    pub relays_in_flight: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSweep {
    pub silent_instances: usize,
    pub expired_relays: usize,
}

struct Relay {
    origin: String,
    channel_id: String,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct ClusterBridge {
    instance_id: String,
    config: BridgeConfig,
    pubsub: Arc<dyn PubSub>,
    available: AtomicBool,
    /// Peers on other instances, by channel id.
    remote_peers: DashMap<String, RemotePeer>,
    /// Last time each other instance said anything.
    instances: DashMap<String, Instant>,
    /// Requests relayed to our peers, by correlation id.
    relays: DashMap<String, Relay>,
    gateway: RwLock<Weak<TransportGateway>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterBridge {
    pub fn new(instance_id: impl Into<String>, pubsub: Arc<dyn PubSub>, config: BridgeConfig) -> Self {
        Self {
            instance_id: instance_id.into(),
            config,
            pubsub,
            available: AtomicBool::new(false),
            remote_peers: DashMap::new(),
            instances: DashMap::new(),
            relays: DashMap::new(),
            gateway: RwLock::new(Weak::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn cluster_topic(&self) -> String {
        format!("{}.cluster", self.config.topic_prefix)
    }

    fn inbox_topic(&self, instance_id: &str) -> String {
        format!("{}.inbox.{}", self.config.topic_prefix, instance_id)
    }

    /// Subscribe, start the listener, and introduce ourselves.
    pub async fn start(self: &Arc<Self>, gateway: &Arc<TransportGateway>) -> Result<(), BridgeError> {
        *self.gateway.write() = Arc::downgrade(gateway);

        let cluster_topic = self.cluster_topic();
        let inbox_topic = self.inbox_topic(&self.instance_id);
        let (mut cluster_rx, mut inbox_rx) = match self.subscribe_pair(&cluster_topic, &inbox_topic).await {
            Ok(pair) => pair,
            Err(e) => {
                self.mark_unavailable(&e.to_string());
                return Err(e);
            }
        };

        let bridge = Arc::clone(self);
        let listener = tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    raw = cluster_rx.recv() => raw,
                    raw = inbox_rx.recv() => raw,
                };
                match raw {
                    Some(raw) => bridge.handle_raw(&raw).await,
                    None => break,
                }
            }
            bridge.mark_unavailable("subscription closed");
        });
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }

        self.available.store(true, Ordering::SeqCst);
        info!(instance = %self.instance_id, "cluster bridge online");

        self.publish(
            &cluster_topic,
            &BridgeFrame::SyncRequest {
                origin: self.instance_id.clone(),
            },
        )
        .await?;
        for record in gateway.connections().all() {
            self.announce_peer(&record).await;
        }
        Ok(())
    }

    /// Restart the bridge if it's down. Returns whether it's up afterwards.
    pub async fn ensure_running(self: &Arc<Self>) -> bool {
        if self.is_available() {
            return true;
        }
        let gateway = self.gateway.read().upgrade();
        let Some(gateway) = gateway else {
            return false;
        };
        match self.start(&gateway).await {
            Ok(()) => {
                info!(instance = %self.instance_id, "cluster bridge recovered");
                true
            }
            Err(e) => {
                debug!(instance = %self.instance_id, error = %e, "cluster bridge still down");
                false
            }
        }
    }

    /// Stop listening. The hub carries on alone until the next
    /// [`ClusterBridge::ensure_running`].
    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.mark_unavailable("stopped");
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            instance_id: self.instance_id.clone(),
            available: self.is_available(),
            remote_instances: self.instances.len(),
            remote_peers: self.remote_peers.len(),
            relays_in_flight: self.relays.len(),
        }
    }

    pub fn remote_peer_count(&self) -> usize {
        self.remote_peers.len()
    }

    /// Remote peers matching `target`, ordered by channel id.
    pub fn resolve_remote(&self, target: &TargetSelector) -> Vec<RemotePeer> {
        let mut peers: Vec<RemotePeer> = self
            .remote_peers
            .iter()
            .filter(|p| {
                target.matches(&p.channel_id, p.role, &p.group_ids, p.device_identity.as_deref())
            })
            .map(|p| p.value().clone())
            .collect();
        peers.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        peers
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Forward a request to the instance that owns `peer`.
    pub async fn relay_request(
        &self,
        peer: &RemotePeer,
        envelope: RequestEnvelope,
    ) -> Result<(), BridgeError> {
        if !self.is_available() {
            return Err(BridgeError::Unavailable);
        }
        trace!(
            correlation_id = %envelope.correlation_id,
            instance = %peer.instance_id,
            peer = %peer.channel_id,
            "relaying request"
        );
        self.publish(
            &self.inbox_topic(&peer.instance_id),
            &BridgeFrame::Dispatch {
                origin: self.instance_id.clone(),
                channel_id: peer.channel_id.clone(),
                envelope,
            },
        )
        .await
    }

    /// Send a response back to the instance that relayed its request here.
    /// Returns `false` if we relayed no such request.
    pub async fn relay_response(&self, envelope: ResponseEnvelope) -> bool {
        let Some((_, relay)) = self.relays.remove(&envelope.correlation_id) else {
            return false;
        };
        let topic = self.inbox_topic(&relay.origin);
        let frame = BridgeFrame::Response {
            origin: self.instance_id.clone(),
            envelope,
        };
        self.publish(&topic, &frame).await.is_ok()
    }

    pub async fn announce_peer(&self, record: &ConnectionRecord) {
        if !self.is_available() {
            return;
        }
        let frame = BridgeFrame::Presence {
            origin: self.instance_id.clone(),
            peer: RemotePeer::from_record(&self.instance_id, record),
        };
        let _ = self.publish(&self.cluster_topic(), &frame).await;
    }

    pub async fn announce_departure(&self, channel_id: &str) {
        self.relays.retain(|_, relay| relay.channel_id != channel_id);
        if !self.is_available() {
            return;
        }
        let frame = BridgeFrame::Departed {
            origin: self.instance_id.clone(),
            channel_id: channel_id.to_string(),
        };
        let _ = self.publish(&self.cluster_topic(), &frame).await;
    }

    pub async fn relay_broadcast(&self, event: &EventEnvelope) -> Result<(), BridgeError> {
        if !self.is_available() {
            return Err(BridgeError::Unavailable);
        }
        let frame = BridgeFrame::Broadcast {
            origin: self.instance_id.clone(),
            event: event.clone(),
        };
        self.publish(&self.cluster_topic(), &frame).await
    }

    /// Heartbeat, forget silent instances, expire stale relays.
    pub async fn sweep(&self, gateway: &TransportGateway) -> BridgeSweep {
        if self.is_available() {
            let frame = BridgeFrame::Heartbeat {
                origin: self.instance_id.clone(),
            };
            let _ = self.publish(&self.cluster_topic(), &frame).await;
        }

        let now = Instant::now();
        let timeout = Duration::from_millis(self.config.instance_timeout_ms);
        let silent: Vec<String> = self
            .instances
            .iter()
            .filter(|seen| now.saturating_duration_since(*seen.value()) >= timeout)
            .map(|seen| seen.key().clone())
            .collect();
        for instance in &silent {
            self.instances.remove(instance);
            let rejected = self.forget_instance(gateway, instance, "hub instance went silent");
            warn!(instance = %instance, rejected, "remote hub instance went silent");
        }

        let mut expired_relays = 0;
        self.relays.retain(|_, relay| {
            let keep = relay.expires_at > now;
            if !keep {
                expired_relays += 1;
            }
            keep
        });

        BridgeSweep {
            silent_instances: silent.len(),
            expired_relays,
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn handle_raw(&self, raw: &[u8]) {
        let frame: BridgeFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %BridgeError::Malformed(e.to_string()), "dropping bridge frame");
                return;
            }
        };
        if frame.origin() == self.instance_id {
            return;
        }
        self.instances.insert(frame.origin().to_string(), Instant::now());

        let gateway = self.gateway.read().upgrade();
        let Some(gateway) = gateway else {
            return;
        };
        self.handle_frame(&gateway, frame).await;
    }

    async fn handle_frame(&self, gateway: &TransportGateway, frame: BridgeFrame) {
        match frame {
            BridgeFrame::Presence { origin, mut peer } => {
                peer.instance_id = origin;
                trace!(instance = %peer.instance_id, peer = %peer.channel_id, "remote peer present");
                self.remote_peers.insert(peer.channel_id.clone(), peer);
            }
            BridgeFrame::Departed { origin, channel_id } => {
                if let Some((_, peer)) = self
                    .remote_peers
                    .remove_if(&channel_id, |_, peer| peer.instance_id == origin)
                {
                    gateway.forget_channel_health(&channel_id, peer.device_identity.as_deref());
                }
                gateway
                    .correlations()
                    .reject_target(&channel_id, "target disconnected from its hub instance");
            }
            BridgeFrame::SyncRequest { .. } => {
                for record in gateway.connections().all() {
                    self.announce_peer(&record).await;
                }
            }
            BridgeFrame::Heartbeat { .. } => {}
            BridgeFrame::Dispatch {
                origin,
                channel_id,
                envelope,
            } => {
                let correlation_id = envelope.correlation_id.clone();
                self.relays.insert(
                    correlation_id.clone(),
                    Relay {
                        origin: origin.clone(),
                        channel_id: channel_id.clone(),
                        expires_at: Instant::now() + Duration::from_millis(self.config.relay_ttl_ms),
                    },
                );
                if let Err(e) = gateway.dispatch_local(&channel_id, envelope) {
                    self.relays.remove(&correlation_id);
                    debug!(correlation_id = %correlation_id, peer = %channel_id, error = %e, "relayed request undeliverable");
                    let frame = BridgeFrame::Undeliverable {
                        origin: self.instance_id.clone(),
                        correlation_id,
                        channel_id,
                        reason: e.to_string(),
                    };
                    let _ = self.publish(&self.inbox_topic(&origin), &frame).await;
                }
            }
            BridgeFrame::Response { envelope, .. } => {
                if !gateway.correlations().resolve(envelope) {
                    debug!("relayed response arrived after its request completed");
                }
            }
            BridgeFrame::Undeliverable {
                correlation_id,
                channel_id,
                reason,
                ..
            } => {
                self.remote_peers.remove(&channel_id);
                gateway.correlations().fail(
                    &correlation_id,
                    DispatchError::Unavailable {
                        target: channel_id,
                        reason,
                    },
                );
            }
            BridgeFrame::Broadcast { event, .. } => {
                gateway.deliver_event(&event);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn subscribe_pair(
        &self,
        cluster_topic: &str,
        inbox_topic: &str,
    ) -> Result<(mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>), BridgeError> {
        let cluster = self.pubsub.subscribe(cluster_topic).await?;
        let inbox = self.pubsub.subscribe(inbox_topic).await?;
        Ok((cluster, inbox))
    }

    async fn publish(&self, topic: &str, frame: &BridgeFrame) -> Result<(), BridgeError> {
        let payload = serde_json::to_vec(frame).map_err(|e| BridgeError::Malformed(e.to_string()))?;
        if let Err(e) = self.pubsub.publish(topic, payload).await {
            self.mark_unavailable(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Drop into single-instance mode. Everything we knew about other
    /// instances is forgotten and requests waiting on them are failed now.
    fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(
                instance = %self.instance_id,
                reason,
                "cluster bridge unavailable, serving local peers only"
            );
        }
        let gateway = self.gateway.read().upgrade();
        let peers: Vec<RemotePeer> = self.remote_peers.iter().map(|p| p.value().clone()).collect();
        self.remote_peers.clear();
        self.instances.clear();
        if let Some(gateway) = gateway {
            for peer in peers {
                gateway
                    .correlations()
                    .reject_target(&peer.channel_id, "cluster bridge unavailable");
                gateway.forget_channel_health(&peer.channel_id, peer.device_identity.as_deref());
            }
        }
    }

    fn forget_instance(&self, gateway: &TransportGateway, instance: &str, reason: &str) -> usize {
        let channels: Vec<String> = self
            .remote_peers
            .iter()
            .filter(|p| p.instance_id == instance)
            .map(|p| p.key().clone())
            .collect();
        channels
            .iter()
            .map(|channel| {
                if let Some((_, peer)) = self.remote_peers.remove(channel) {
                    gateway.forget_channel_health(channel, peer.device_identity.as_deref());
                }
                gateway.correlations().reject_target(channel, reason)
            })
            .sum()
    }
}

impl Drop for ClusterBridge {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
