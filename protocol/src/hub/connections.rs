//! # Connection Registry
//!
//! Who is connected right now, in what role, in which groups, and how
//! healthy their link looks. Each live channel also owns the sending half
//! of its outbound queue; the socket task on the other end drains it.
//!
//! Channel ids are generated per connection and never reused. A device that
//! reconnects gets a new channel id; its stable identity is the
//! `device_identity` from the handshake, and we count how many times we've
//! seen it come back.

use std::borrow::Borrow;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::error::ConnectionError;
use crate::config::{DEGRADED_AFTER_MS, HEARTBEAT_INTERVAL_MS};
use crate::wire::{HubFrame, PeerHandshake, PeerRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How often every channel is pinged.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a channel counts as degraded.
    pub degraded_after_ms: u64,
    /// Round-trip samples kept per channel.
    pub latency_history: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            degraded_after_ms: DEGRADED_AFTER_MS,
            latency_history: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Channel Ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        Self(format!("ch-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for ChannelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Everything we know about one live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub channel_id: ChannelId,
    pub role: PeerRole,
    pub group_ids: BTreeSet<String>,
    pub device_identity: Option<String>,
    pub protocol_version: u16,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Times this device identity connected before this channel.
    pub reconnect_count: u32,
    /// Recent heartbeat round-trips, oldest first.
    pub latency_history: VecDeque<u64>,
}

impl ConnectionRecord {
    pub fn in_group(&self, group_id: &str) -> bool {
        self.group_ids.contains(group_id)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.latency_history.is_empty() {
            return None;
        }
        let total: u64 = self.latency_history.iter().sum();
        Some(total as f64 / self.latency_history.len() as f64)
    }

    /// No heartbeat for at least `threshold_ms` as of `now`.
    pub fn is_degraded(&self, now: DateTime<Utc>, threshold_ms: u64) -> bool {
        let silent_for = now.signed_duration_since(self.last_heartbeat_at);
        silent_for.num_milliseconds() >= threshold_ms as i64
    }
}

struct ChannelSlot {
    record: ConnectionRecord,
    outbound: mpsc::UnboundedSender<HubFrame>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ConnectionRegistry {
    config: ConnectionConfig,
    channels: DashMap<ChannelId, ChannelSlot>,
    /// Connection count per device identity, for reconnect accounting.
    seen_devices: DashMap<String, u32>,
}

impl ConnectionRegistry {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            seen_devices: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Register a freshly handshaken channel.
    pub fn on_connect(
        &self,
        channel_id: ChannelId,
        handshake: &PeerHandshake,
        outbound: mpsc::UnboundedSender<HubFrame>,
    ) -> Result<ConnectionRecord, ConnectionError> {
        let now = Utc::now();
        let slot = match self.channels.entry(channel_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ConnectionError::DuplicateChannel(channel_id.to_string()));
            }
            Entry::Vacant(slot) => slot,
        };

        let reconnect_count = match &handshake.device_identity {
            Some(identity) => {
                let mut seen = self.seen_devices.entry(identity.clone()).or_insert(0);
                let previous = *seen;
                *seen += 1;
                previous
            }
            None => 0,
        };

        let record = ConnectionRecord {
            channel_id: channel_id.clone(),
            role: handshake.role,
            group_ids: handshake.group_ids.iter().cloned().collect(),
            device_identity: handshake.device_identity.clone(),
            protocol_version: handshake.protocol_version,
            connected_at: now,
            last_heartbeat_at: now,
            reconnect_count,
            latency_history: VecDeque::new(),
        };
        slot.insert(ChannelSlot {
            record: record.clone(),
            outbound,
        });

        info!(
            channel_id = %channel_id,
            role = %record.role,
            device = record.device_identity.as_deref().unwrap_or("-"),
            groups = record.group_ids.len(),
            reconnects = reconnect_count,
            "peer connected"
        );
        Ok(record)
    }

    /// Remove a channel. Returns its last record, or `None` if it was
    /// already gone.
    pub fn on_disconnect(&self, channel_id: &str) -> Option<ConnectionRecord> {
        let (_, slot) = self.channels.remove(channel_id)?;
        info!(
            channel_id,
            role = %slot.record.role,
            device = slot.record.device_identity.as_deref().unwrap_or("-"),
            "peer disconnected"
        );
        Some(slot.record)
    }

    pub fn get(&self, channel_id: &str) -> Option<ConnectionRecord> {
        self.channels.get(channel_id).map(|slot| slot.record.clone())
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    pub fn all(&self) -> Vec<ConnectionRecord> {
        self.collect(|_| true)
    }

    pub fn list_by_role(&self, role: PeerRole) -> Vec<ConnectionRecord> {
        self.collect(|r| r.role == role)
    }

    pub fn list_by_group(&self, group_id: &str) -> Vec<ConnectionRecord> {
        self.collect(|r| r.in_group(group_id))
    }

    /// Live channels for a device identity. Normally zero or one; briefly
    /// two while a reconnect overlaps the old socket's teardown.
    pub fn find_by_device(&self, device_identity: &str) -> Vec<ConnectionRecord> {
        self.collect(|r| r.device_identity.as_deref() == Some(device_identity))
    }

    /// Channels that have been silent past the degraded threshold.
    pub fn degraded(&self, now: DateTime<Utc>) -> Vec<ConnectionRecord> {
        let threshold = self.config.degraded_after_ms;
        self.collect(|r| r.is_degraded(now, threshold))
    }

    /// Note a heartbeat answer with its round-trip time.
    pub fn record_heartbeat(&self, channel_id: &str, latency_ms: u64) -> bool {
        let Some(mut slot) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let record = &mut slot.record;
        record.last_heartbeat_at = Utc::now();
        while record.latency_history.len() >= self.config.latency_history.max(1) {
            record.latency_history.pop_front();
        }
        record.latency_history.push_back(latency_ms);
        true
    }

    pub fn join_group(&self, channel_id: &str, group_id: &str) -> bool {
        let Some(mut slot) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let added = slot.record.group_ids.insert(group_id.to_string());
        if added {
            debug!(channel_id, group = group_id, "joined group");
        }
        added
    }

    pub fn leave_group(&self, channel_id: &str, group_id: &str) -> bool {
        let Some(mut slot) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let removed = slot.record.group_ids.remove(group_id);
        if removed {
            debug!(channel_id, group = group_id, "left group");
        }
        removed
    }

    /// Queue a frame for a channel.
    pub fn send(&self, channel_id: &str, frame: HubFrame) -> Result<(), ConnectionError> {
        let slot = self
            .channels
            .get(channel_id)
            .ok_or_else(|| ConnectionError::UnknownChannel(channel_id.to_string()))?;
        slot.outbound
            .send(frame)
            .map_err(|_| ConnectionError::ChannelClosed(channel_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn count_by_role(&self, role: PeerRole) -> usize {
        self.channels.iter().filter(|s| s.record.role == role).count()
    }

    fn collect(&self, pred: impl Fn(&ConnectionRecord) -> bool) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = self
            .channels
            .iter()
            .filter(|slot| pred(&slot.record))
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(ConnectionConfig {
            latency_history: 3,
            ..ConnectionConfig::default()
        })
    }

    fn agent(device: &str, groups: &[&str]) -> PeerHandshake {
        PeerHandshake::peer_agent(device, groups.iter().map(|g| g.to_string()).collect())
    }

    fn connect(
        registry: &ConnectionRegistry,
        handshake: &PeerHandshake,
    ) -> (ChannelId, mpsc::UnboundedReceiver<HubFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ChannelId::generate();
        registry.on_connect(id.clone(), handshake, tx).unwrap();
        (id, rx)
    }

    #[test]
    fn lists_by_role_and_group() {
        let registry = make_registry();
        let (printer, _rx1) = connect(&registry, &agent("printer-1", &["store-1"]));
        let (_kds, _rx2) = connect(&registry, &agent("kds-1", &["store-2"]));
        let (_op, _rx3) = connect(&registry, &PeerHandshake::operator(vec!["store-1".into()]));

        assert_eq!(registry.list_by_role(PeerRole::PeerAgent).len(), 2);
        assert_eq!(registry.count_by_role(PeerRole::OperatorClient), 1);
        let store1 = registry.list_by_group("store-1");
        assert_eq!(store1.len(), 2);
        assert!(store1.iter().any(|r| r.channel_id == printer));
        assert_eq!(registry.find_by_device("kds-1").len(), 1);
    }

    #[test]
    fn disconnect_removes_channel_and_is_idempotent() {
        let registry = make_registry();
        let (id, _rx) = connect(&registry, &agent("printer-1", &[]));
        assert!(registry.on_disconnect(id.as_str()).is_some());
        assert!(registry.on_disconnect(id.as_str()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_channel_rejected() {
        let registry = make_registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = ChannelId::from("ch-fixed");
        registry.on_connect(id.clone(), &agent("a", &[]), tx.clone()).unwrap();
        assert_eq!(
            registry.on_connect(id, &agent("b", &[]), tx).unwrap_err(),
            ConnectionError::DuplicateChannel("ch-fixed".into())
        );
    }

    #[test]
    fn reconnects_are_counted_per_device() {
        let registry = make_registry();
        let handshake = agent("printer-9", &[]);
        let (first, _rx1) = connect(&registry, &handshake);
        assert_eq!(registry.get(first.as_str()).unwrap().reconnect_count, 0);
        registry.on_disconnect(first.as_str());
        let (second, _rx2) = connect(&registry, &handshake);
        assert_ne!(first, second);
        assert_eq!(registry.get(second.as_str()).unwrap().reconnect_count, 1);
    }

    #[test]
    fn heartbeat_history_is_bounded() {
        let registry = make_registry();
        let (id, _rx) = connect(&registry, &agent("p", &[]));
        for rtt in [10, 20, 30, 40] {
            assert!(registry.record_heartbeat(id.as_str(), rtt));
        }
        let record = registry.get(id.as_str()).unwrap();
        assert_eq!(record.latency_history, VecDeque::from(vec![20, 30, 40]));
        assert_eq!(record.mean_latency_ms(), Some(30.0));
        assert!(!registry.record_heartbeat("ch-missing", 1));
    }

    #[test]
    fn degraded_after_silence() {
        let registry = make_registry();
        let (id, _rx) = connect(&registry, &agent("p", &[]));
        let now = Utc::now();
        assert!(registry.degraded(now).is_empty());
        let later = now + chrono::Duration::milliseconds(DEGRADED_AFTER_MS as i64 + 1);
        let degraded = registry.degraded(later);
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].channel_id, id);
    }

    #[test]
    fn group_membership_changes() {
        let registry = make_registry();
        let (id, _rx) = connect(&registry, &agent("p", &["a"]));
        assert!(registry.join_group(id.as_str(), "b"));
        assert!(!registry.join_group(id.as_str(), "b"));
        assert!(registry.leave_group(id.as_str(), "a"));
        assert!(registry.list_by_group("a").is_empty());
        assert_eq!(registry.list_by_group("b").len(), 1);
    }

    #[tokio::test]
    async fn send_reaches_outbound_queue() {
        let registry = make_registry();
        let (id, mut rx) = connect(&registry, &agent("p", &[]));
        registry
            .send(id.as_str(), HubFrame::Close { reason: "bye".into() })
            .unwrap();
        assert_eq!(rx.recv().await, Some(HubFrame::Close { reason: "bye".into() }));

        drop(rx);
        assert_eq!(
            registry.send(id.as_str(), HubFrame::Close { reason: "x".into() }),
            Err(ConnectionError::ChannelClosed(id.to_string()))
        );
        assert!(matches!(
            registry.send("ch-nope", HubFrame::Close { reason: "x".into() }),
            Err(ConnectionError::UnknownChannel(_))
        ));
    }
}
