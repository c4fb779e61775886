//! Connection handshake.
//!
//! The first frame a peer sends is `hello`. The hub answers with `welcome`
//! carrying the channel id it assigned, or closes the socket.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::WireError;
use crate::config::{MIN_WIRE_PROTOCOL_VERSION, WIRE_PROTOCOL_VERSION};

/// What sits on the other end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// A human-facing client (dashboard, POS terminal UI).
    OperatorClient,
    /// An edge agent driving hardware. The only role that answers requests.
    PeerAgent,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::OperatorClient => write!(f, "operator_client"),
            PeerRole::PeerAgent => write!(f, "peer_agent"),
        }
    }
}

/// `hello` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHandshake {
    pub role: PeerRole,
    #[serde(default)]
    pub group_ids: Vec<String>,
    /// Stable identity of the device behind a peer agent. Survives
    /// reconnects, unlike the channel id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identity: Option<String>,
    pub protocol_version: u16,
}

impl PeerHandshake {
    pub fn peer_agent(device_identity: impl Into<String>, group_ids: Vec<String>) -> Self {
        Self {
            role: PeerRole::PeerAgent,
            group_ids,
            device_identity: Some(device_identity.into()),
            protocol_version: WIRE_PROTOCOL_VERSION,
        }
    }

    pub fn operator(group_ids: Vec<String>) -> Self {
        Self {
            role: PeerRole::OperatorClient,
            group_ids,
            device_identity: None,
            protocol_version: WIRE_PROTOCOL_VERSION,
        }
    }

    /// Check the handshake and return the protocol version both sides will
    /// speak.
    pub fn negotiate(&self) -> Result<u16, WireError> {
        if self.protocol_version < MIN_WIRE_PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion {
                offered: self.protocol_version,
                min: MIN_WIRE_PROTOCOL_VERSION,
                max: WIRE_PROTOCOL_VERSION,
            });
        }
        if self.role == PeerRole::PeerAgent {
            match self.device_identity.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => {}
                _ => {
                    return Err(WireError::HandshakeRejected(
                        "peer agents must present a device identity".into(),
                    ))
                }
            }
        }
        if self.group_ids.iter().any(|g| g.trim().is_empty()) {
            return Err(WireError::HandshakeRejected("group ids must not be blank".into()));
        }
        // Newer peers fall back to what we speak.
        Ok(self.protocol_version.min(WIRE_PROTOCOL_VERSION))
    }
}

/// `welcome` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub channel_id: String,
    pub protocol_version: u16,
    pub heartbeat_interval_ms: u64,
    pub joined_groups: Vec<String>,
}
