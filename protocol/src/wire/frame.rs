//! Top-level frames for both directions of the channel.

use serde::{Deserialize, Serialize};

use super::envelope::{EventEnvelope, RequestEnvelope, ResponseEnvelope};
use super::error::WireError;
use super::handshake::{HandshakeAck, PeerHandshake};
use super::heartbeat::{Ping, Pong};

/// Frames the hub sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    Welcome(HandshakeAck),
    Request(RequestEnvelope),
    Event(EventEnvelope),
    Ping(Ping),
    Close { reason: String },
}

/// Frames a peer sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerFrame {
    Hello(PeerHandshake),
    Response(ResponseEnvelope),
    Pong(Pong),
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveGroup { group_id: String },
}

impl HubFrame {
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Short name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            HubFrame::Welcome(_) => "welcome",
            HubFrame::Request(_) => "request",
            HubFrame::Event(_) => "event",
            HubFrame::Ping(_) => "ping",
            HubFrame::Close { .. } => "close",
        }
    }
}

impl PeerFrame {
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerFrame::Hello(_) => "hello",
            PeerFrame::Response(_) => "response",
            PeerFrame::Pong(_) => "pong",
            PeerFrame::JoinGroup { .. } => "join_group",
            PeerFrame::LeaveGroup { .. } => "leave_group",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_is_flat_and_tagged() {
        let frame = HubFrame::Request(RequestEnvelope::new(
            "req-1",
            "open_drawer",
            json!({}),
            Some("k-1".into()),
        ));
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["correlationId"], "req-1");
        assert_eq!(value["idempotencyKey"], "k-1");
        assert_eq!(HubFrame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_decode_peer_response() {
        let raw = r#"{"type":"response","correlationId":"req-5","success":false,"error":"offline"}"#;
        match PeerFrame::decode(raw).unwrap() {
            PeerFrame::Response(resp) => {
                assert_eq!(resp.correlation_id, "req-5");
                assert_eq!(resp.error.as_deref(), Some("offline"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_join_group() {
        let raw = r#"{"type":"join_group","groupId":"store-3"}"#;
        assert_eq!(
            PeerFrame::decode(raw).unwrap(),
            PeerFrame::JoinGroup { group_id: "store-3".into() }
        );
    }

    #[test]
    fn test_unknown_frame_type_is_malformed() {
        let err = PeerFrame::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
        assert!(HubFrame::decode("not json").is_err());
    }

    #[test]
    fn test_frame_kinds() {
        assert_eq!(HubFrame::Close { reason: "bye".into() }.kind(), "close");
        assert_eq!(PeerFrame::Pong(Pong { nonce: 1, echoed_sent_at: 0 }).kind(), "pong");
    }
}
