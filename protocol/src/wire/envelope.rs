//! Request, response and event envelopes.
//!
//! The correlation id is the only thing tying a response back to the request
//! that caused it. Peers must echo it verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::unix_millis;

/// A request sent from the hub to exactly one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub operation_type: String,
    /// Caller-supplied key. Peers may use it for their own dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Unix milliseconds at which the hub issued the request.
    pub issued_at: i64,
}

impl RequestEnvelope {
    pub fn new(
        correlation_id: impl Into<String>,
        operation_type: impl Into<String>,
        payload: Value,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            operation_type: operation_type.into(),
            idempotency_key,
            payload,
            issued_at: unix_millis(),
        }
    }
}

/// A peer's answer to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds at which the peer produced the response.
    #[serde(default)]
    pub responded_at: i64,
}

impl ResponseEnvelope {
    /// Successful response carrying `payload`.
    pub fn success(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            responded_at: unix_millis(),
        }
    }

    /// Failed response. The peer got the request and said no.
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            responded_at: unix_millis(),
        }
    }
}

/// Fire-and-forget notification fanned out to every member of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub group_id: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    pub emitted_at: i64,
}

impl EventEnvelope {
    pub fn new(group_id: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            group_id: group_id.into(),
            event: event.into(),
            payload,
            emitted_at: unix_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_uses_camel_case_on_the_wire() {
        let req = RequestEnvelope::new("req-1", "print_receipt", json!({"copies": 2}), None);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["correlationId"], "req-1");
        assert_eq!(value["operationType"], "print_receipt");
        assert!(value.get("idempotencyKey").is_none());
        assert!(value["issuedAt"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_response_tolerates_missing_optional_fields() {
        // Minimal response from a terse peer implementation.
        let raw = r#"{"correlationId":"req-9","success":true}"#;
        let resp: ResponseEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.correlation_id, "req-9");
        assert!(resp.success);
        assert!(resp.payload.is_none());
        assert_eq!(resp.responded_at, 0);
    }

    #[test]
    fn test_failure_response_carries_error() {
        let resp = ResponseEnvelope::failure("req-2", "paper jam");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("paper jam"));
        assert!(resp.payload.is_none());
    }
}
