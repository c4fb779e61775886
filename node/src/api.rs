//! # HTTP + WebSocket API
//!
//! One axum router per hub instance. Domain code talks to the hub through
//! `POST /requests` and `POST /broadcast`; peers and operator consoles hold
//! a WebSocket on `/ws`.
//!
//! ## Endpoints
//!
//! | Method | Path          | Description                                |
//! |--------|---------------|--------------------------------------------|
//! | GET    | `/health`     | Liveness probe                             |
//! | GET    | `/status`     | Instance summary                           |
//! | GET    | `/monitoring` | Full [`MonitoringSnapshot`] as JSON        |
//! | POST   | `/requests`   | Request/response to a peer                 |
//! | POST   | `/broadcast`  | Fire-and-forget event to a group           |
//! | DELETE | `/idempotency/:key` | Forget a cached response             |
//! | GET    | `/ws`         | Peer / operator channel                    |
//!
//! Dispatch failures map onto HTTP statuses:
//!
//! | Error kind                     | Status |
//! |--------------------------------|--------|
//! | `unavailable`, `circuit_open`  | 503    |
//! | `rate_limited`                 | 429 + `Retry-After` |
//! | `timeout`                      | 504    |
//! | `rejected`                     | 502    |
//! | `cancelled`                    | 409    |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tether_protocol::config::WIRE_PROTOCOL_VERSION;
use tether_protocol::hub::{DispatchError, DispatchRequest, MonitoringSnapshot, TransportGateway};
use tether_protocol::wire::{HubFrame, PeerFrame, PeerHandshake};

use crate::metrics::HubMetrics;

/// A channel must say `hello` within this long of the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Per-instance handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub gateway: Arc<TransportGateway>,
    pub metrics: Arc<HubMetrics>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/monitoring", get(monitoring_handler))
        .route("/requests", post(request_handler))
        .route("/broadcast", post(broadcast_handler))
        .route("/idempotency/:key", delete(forget_idempotency_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub instance_id: String,
    pub protocol_version: u16,
    pub channels: usize,
    pub agents: usize,
    pub operators: usize,
    pub pending_requests: usize,
    /// `None` when the instance runs without a cluster bridge.
    pub bridge_available: Option<bool>,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub group_id: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

/// Error body for failed dispatches.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: DispatchError,
}

/// A [`DispatchError`] rendered as an HTTP response.
struct DispatchFailure(DispatchError);

impl DispatchFailure {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::Unavailable { .. } | DispatchError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Rejected { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Cancelled { .. } => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for DispatchFailure {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self.0 {
            DispatchError::RateLimited {
                retry_after_secs, ..
            } => HeaderValue::from_str(&retry_after_secs.to_string()).ok(),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            detail: self.0,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`. Liveness only; `/status` and `/monitoring` say more.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let connections = gateway.connections();
    Json(StatusResponse {
        version: state.version.clone(),
        instance_id: gateway.instance_id().to_string(),
        protocol_version: WIRE_PROTOCOL_VERSION,
        channels: connections.len(),
        agents: connections.count_by_role(tether_protocol::wire::PeerRole::PeerAgent),
        operators: connections.count_by_role(tether_protocol::wire::PeerRole::OperatorClient),
        pending_requests: gateway.correlations().len(),
        bridge_available: gateway.bridge().map(|b| b.is_available()),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn monitoring_handler(State(state): State<AppState>) -> Json<MonitoringSnapshot> {
    Json(state.gateway.monitoring_snapshot())
}

/// `POST /requests`. Blocks until the peer answers or the dispatch fails.
async fn request_handler(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Response {
    let started = Instant::now();
    let instance = state.gateway.instance_id().to_string();
    match state.gateway.request_response(request).await {
        Ok(outcome) => {
            let label = if outcome.replayed { "replayed" } else { "ok" };
            state.metrics.record_request(&instance, label, started.elapsed());
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => {
            state
                .metrics
                .record_request(&instance, e.kind(), started.elapsed());
            DispatchFailure(e).into_response()
        }
    }
}

async fn broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Json<BroadcastResponse> {
    let delivered = state
        .gateway
        .broadcast(&request.group_id, &request.event, request.payload)
        .await;
    state
        .metrics
        .broadcasts_total
        .with_label_values(&[state.gateway.instance_id()])
        .inc();
    Json(BroadcastResponse { delivered })
}

/// `DELETE /idempotency/:key`. The next request under the key goes to the
/// peer again.
async fn forget_idempotency_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> StatusCode {
    if state.gateway.forget_idempotency_key(&key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_channel(socket, state.gateway))
}

// ---------------------------------------------------------------------------
// Channel Lifecycle
// ---------------------------------------------------------------------------

/// Drive one peer channel: handshake, then an outbound pump and the inbound
/// frame loop until either side goes away.
async fn handle_channel(socket: WebSocket, gateway: Arc<TransportGateway>) {
    let (mut sink, mut stream) = socket.split();

    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(&mut stream)).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            debug!("channel closed before hello");
            return;
        }
        Err(_) => {
            warn!("channel sent no hello in time");
            let _ = send_close(&mut sink, "handshake timeout").await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HubFrame>();
    let ack = match gateway.connect(&handshake, outbound_tx).await {
        Ok(ack) => ack,
        Err(e) => {
            warn!(error = %e, "handshake rejected");
            let _ = send_close(&mut sink, &e.to_string()).await;
            return;
        }
    };
    let channel_id = ack.channel_id;

    let mut pump = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(frame = frame.kind(), error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match PeerFrame::decode(&text) {
                    Ok(frame) => gateway.handle_peer_frame(&channel_id, frame).await,
                    Err(e) => warn!(channel_id = %channel_id, error = %e, "malformed peer frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut pump => break,
        }
    }

    let failed = gateway.disconnect(&channel_id).await;
    pump.abort();
    info!(channel_id = %channel_id, failed_requests = failed, "channel closed");
}

/// First text frame, which must be `hello`. `None` if the socket closes or
/// says something else first.
async fn read_hello<S>(stream: &mut S) -> Option<PeerHandshake>
where
    S: futures::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return match PeerFrame::decode(&text) {
                    Ok(PeerFrame::Hello(handshake)) => Some(handshake),
                    Ok(other) => {
                        warn!(frame = other.kind(), "expected hello");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed hello");
                        None
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send_close<S>(sink: &mut S, reason: &str) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = HubFrame::Close {
        reason: reason.to_string(),
    };
    if let Ok(text) = frame.encode() {
        sink.send(Message::Text(text)).await?;
    }
    sink.close().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tether_protocol::config::HubConfig;
    use tether_protocol::wire::ResponseEnvelope;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            version: "0.1.0-test".into(),
            gateway: Arc::new(TransportGateway::new(HubConfig::with_instance_id("hub-test"))),
            metrics: Arc::new(HubMetrics::new()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(router: &Router, path: &str, body: Value) -> Response {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        router.clone().oneshot(req).await.unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Connect a fake agent straight to the gateway and answer every
    /// request with its own payload.
    async fn echo_agent(gateway: &Arc<TransportGateway>, device: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ack = gateway
            .connect(&PeerHandshake::peer_agent(device, vec!["store-1".into()]), tx)
            .await
            .unwrap();
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let HubFrame::Request(req) = frame {
                    let resp = ResponseEnvelope::success(req.correlation_id, req.payload);
                    gateway.handle_response(&ack.channel_id, resp).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_instance_and_channels() {
        let state = test_state();
        echo_agent(&state.gateway, "printer-1").await;
        let router = create_router(state);

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.instance_id, "hub-test");
        assert_eq!(resp.channels, 1);
        assert_eq!(resp.agents, 1);
        assert_eq!(resp.bridge_available, None);
    }

    #[tokio::test]
    async fn monitoring_endpoint_serves_snapshot() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/monitoring").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["instance_id"], "hub-test");
        assert_eq!(json["pending_requests"], 0);
    }

    #[tokio::test]
    async fn request_round_trips_through_agent() {
        let state = test_state();
        echo_agent(&state.gateway, "printer-1").await;
        let router = create_router(state);

        let resp = post_json(
            &router,
            "/requests",
            serde_json::json!({
                "target": {"kind": "device", "deviceIdentity": "printer-1"},
                "operationType": "echo",
                "payload": {"text": "hi"}
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["payload"]["text"], "hi");
        assert_eq!(json["replayed"], false);
    }

    #[tokio::test]
    async fn forgotten_idempotency_key_is_dispatched_again() {
        let state = test_state();
        echo_agent(&state.gateway, "printer-1").await;
        let router = create_router(state);
        let body = serde_json::json!({
            "target": {"kind": "device", "deviceIdentity": "printer-1"},
            "operationType": "print",
            "idempotencyKey": "order-7"
        });

        let first = body_json(post_json(&router, "/requests", body.clone()).await).await;
        assert_eq!(first["replayed"], false);
        let second = body_json(post_json(&router, "/requests", body.clone()).await).await;
        assert_eq!(second["replayed"], true);

        let req = Request::builder()
            .method("DELETE")
            .uri("/idempotency/order-7")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let third = body_json(post_json(&router, "/requests", body).await).await;
        assert_eq!(third["replayed"], false);
        assert_ne!(third["correlationId"], first["correlationId"]);

        let req = Request::builder()
            .method("DELETE")
            .uri("/idempotency/never-seen")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_target_maps_to_503() {
        let router = create_router(test_state());
        let resp = post_json(
            &router,
            "/requests",
            serde_json::json!({
                "target": {"kind": "device", "deviceIdentity": "ghost"},
                "operationType": "echo"
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["detail"]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let mut config = HubConfig::with_instance_id("hub-test");
        config.rate_limit.target_limit = 1;
        let state = AppState {
            gateway: Arc::new(TransportGateway::new(config)),
            ..test_state()
        };
        let router = create_router(state);
        let body = serde_json::json!({
            "target": {"kind": "device", "deviceIdentity": "ghost"},
            "operationType": "echo"
        });

        // The first call spends the quota even though nobody is connected.
        let first = post_json(&router, "/requests", body.clone()).await;
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);

        let second = post_json(&router, "/requests", body).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0 && retry_after <= 60);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (
                DispatchError::CircuitOpen {
                    target: "ch".into(),
                    retry_after_ms: 10,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::Timeout {
                    correlation_id: "req-1".into(),
                    timeout_ms: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DispatchError::Rejected {
                    correlation_id: "req-1".into(),
                    message: "paper jam".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DispatchError::Cancelled {
                    correlation_id: "req-1".into(),
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(DispatchFailure(error).status(), expected);
        }
    }

    #[tokio::test]
    async fn broadcast_reports_local_deliveries() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .gateway
            .connect(&PeerHandshake::operator(vec!["store-1".into()]), tx)
            .await
            .unwrap();
        let router = create_router(state);

        let resp = post_json(
            &router,
            "/broadcast",
            serde_json::json!({"groupId": "store-1", "event": "menu.updated"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["delivered"], 1);
    }
}
