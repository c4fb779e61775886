//! # Prometheus Metrics
//!
//! Hub metrics live in a dedicated [`prometheus::Registry`] with the
//! `tether` prefix. Counters and the latency histogram are updated by the
//! request handlers; gauges are refreshed from each instance's
//! [`MonitoringSnapshot`] on every scrape, labelled by instance.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::hub::{MonitoringSnapshot, TransportGateway};

#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    /// Dispatches by instance and outcome (`ok`, `replayed`, or an error kind).
    pub requests_total: IntCounterVec,
    pub request_latency_seconds: HistogramVec,
    pub broadcasts_total: IntCounterVec,
    pub connected_channels: IntGaugeVec,
    pub degraded_channels: IntGaugeVec,
    pub pending_requests: IntGaugeVec,
    pub open_circuits: IntGaugeVec,
    pub idempotency_entries: IntGaugeVec,
    pub rate_limit_windows: IntGaugeVec,
    pub remote_peers: IntGaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels).expect("metric creation");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registration");
    gauge
}

impl HubMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("tether".into()), None)
            .expect("failed to create prometheus registry");

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Dispatched requests by outcome"),
            &["instance", "outcome"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration");

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "request_latency_seconds",
                "End-to-end request/response latency in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0,
            ]),
            &["instance"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .expect("metric registration");

        let broadcasts_total = IntCounterVec::new(
            Opts::new("broadcasts_total", "Group broadcasts issued"),
            &["instance"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(broadcasts_total.clone()))
            .expect("metric registration");

        let instance = &["instance"];
        let connected_channels = gauge(
            &registry,
            "connected_channels",
            "Live channels by role",
            &["instance", "role"],
        );
        let degraded_channels = gauge(
            &registry,
            "degraded_channels",
            "Channels silent past the degraded threshold",
            instance,
        );
        let pending_requests = gauge(
            &registry,
            "pending_requests",
            "Requests awaiting a response",
            instance,
        );
        let open_circuits = gauge(&registry, "open_circuits", "Circuits not closed", instance);
        let idempotency_entries = gauge(
            &registry,
            "idempotency_entries",
            "Cached idempotent responses",
            instance,
        );
        let rate_limit_windows = gauge(
            &registry,
            "rate_limit_windows",
            "Live rate limit windows",
            instance,
        );
        let remote_peers = gauge(
            &registry,
            "remote_peers",
            "Peers known through the cluster bridge",
            instance,
        );

        Self {
            registry,
            requests_total,
            request_latency_seconds,
            broadcasts_total,
            connected_channels,
            degraded_channels,
            pending_requests,
            open_circuits,
            idempotency_entries,
            rate_limit_windows,
            remote_peers,
        }
    }

    pub fn record_request(&self, instance: &str, outcome: &str, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[instance, outcome])
            .inc();
        self.request_latency_seconds
            .with_label_values(&[instance])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_snapshot(&self, snapshot: &MonitoringSnapshot) {
        let instance = snapshot.instance_id.as_str();
        let connections = &snapshot.connections;
        self.connected_channels
            .with_label_values(&[instance, "peer_agent"])
            .set(connections.agents as i64);
        self.connected_channels
            .with_label_values(&[instance, "operator_client"])
            .set(connections.operators as i64);
        self.degraded_channels
            .with_label_values(&[instance])
            .set(connections.degraded.len() as i64);
        self.pending_requests
            .with_label_values(&[instance])
            .set(snapshot.pending_requests as i64);
        self.open_circuits
            .with_label_values(&[instance])
            .set(snapshot.open_circuits as i64);
        self.idempotency_entries
            .with_label_values(&[instance])
            .set(snapshot.idempotency_entries as i64);
        self.rate_limit_windows
            .with_label_values(&[instance])
            .set(snapshot.rate_limit_windows as i64);
        self.remote_peers
            .with_label_values(&[instance])
            .set(snapshot.bridge.as_ref().map_or(0, |b| b.remote_peers) as i64);
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// State for the metrics listener: the registry plus every instance whose
/// gauges should be refreshed on scrape.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<HubMetrics>,
    pub gateways: Vec<Arc<TransportGateway>>,
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    for gateway in &state.gateways {
        state.metrics.observe_snapshot(&gateway.monitoring_snapshot());
    }
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
