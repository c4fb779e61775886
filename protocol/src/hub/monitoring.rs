//! Read-only snapshot of a hub instance for operational tooling.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::bridge::BridgeStatus;
use super::correlation::PendingSummary;
use super::gateway::TransportGateway;
use crate::reliability::{CircuitMetrics, LatencyStats};
use crate::wire::PeerRole;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub operators: usize,
    pub agents: usize,
    /// Channels silent for longer than the degraded threshold.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub instance_id: String,
    pub taken_at: DateTime<Utc>,
    pub connections: ConnectionSummary,
    pub pending_requests: usize,
    pub pending: Vec<PendingSummary>,
    pub circuits: Vec<CircuitMetrics>,
    pub open_circuits: usize,
    pub latency: Vec<LatencyStats>,
    pub idempotency_entries: usize,
    pub rate_limit_windows: usize,
    /// `None` when the instance runs without a cluster bridge.
    pub bridge: Option<BridgeStatus>,
}

impl MonitoringSnapshot {
    pub fn capture(gateway: &TransportGateway) -> Self {
        let now = Utc::now();
        let connections = gateway.connections();
        let mut degraded: Vec<String> = connections
            .degraded(now)
            .into_iter()
            .map(|r| r.channel_id.to_string())
            .collect();
        degraded.sort();

        let pending = gateway.correlations().snapshot();
        let breaker = gateway.circuit_breaker();

        Self {
            instance_id: gateway.instance_id().to_string(),
            taken_at: now,
            connections: ConnectionSummary {
                total: connections.len(),
                operators: connections.count_by_role(PeerRole::OperatorClient),
                agents: connections.count_by_role(PeerRole::PeerAgent),
                degraded,
            },
            pending_requests: pending.len(),
            pending,
            circuits: breaker.metrics(),
            open_circuits: breaker.open_count(),
            latency: gateway.latency().stats(),
            idempotency_entries: gateway.idempotency_entries(),
            rate_limit_windows: gateway.rate_limit_windows(),
            bridge: gateway.bridge().map(|b| b.status()),
        }
    }
}
