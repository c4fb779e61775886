// Hub registry benchmarks.
//
// Covers the hot paths a dispatch touches before anything reaches the wire:
// correlation register/resolve, connection lookups by group and device, and
// the circuit breaker's acquire/settle cycle.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::sync::mpsc;

use tether_protocol::hub::correlation::new_correlation_id;
use tether_protocol::hub::{ChannelId, ConnectionConfig, ConnectionRegistry, CorrelationConfig, CorrelationRegistry};
use tether_protocol::reliability::{CircuitBreaker, CircuitBreakerConfig, LatencyConfig, LatencyEstimator};
use tether_protocol::wire::{PeerHandshake, ResponseEnvelope};

fn bench_correlation_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let registry = CorrelationRegistry::new(
        CorrelationConfig::default(),
        Arc::new(LatencyEstimator::new(LatencyConfig::default())),
    );

    c.bench_function("correlation/register_resolve", |b| {
        b.iter(|| {
            let id = new_correlation_id();
            let pending = registry
                .register(&id, "print", "ch-bench", Duration::from_secs(15))
                .unwrap();
            registry.resolve(ResponseEnvelope::success(id, json!(null)));
            drop(pending);
        });
    });
}

fn populated_registry(channels: usize) -> (ConnectionRegistry, Vec<mpsc::UnboundedReceiver<tether_protocol::wire::HubFrame>>) {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());
    let mut receivers = Vec::with_capacity(channels);
    for i in 0..channels {
        let (tx, rx) = mpsc::unbounded_channel();
        let handshake = PeerHandshake::peer_agent(
            format!("device-{i}"),
            vec![format!("store-{}", i % 10)],
        );
        registry
            .on_connect(ChannelId::generate(), &handshake, tx)
            .unwrap();
        receivers.push(rx);
    }
    (registry, receivers)
}

fn bench_connection_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("connections/lookup");

    for channels in [100usize, 1_000, 10_000] {
        let (registry, _receivers) = populated_registry(channels);
        group.throughput(Throughput::Elements(channels as u64));
        group.bench_with_input(BenchmarkId::new("by_group", channels), &registry, |b, reg| {
            b.iter(|| reg.list_by_group("store-3"));
        });
        group.bench_with_input(BenchmarkId::new("by_device", channels), &registry, |b, reg| {
            b.iter(|| reg.find_by_device("device-42"));
        });
    }

    group.finish();
}

fn bench_circuit_permit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));

    c.bench_function("circuit/acquire_succeed", |b| {
        b.iter(|| breaker.try_acquire("ch-bench").unwrap().succeed());
    });
}

criterion_group!(
    benches,
    bench_correlation_cycle,
    bench_connection_lookup,
    bench_circuit_permit,
);
criterion_main!(benches);
