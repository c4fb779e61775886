//! # Peer Agent
//!
//! The edge side of a channel: connects to a hub with `tokio-tungstenite`,
//! says hello, answers pings and executes requests. The link is owned by a
//! [`ReconnectionManager`], so a dropped socket turns into a backoff and a
//! fresh handshake (and a fresh channel id on the hub).
//!
//! Built-in operations:
//!
//! - `echo`: returns the request payload unchanged.
//! - `device_test`: pretends to exercise the device for 50-250 ms and
//!   reports how long it took.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use tether_protocol::peer::{ReconnectConfig, ReconnectionManager};
use tether_protocol::wire::{
    unix_millis, HubFrame, PeerFrame, PeerHandshake, Pong, RequestEnvelope, ResponseEnvelope,
};

use crate::cli::AgentArgs;

/// Run until interrupted or the reconnect budget is spent.
pub async fn run_agent(args: AgentArgs) -> Result<()> {
    let manager = Arc::new(ReconnectionManager::new(ReconnectConfig {
        max_attempts: args.max_attempts,
        ..ReconnectConfig::default()
    }));
    let handshake = PeerHandshake::peer_agent(args.device.clone(), args.groups.clone());
    info!(hub = %args.hub, device = %args.device, groups = ?args.groups, "starting peer agent");

    let session_manager = Arc::clone(&manager);
    tokio::select! {
        result = manager.run(|| {
            run_session(args.hub.clone(), handshake.clone(), Arc::clone(&session_manager))
        }) => {
            result.context("peer agent gave up reconnecting")?;
        }
        _ = crate::shutdown_signal() => {
            info!("shutdown signal received, closing link");
        }
    }
    Ok(())
}

/// One connection, from dial to drop.
async fn run_session(
    url: String,
    handshake: PeerHandshake,
    manager: Arc<ReconnectionManager>,
) -> Result<()> {
    let device = handshake.device_identity.clone().unwrap_or_default();
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(PeerFrame::Hello(handshake).encode()?))
        .await?;

    let ack = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match HubFrame::decode(&text)? {
                HubFrame::Welcome(ack) => break ack,
                HubFrame::Close { reason } => bail!("hub refused handshake: {reason}"),
                other => debug!(frame = other.kind(), "ignoring frame before welcome"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => bail!("hub closed the connection during handshake"),
        }
    };
    manager.mark_connected();
    info!(
        channel_id = %ack.channel_id,
        protocol_version = ack.protocol_version,
        groups = ?ack.joined_groups,
        "connected to hub"
    );

    // Requests run concurrently; their responses funnel back through here.
    let (responses_tx, mut responses_rx) = mpsc::unbounded_channel::<PeerFrame>();

    loop {
        tokio::select! {
            Some(frame) = responses_rx.recv() => {
                sink.send(Message::Text(frame.encode()?)).await?;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match HubFrame::decode(&text) {
                    Ok(HubFrame::Request(request)) => {
                        let tx = responses_tx.clone();
                        let device = device.clone();
                        tokio::spawn(async move {
                            let response = execute(&device, request).await;
                            let _ = tx.send(PeerFrame::Response(response));
                        });
                    }
                    Ok(HubFrame::Ping(ping)) => {
                        let one_way = u64::try_from(unix_millis().saturating_sub(ping.sent_at)).unwrap_or(0);
                        manager.record_heartbeat(one_way);
                        sink.send(Message::Text(PeerFrame::Pong(Pong::answer(&ping)).encode()?)).await?;
                        debug!(nonce = ping.nonce, health = manager.health_score(), "pong");
                    }
                    Ok(HubFrame::Event(event)) => {
                        info!(group = %event.group_id, event = %event.event, "event received");
                    }
                    Ok(HubFrame::Close { reason }) => {
                        warn!(reason = %reason, "hub closed the channel");
                        return Ok(());
                    }
                    Ok(HubFrame::Welcome(_)) => warn!("unexpected second welcome"),
                    Err(e) => warn!(error = %e, "malformed hub frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("hub connection closed");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

async fn execute(device: &str, request: RequestEnvelope) -> ResponseEnvelope {
    debug!(
        correlation_id = %request.correlation_id,
        operation = %request.operation_type,
        "executing request"
    );
    match request.operation_type.as_str() {
        "echo" => ResponseEnvelope::success(request.correlation_id, request.payload),
        "device_test" => {
            let took_ms = rand::thread_rng().gen_range(50..=250);
            tokio::time::sleep(Duration::from_millis(took_ms)).await;
            ResponseEnvelope::success(
                request.correlation_id,
                json!({ "device": device, "status": "ok", "tookMs": took_ms }),
            )
        }
        other => ResponseEnvelope::failure(
            request.correlation_id,
            format!("unsupported operation: {other}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_payload() {
        let req = RequestEnvelope::new("req-1", "echo", json!({"n": 1}), None);
        let resp = execute("printer-1", req).await;
        assert!(resp.success);
        assert_eq!(resp.correlation_id, "req-1");
        assert_eq!(resp.payload, Some(json!({"n": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn device_test_reports_device() {
        let req = RequestEnvelope::new("req-2", "device_test", json!({}), None);
        let resp = execute("printer-1", req).await;
        let payload = resp.payload.unwrap();
        assert_eq!(payload["device"], "printer-1");
        let took = payload["tookMs"].as_u64().unwrap();
        assert!((50..=250).contains(&took));
    }

    #[tokio::test]
    async fn unknown_operation_is_refused() {
        let req = RequestEnvelope::new("req-3", "launch_rocket", json!({}), None);
        let resp = execute("printer-1", req).await;
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("unsupported operation: launch_rocket"));
    }
}
