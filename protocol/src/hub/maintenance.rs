//! Background upkeep for a hub instance.
//!
//! Two timers drive everything that expires on its own:
//!
//! - every `sweep_interval`: idempotency entries, rate windows, stale
//!   pending requests, silent cluster instances; then a bridge restart
//!   attempt if the bus went away.
//! - every `heartbeat_interval`: a ping on every channel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::gateway::TransportGateway;

/// Run the maintenance loop until `shutdown` flips to `true` or its sender
/// is dropped.
pub fn spawn_maintenance(
    gateway: Arc<TransportGateway>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = interval(gateway.config().sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(gateway.config().connections.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Both intervals fire immediately; skip that so a fresh hub doesn't
        // ping channels that are still mid-handshake.
        sweep.tick().await;
        heartbeat.tick().await;

        info!(instance = %gateway.instance_id(), "maintenance loop started");
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    gateway.sweep().await;
                    if let Some(bridge) = gateway.bridge() {
                        bridge.ensure_running().await;
                    }
                }
                _ = heartbeat.tick() => {
                    let pinged = gateway.heartbeat_all();
                    debug!(pinged, "heartbeat round");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(instance = %gateway.instance_id(), "maintenance loop stopped");
    })
}
