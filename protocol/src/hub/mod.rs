//! # Hub
//!
//! The hub side of the protocol. A [`TransportGateway`] per hub instance
//! owns every registry and primitive, and is the only thing the HTTP/WS
//! layer talks to.
//!
//! ```text
//!   caller ──► TransportGateway::request_response
//!                 │ idempotency ─ rate limit ─ resolve target ─ circuit
//!                 │ register continuation (CorrelationRegistry)
//!                 ├─► local channel (ConnectionRegistry) ──► peer agent
//!                 └─► ClusterBridge ──► owning hub instance ──► peer agent
//!   response ◄── CorrelationRegistry::resolve ◄── handle_peer_frame
//! ```
//!
//! ## Modules
//!
//! - [`correlation`]: Pending requests, exactly-once completion, timers.
//! - [`connections`]: Live channels, roles, groups, heartbeat health.
//! - [`gateway`]: The composition, plus broadcast and inbound frames.
//! - [`bridge`]: Cross-instance routing over a pub/sub bus.
//! - [`maintenance`]: Periodic sweeps and heartbeats.
//! - [`monitoring`]: The read-only snapshot exposed to operators.

pub mod bridge;
pub mod connections;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod maintenance;
pub mod monitoring;

pub use bridge::{
    BridgeConfig, BridgeFrame, BridgeStatus, BridgeSweep, ClusterBridge, InMemoryPubSub, PubSub,
    RemotePeer,
};
pub use connections::{ChannelId, ConnectionConfig, ConnectionRecord, ConnectionRegistry};
pub use correlation::{CorrelationConfig, CorrelationRegistry, PendingResponse, PendingSummary};
pub use error::{BridgeError, ConnectionError, DispatchError, RegistryError};
pub use gateway::{
    DispatchHandle, DispatchOutcome, DispatchRequest, SweepReport, TargetSelector, TransportGateway,
};
pub use maintenance::spawn_maintenance;
pub use monitoring::MonitoringSnapshot;
pub use crate::wire::PeerRole;
