//! # Peer Side
//!
//! What a peer agent needs beyond the wire types: keeping its single link
//! to the hub alive. The hub never sees any of this; it just notices a new
//! channel with the same device identity.

pub mod reconnect;

pub use reconnect::{backoff_delay, LinkState, ReconnectConfig, ReconnectError, ReconnectionManager};
