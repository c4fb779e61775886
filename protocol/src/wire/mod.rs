//! # Wire Format
//!
//! Everything that crosses the hub/peer channel is a JSON text frame. Hub to
//! peer traffic is a [`HubFrame`]; peer to hub traffic is a [`PeerFrame`].
//! Both are internally tagged by a `type` field so a peer written in any
//! language can dispatch on one string.
//!
//! ```text
//!   peer                         hub
//!    |  hello {role, groups}  ->  |
//!    |  <- welcome {channelId}    |
//!    |  <- request {corrId, ..}   |
//!    |  response {corrId, ..} ->  |
//!    |  <- ping {nonce, sentAt}   |
//!    |  pong {nonce, ..}      ->  |
//! ```

pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod heartbeat;

pub use envelope::{EventEnvelope, RequestEnvelope, ResponseEnvelope};
pub use error::WireError;
pub use frame::{HubFrame, PeerFrame};
pub use handshake::{HandshakeAck, PeerHandshake, PeerRole};
pub use heartbeat::{Ping, Pong};

/// Current wall-clock time as Unix milliseconds. Wire timestamps use this;
/// anything that measures durations uses a monotonic clock instead.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
