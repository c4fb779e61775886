//! Errors raised while encoding, decoding or negotiating frames.

use thiserror::Error;

/// Wire-level failures. None of these ever reach a dispatch caller; they
/// end the offending connection instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The frame isn't valid JSON or doesn't match any known frame type.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame couldn't be serialized. Practically unreachable with
    /// `serde_json::Value` payloads, but we don't panic on it either.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The peer speaks a protocol version outside the supported window.
    #[error("unsupported protocol version {offered} (supported {min}..={max})")]
    UnsupportedVersion {
        /// Version the peer offered.
        offered: u16,
        /// Oldest version we accept.
        min: u16,
        /// Newest version we speak.
        max: u16,
    },

    /// The handshake was well-formed but unacceptable.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}
