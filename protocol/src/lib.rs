// Copyright (c) 2026 Tether Contributors. MIT License.
// See LICENSE for details.

//! # Tether Protocol Core Library
//!
//! Tether turns a persistent, bidirectional message channel between a central
//! hub and a fleet of remote peer agents (edge boxes sitting in front of
//! printers, kitchen displays and other hardware) into a request/response
//! protocol with exactly-once-effective semantics.
//!
//! The raw channel gives us very little: frames arrive whenever they arrive,
//! peers vanish mid-request, and retries produce duplicate responses. This
//! crate layers the guarantees on top.
//!
//! ## Architecture
//!
//! - **wire**: Envelopes, frames, handshake and heartbeat messages.
//! - **reliability**: Latency estimation, circuit breaking, idempotency
//!   and rate limiting. No knowledge of connections or peers.
//! - **hub**: Correlation and connection registries, the transport gateway
//!   that composes everything, and the cluster bridge for multi-instance hubs.
//! - **peer**: Peer-side connection lifecycle (backoff, health, forced
//!   reconnects).
//! - **config**: Protocol constants and the aggregated hub configuration.
//!
//! ## Ground Rules
//!
//! 1. A continuation is registered before the frame that can complete it is
//!    sent. No sleeps, no "probably fast enough".
//! 2. Every pending request completes exactly once: response, timeout,
//!    disconnect or cancel. Whoever removes the registry entry wins.
//! 3. Failures are values. Callers get a typed [`hub::DispatchError`], never
//!    a panic.

pub mod config;
pub mod hub;
pub mod peer;
pub mod reliability;
pub mod wire;
