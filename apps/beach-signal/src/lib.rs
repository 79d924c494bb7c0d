//! WebRTC signaling relay for Beach video calls.
//!
//! Browsers connect over a websocket, authenticate with a shared secret and a
//! self-chosen identity, then use the relay to publish offers, answer them
//! and trickle ICE candidates to the other side. The relay only brokers these
//! blobs; media flows peer to peer.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod websocket;
