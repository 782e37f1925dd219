//! # presence-server
//!
//! Axum HTTP + `WebSocket` presence relay.
//!
//! - Presence registry: which user identity is bound to which live connection
//! - `WebSocket` gateway: connection lifecycle, heartbeat, frame parsing
//! - Hub event loop: a single task owns presence state and fans events out
//! - HTTP endpoints: liveness text, health JSON, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod websocket;
