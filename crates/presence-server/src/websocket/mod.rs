//! WebSocket connection management, wire protocol, presence hub, and fan-out.

pub mod broadcast;
pub mod connection;
pub mod hub;
pub mod protocol;
pub mod session;
