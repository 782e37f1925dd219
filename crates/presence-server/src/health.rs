//! `/` and `/health` endpoints.

use serde::Serialize;
use std::time::Instant;

use crate::websocket::hub::HubStats;

/// Body of `GET /`.
pub const RUNNING_MESSAGE: &str = "Presence relay server is running";

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Users currently online.
    pub online_users: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, stats: HubStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        online_users: stats.online_users,
    }
}
