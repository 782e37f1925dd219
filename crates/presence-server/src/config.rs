//! Server configuration with environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. Apply environment variable overrides
//! 3. The binary applies CLI flags last (highest priority)
//!
//! Invalid environment values are ignored with a warning and the default is
//! kept.

use serde::{Deserialize, Serialize};

/// Port used when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 3001;

/// Client origin allowed when `CLIENT_URL` is unset.
pub const DEFAULT_CLIENT_ORIGIN: &str = "http://localhost:3000";

/// Origin value that allows any client.
pub const ANY_ORIGIN: &str = "*";

/// Configuration for the presence relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default [`DEFAULT_PORT`], `0` for auto-assign).
    pub port: u16,
    /// Browser origin allowed to open connections, or `"*"`.
    pub client_origin: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound queue depth per connection before messages are dropped.
    pub send_queue_capacity: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect a client after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            client_origin: DEFAULT_CLIENT_ORIGIN.into(),
            max_connections: 1024,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}

impl ServerConfig {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply overrides read through `lookup` (an environment accessor).
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `PORT` | `port` |
    /// | `CLIENT_URL` | `client_origin` |
    /// | `RELAY_HOST` | `host` |
    /// | `RELAY_MAX_CONNECTIONS` | `max_connections` |
    /// | `RELAY_SEND_QUEUE` | `send_queue_capacity` |
    /// | `RELAY_HEARTBEAT_INTERVAL_SECS` | `heartbeat_interval_secs` |
    /// | `RELAY_HEARTBEAT_TIMEOUT_SECS` | `heartbeat_timeout_secs` |
    /// | `RELAY_MAX_MESSAGE_SIZE` | `max_message_size` |
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(v) = env.u16("PORT", 0, 65535) {
            self.port = v;
        }
        if let Some(v) = env.string("CLIENT_URL") {
            self.client_origin = v;
        }
        if let Some(v) = env.string("RELAY_HOST") {
            self.host = v;
        }
        if let Some(v) = env.usize("RELAY_MAX_CONNECTIONS", 1, 1_000_000) {
            self.max_connections = v;
        }
        if let Some(v) = env.usize("RELAY_SEND_QUEUE", 1, 65_536) {
            self.send_queue_capacity = v;
        }
        if let Some(v) = env.u64("RELAY_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = env.u64("RELAY_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
            self.heartbeat_timeout_secs = v;
        }
        if let Some(v) = env.usize("RELAY_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
            self.max_message_size = v;
        }
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether every origin is accepted.
    pub fn allows_any_origin(&self) -> bool {
        self.client_origin == ANY_ORIGIN
    }

    /// Whether a request `Origin` header value is acceptable.
    ///
    /// Requests without an `Origin` (non-browser clients) are always allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allows_any_origin() => true,
            Some(o) => o.trim_end_matches('/') == self.client_origin.trim_end_matches('/'),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
