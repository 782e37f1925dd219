//! Wire protocol.
//!
//! Every frame is a JSON envelope `{"type": <event>, "data": <payload>}`.
//! Client frames are parsed leniently: anything that is not a known event
//! with a usable payload parses to `None` and is dropped by the caller.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Client → server: bind this connection to a user identity.
pub const IDENTIFY: &str = "identify";
/// Client → server: relay a chat payload.
pub const SEND_MESSAGE: &str = "send_message";

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Presence status carried in `user_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// A connection is bound to the user.
    Online,
    /// The user's bound connection went away.
    Offline,
}

/// Events received from clients.
#[derive(Debug)]
pub enum ClientEvent {
    /// `identify` with the requested user id (possibly empty).
    Identify {
        /// Requested identity.
        user_id: String,
    },
    /// `send_message` with its payload exactly as received.
    SendMessage {
        /// Opaque payload; `null` when the frame carried no data.
        payload: Box<RawValue>,
    },
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    event: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Parse a client text frame. Returns `None` for anything malformed.
pub fn parse_client_event(text: &str) -> Option<ClientEvent> {
    let frame: ClientFrame = serde_json::from_str(text).ok()?;
    match frame.event.as_str() {
        IDENTIFY => {
            let user_id: String = serde_json::from_str(frame.data?.get()).ok()?;
            Some(ClientEvent::Identify { user_id })
        }
        SEND_MESSAGE => {
            let payload = match frame.data {
                Some(raw) => raw,
                None => RawValue::from_string("null".to_owned()).ok()?,
            };
            Some(ClientEvent::SendMessage { payload })
        }
        _ => None,
    }
}

/// `user_status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Affected user.
    pub user_id: String,
    /// New status.
    pub status: PresenceStatus,
    /// When the change happened.
    pub timestamp: String,
}

/// `online_users` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUsers {
    /// Every user currently online.
    pub users: Vec<String>,
    /// Snapshot time.
    pub timestamp: String,
}

/// `connection_established` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    /// Server-assigned connection id.
    pub connection_id: String,
    /// Connect time.
    pub timestamp: String,
}

/// Events sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Private greeting with the connection id.
    ConnectionEstablished(ConnectionEstablished),
    /// Presence change, sent to everyone.
    UserStatus(UserStatus),
    /// Presence snapshot, sent to a newly identified connection.
    OnlineUsers(OnlineUsers),
    /// Relayed chat payload.
    ReceiveMessage(Box<RawValue>),
}

impl ServerEvent {
    /// Build a `connection_established` event stamped now.
    pub fn connection_established(connection_id: &str) -> Self {
        Self::ConnectionEstablished(ConnectionEstablished {
            connection_id: connection_id.to_owned(),
            timestamp: timestamp_now(),
        })
    }

    /// Build a `user_status` event stamped now.
    pub fn user_status(user_id: &str, status: PresenceStatus) -> Self {
        Self::UserStatus(UserStatus {
            user_id: user_id.to_owned(),
            status,
            timestamp: timestamp_now(),
        })
    }

    /// Build an `online_users` event stamped now.
    pub fn online_users(users: Vec<String>) -> Self {
        Self::OnlineUsers(OnlineUsers {
            users,
            timestamp: timestamp_now(),
        })
    }

    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::UserStatus(_) => "user_status",
            Self::OnlineUsers(_) => "online_users",
            Self::ReceiveMessage(_) => "receive_message",
        }
    }
}
