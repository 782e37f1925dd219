//! Event fan-out to connected WebSocket clients.
//!
//! Owned by the hub task, so the connection table needs no lock.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::protocol::ServerEvent;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;

/// Manages event delivery to connected clients.
#[derive(Default)]
pub struct BroadcastManager {
    /// Connected clients indexed by connection ID.
    connections: HashMap<String, Arc<ClientConnection>>,
}

impl BroadcastManager {
    /// Create an empty broadcast manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, replacing any with the same ID.
    pub fn add(&mut self, connection: Arc<ClientConnection>) {
        let _ = self.connections.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID, returning it.
    pub fn remove(&mut self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.remove(connection_id)
    }

    /// Look up a connection by ID.
    pub fn get(&self, connection_id: &str) -> Option<&Arc<ClientConnection>> {
        self.connections.get(connection_id)
    }

    /// Send an event to every connection. Returns the number of deliveries.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };
        let recipients = self.connections.len();
        debug!(event_type = event.event_type(), recipients, "broadcast event to all");

        let mut delivered = 0;
        for conn in self.connections.values() {
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(conn_id = %conn.id, event_type = event.event_type(), "failed to send event to client");
            }
        }
        delivered
    }

    /// Send an event to a single connection.
    pub fn send_to(&self, connection_id: &str, event: &ServerEvent) -> bool {
        let Some(conn) = self.connections.get(connection_id) else {
            return false;
        };
        let Some(json) = serialize(event) else {
            return false;
        };
        let sent = conn.send(json);
        if !sent {
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            warn!(conn_id = %conn.id, event_type = event.event_type(), "failed to send event to client");
        }
        sent
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn serialize(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
            None
        }
    }
}
