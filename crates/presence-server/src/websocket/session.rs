//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::hub::HubHandle;
use super::protocol::{ServerEvent, parse_client_event};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Per-session tuning taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Outbound queue depth.
    pub send_queue_capacity: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// How long a client may stay silent before it is dropped.
    pub pong_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            send_queue_capacity: config.send_queue_capacity.max(1),
            ping_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(config.heartbeat_timeout_secs.max(1)),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// Reading from the socket failed.
    ReadError,
    /// The writer stopped (send failure or heartbeat timeout).
    WriterStopped,
    /// The server is shutting down.
    Shutdown,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Queues a `connection_established` event with the connection ID
/// 2. Registers the connection with the hub
/// 3. Forwards parsed client events to the hub in arrival order
/// 4. Sends periodic Ping frames and drops unresponsive clients
/// 5. Reports the disconnect to the hub
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: String,
    hub: HubHandle,
    settings: SessionSettings,
    cancel: CancellationToken,
) -> CloseReason {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<str>>(settings.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(connection_id.clone(), send_tx));

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Greeting goes first in the queue, ahead of any broadcast.
    let _ = connection.send_event(&ServerEvent::connection_established(&connection_id));
    if !hub.connect(Arc::clone(&connection)).await {
        warn!("hub unavailable, closing session");
    }

    let outbound_conn = Arc::clone(&connection);
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(settings.ping_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > settings.pong_timeout
                    {
                        warn!(timeout = ?settings.pong_timeout, "client unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break CloseReason::ReadError;
                    }
                    None => break CloseReason::ClientClosed,
                };
                connection.mark_alive();

                // Browsers send text; some native clients send UTF-8 binary
                let text = match msg {
                    Message::Text(ref t) => Some(t.as_str().to_owned()),
                    Message::Binary(ref data) => {
                        if let Ok(s) = std::str::from_utf8(data) {
                            Some(s.to_owned())
                        } else {
                            debug!(len = data.len(), "received non-UTF8 binary frame");
                            None
                        }
                    }
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break CloseReason::ClientClosed;
                    }
                    Message::Ping(_) | Message::Pong(_) => None,
                };

                let Some(text) = text else { continue };
                let Some(event) = parse_client_event(&text) else {
                    debug!(len = text.len(), "ignoring malformed frame");
                    continue;
                };
                if !hub.dispatch(&connection_id, event).await {
                    break CloseReason::Shutdown;
                }
            }
            _ = &mut outbound => break CloseReason::WriterStopped,
            () = cancel.cancelled() => break CloseReason::Shutdown,
        }
    };

    info!(?reason, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    outbound.abort();
    let _ = hub.disconnect(&connection_id).await;
    reason
}
