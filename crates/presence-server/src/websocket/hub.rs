//! Presence hub: the single task that owns presence state.
//!
//! Sessions forward [`HubCommand`]s over a bounded channel. The hub applies
//! them one at a time, so each registry mutation and the broadcasts it
//! triggers happen atomically with respect to every other connection's
//! events. Commands from one session arrive in the order the session sent
//! them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::broadcast::BroadcastManager;
use super::connection::ClientConnection;
use super::protocol::{ClientEvent, PresenceStatus, ServerEvent};
use crate::metrics::{PRESENCE_ONLINE_USERS, RELAY_MESSAGES_TOTAL};
use crate::presence::PresenceRegistry;

/// Capacity of the session → hub command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Work items processed by the hub.
pub enum HubCommand {
    /// A transport session was established.
    Connect(Arc<ClientConnection>),
    /// A parsed client event.
    Event {
        /// Originating connection.
        connection_id: String,
        /// The event.
        event: ClientEvent,
    },
    /// The transport session closed.
    Disconnect {
        /// Closed connection.
        connection_id: String,
    },
    /// Registers the connection, then panics mid-handler.
    #[cfg(test)]
    Panic(Arc<ClientConnection>),
}

/// Counters published after every command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Open connections.
    pub connections: usize,
    /// Users with a live binding.
    pub online_users: usize,
}

/// Cloneable sender side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    stats: watch::Receiver<HubStats>,
}

impl HubHandle {
    /// Register a new connection.
    pub async fn connect(&self, connection: Arc<ClientConnection>) -> bool {
        self.tx.send(HubCommand::Connect(connection)).await.is_ok()
    }

    /// Forward a client event.
    pub async fn dispatch(&self, connection_id: &str, event: ClientEvent) -> bool {
        self.tx
            .send(HubCommand::Event {
                connection_id: connection_id.to_owned(),
                event,
            })
            .await
            .is_ok()
    }

    /// Report a closed connection.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        self.tx
            .send(HubCommand::Disconnect {
                connection_id: connection_id.to_owned(),
            })
            .await
            .is_ok()
    }

    /// Latest published counters.
    pub fn stats(&self) -> HubStats {
        *self.stats.borrow()
    }
}

/// Owns the presence registry and the fan-out table.
pub struct RelayHub {
    registry: PresenceRegistry,
    broadcast: BroadcastManager,
    rx: mpsc::Receiver<HubCommand>,
    stats_tx: watch::Sender<HubStats>,
}

impl RelayHub {
    /// Create a hub and the handle used to feed it.
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(HubStats::default());
        let hub = Self {
            registry: PresenceRegistry::new(),
            broadcast: BroadcastManager::new(),
            rx,
            stats_tx,
        };
        (hub, HubHandle { tx, stats: stats_rx })
    }

    /// Process commands until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("presence hub started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_guarded(command);
                }
                () = cancel.cancelled() => break,
            }
        }
        info!(
            connections = self.broadcast.connection_count(),
            online_users = self.registry.len(),
            "presence hub stopped"
        );
    }

    /// Apply one command, containing any panic so the hub keeps serving.
    pub fn handle_guarded(&mut self, command: HubCommand) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handle(command)));
        if outcome.is_err() {
            error!("hub command handler panicked; continuing");
        }
        self.publish_stats();
    }

    /// Apply one command.
    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect(connection) => {
                debug!(connection_id = %connection.id, "connection registered");
                self.broadcast.add(connection);
            }
            HubCommand::Event {
                connection_id,
                event,
            } => {
                let Some(connection) = self.broadcast.get(&connection_id).cloned() else {
                    debug!(connection_id, "event from unknown connection ignored");
                    return;
                };
                match event {
                    ClientEvent::Identify { user_id } => self.identify(&connection, user_id),
                    ClientEvent::SendMessage { payload } => {
                        self.relay(&connection_id, payload);
                    }
                }
            }
            HubCommand::Disconnect { connection_id } => self.disconnect(&connection_id),
            #[cfg(test)]
            HubCommand::Panic(connection) => {
                self.broadcast.add(connection);
                panic!("hub handler failure");
            }
        }
    }

    fn identify(&mut self, connection: &ClientConnection, user_id: String) {
        if user_id.is_empty() {
            debug!(connection_id = %connection.id, "identify without user id ignored");
            return;
        }

        if let Some(previous) = connection.bind_user(user_id.clone()) {
            if previous != user_id && self.registry.unbind(&previous, &connection.id) {
                info!(connection_id = %connection.id, user_id = %previous, "user offline (re-identified)");
                let _ = self
                    .broadcast
                    .broadcast_all(&ServerEvent::user_status(&previous, PresenceStatus::Offline));
            }
        }

        self.registry.bind(&user_id, &connection.id);
        info!(connection_id = %connection.id, user_id = %user_id, "user online");

        let _ = self
            .broadcast
            .broadcast_all(&ServerEvent::user_status(&user_id, PresenceStatus::Online));
        let _ = self.broadcast.send_to(
            &connection.id,
            &ServerEvent::online_users(self.registry.online_user_ids()),
        );
    }

    fn relay(&self, connection_id: &str, payload: Box<RawValue>) {
        counter!(RELAY_MESSAGES_TOTAL).increment(1);
        let recipients = self
            .broadcast
            .broadcast_all(&ServerEvent::ReceiveMessage(payload));
        debug!(connection_id, recipients, "message relayed");
    }

    fn disconnect(&mut self, connection_id: &str) {
        let Some(connection) = self.broadcast.remove(connection_id) else {
            debug!(connection_id, "disconnect for unknown connection ignored");
            return;
        };
        let Some(user_id) = connection.user_id() else {
            return;
        };
        if self.registry.unbind(&user_id, connection_id) {
            info!(connection_id, user_id = %user_id, "user offline");
            let _ = self
                .broadcast
                .broadcast_all(&ServerEvent::user_status(&user_id, PresenceStatus::Offline));
        } else {
            debug!(connection_id, user_id = %user_id, "binding superseded, user stays online");
        }
    }

    fn publish_stats(&self) {
        let stats = HubStats {
            connections: self.broadcast.connection_count(),
            online_users: self.registry.len(),
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(PRESENCE_ONLINE_USERS).set(stats.online_users as f64);
        let _ = self.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }

    /// Read access to the registry.
    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::protocol::parse_client_event;
    use serde_json::Value;

    struct Client {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<str>>,
    }

    impl Client {
        fn id(&self) -> String {
            self.conn.id.clone()
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(serde_json::from_str(&msg).unwrap());
            }
            out
        }
    }

    fn connect(hub: &mut RelayHub, id: &str) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(id.into(), tx));
        hub.handle_guarded(HubCommand::Connect(Arc::clone(&conn)));
        Client { conn, rx }
    }

    fn send(hub: &mut RelayHub, client: &Client, frame: &str) {
        let event = parse_client_event(frame).expect("valid frame");
        hub.handle_guarded(HubCommand::Event {
            connection_id: client.id(),
            event,
        });
    }

    fn identify(hub: &mut RelayHub, client: &Client, user: &str) {
        send(hub, client, &format!(r#"{{"type":"identify","data":"{user}"}}"#));
    }

    fn disconnect(hub: &mut RelayHub, client: &Client) {
        hub.handle_guarded(HubCommand::Disconnect {
            connection_id: client.id(),
        });
    }

    fn of_type<'a>(msgs: &'a [Value], ty: &str) -> Vec<&'a Value> {
        msgs.iter().filter(|m| m["type"] == ty).collect()
    }

    #[test]
    fn identify_broadcasts_and_sends_snapshot() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        identify(&mut hub, &a, "alice");

        let msgs = a.drain();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["type"], "user_status");
        assert_eq!(msgs[0]["data"]["userId"], "alice");
        assert_eq!(msgs[0]["data"]["status"], "online");
        assert_eq!(msgs[1]["type"], "online_users");
        assert_eq!(msgs[1]["data"]["users"], serde_json::json!(["alice"]));
    }

    #[test]
    fn second_user_sees_both_in_snapshot() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        identify(&mut hub, &a, "alice");
        identify(&mut hub, &b, "bob");

        let b_msgs = b.drain();
        let snapshots = of_type(&b_msgs, "online_users");
        assert_eq!(snapshots.len(), 1);
        let mut users: Vec<&str> = snapshots[0]["data"]["users"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        users.sort_unstable();
        assert_eq!(users, vec!["alice", "bob"]);

        // A saw both online events but only its own snapshot
        let a_msgs = a.drain();
        assert_eq!(of_type(&a_msgs, "user_status").len(), 2);
        assert_eq!(of_type(&a_msgs, "online_users").len(), 1);
    }

    #[test]
    fn empty_identify_is_ignored() {
        let (mut hub, handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        identify(&mut hub, &a, "");
        assert!(a.drain().is_empty());
        assert!(hub.registry().is_empty());
        assert!(a.conn.user_id().is_none());
        assert_eq!(handle.stats().online_users, 0);
    }

    #[test]
    fn repeated_identify_keeps_one_entry_and_rebroadcasts() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        identify(&mut hub, &a, "alice");
        identify(&mut hub, &a, "alice");

        assert_eq!(hub.registry().len(), 1);
        let msgs = a.drain();
        assert_eq!(of_type(&msgs, "user_status").len(), 2);
        assert_eq!(of_type(&msgs, "online_users").len(), 2);
        assert!(of_type(&msgs, "user_status")
            .iter()
            .all(|m| m["data"]["status"] == "online"));
    }

    #[test]
    fn reidentify_replaces_previous_identity() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        identify(&mut hub, &a, "u1");
        let _ = b.drain();
        identify(&mut hub, &a, "u2");

        assert!(!hub.registry().is_online("u1"));
        assert_eq!(hub.registry().connection_for("u2"), Some("a"));
        assert_eq!(a.conn.user_id().as_deref(), Some("u2"));

        let msgs = b.drain();
        let statuses = of_type(&msgs, "user_status");
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0]["data"]["userId"], "u1");
        assert_eq!(statuses[0]["data"]["status"], "offline");
        assert_eq!(statuses[1]["data"]["userId"], "u2");
        assert_eq!(statuses[1]["data"]["status"], "online");
        let _ = a.drain();
    }

    #[test]
    fn message_relayed_to_everyone_including_sender() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        send(&mut hub, &a, r#"{"type":"send_message","data":{"text":"hi"}}"#);

        for client in [&mut a, &mut b] {
            let msgs = client.drain();
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "receive_message");
            assert_eq!(msgs[0]["data"], serde_json::json!({"text": "hi"}));
        }
    }

    #[test]
    fn anonymous_connection_can_send() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        send(&mut hub, &a, r#"{"type":"send_message","data":"plain"}"#);
        let msgs = a.drain();
        assert_eq!(msgs[0]["data"], "plain");
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn messages_keep_sender_order() {
        let (mut hub, _handle) = RelayHub::new();
        let a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        for i in 0..10 {
            send(&mut hub, &a, &format!(r#"{{"type":"send_message","data":{{"n":{i}}}}}"#));
        }
        let msgs = b.drain();
        let seq: Vec<i64> = msgs.iter().map(|m| m["data"]["n"].as_i64().unwrap()).collect();
        assert_eq!(seq, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn disconnect_of_identified_connection_broadcasts_offline() {
        let (mut hub, _handle) = RelayHub::new();
        let a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        identify(&mut hub, &a, "alice");
        let _ = b.drain();

        disconnect(&mut hub, &a);

        assert!(!hub.registry().is_online("alice"));
        let msgs = b.drain();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "user_status");
        assert_eq!(msgs[0]["data"]["userId"], "alice");
        assert_eq!(msgs[0]["data"]["status"], "offline");

        // A later joiner no longer sees alice
        let mut c = connect(&mut hub, "c");
        identify(&mut hub, &c, "carol");
        let snapshot = of_type(&c.drain(), "online_users")[0].clone();
        assert_eq!(snapshot["data"]["users"], serde_json::json!(["carol"]));
    }

    #[test]
    fn disconnect_of_anonymous_connection_is_silent() {
        let (mut hub, handle) = RelayHub::new();
        let a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        assert_eq!(handle.stats().connections, 2);
        disconnect(&mut hub, &a);
        assert!(b.drain().is_empty());
        assert_eq!(handle.stats().connections, 1);
    }

    #[test]
    fn superseded_connection_disconnect_keeps_user_online() {
        let (mut hub, _handle) = RelayHub::new();
        let a = connect(&mut hub, "a");
        let mut b = connect(&mut hub, "b");
        let mut observer = connect(&mut hub, "o");
        identify(&mut hub, &a, "alice");
        identify(&mut hub, &b, "alice");
        let _ = b.drain();
        let _ = observer.drain();

        disconnect(&mut hub, &a);

        assert_eq!(hub.registry().connection_for("alice"), Some("b"));
        assert!(observer.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn events_from_unknown_connection_are_ignored() {
        let (mut hub, _handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        hub.handle_guarded(HubCommand::Event {
            connection_id: "ghost".into(),
            event: ClientEvent::Identify {
                user_id: "mallory".into(),
            },
        });
        hub.handle_guarded(HubCommand::Disconnect {
            connection_id: "ghost".into(),
        });
        assert!(hub.registry().is_empty());
        assert!(a.drain().is_empty());
    }

    #[test]
    fn stats_track_connections_and_users() {
        let (mut hub, handle) = RelayHub::new();
        assert_eq!(handle.stats(), HubStats::default());
        let a = connect(&mut hub, "a");
        identify(&mut hub, &a, "alice");
        assert_eq!(
            handle.stats(),
            HubStats {
                connections: 1,
                online_users: 1
            }
        );
        disconnect(&mut hub, &a);
        assert_eq!(handle.stats(), HubStats::default());
    }

    #[tokio::test]
    async fn run_loop_processes_commands_in_order() {
        let (hub, handle) = RelayHub::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.run(cancel.clone()));

        let (tx, mut rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new("a".into(), tx));
        assert!(handle.connect(conn).await);
        assert!(
            handle
                .dispatch("a", ClientEvent::Identify { user_id: "alice".into() })
                .await
        );

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "user_status");
        assert_eq!(second["type"], "online_users");

        assert!(handle.disconnect("a").await);
        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn panicking_command_is_contained() {
        let (mut hub, handle) = RelayHub::new();
        let mut a = connect(&mut hub, "a");
        identify(&mut hub, &a, "alice");
        let _ = a.drain();

        let (tx, _rx) = mpsc::channel(8);
        hub.handle_guarded(HubCommand::Panic(Arc::new(ClientConnection::new("p".into(), tx))));

        // Stats were still published for the partial mutation
        assert_eq!(
            handle.stats(),
            HubStats {
                connections: 2,
                online_users: 1
            }
        );

        let b = connect(&mut hub, "b");
        identify(&mut hub, &b, "bob");
        let msgs = a.drain();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["data"]["userId"], "bob");
        assert!(hub.registry().is_online("bob"));
    }

    #[tokio::test]
    async fn run_loop_survives_panicking_command() {
        let (hub, handle) = RelayHub::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.run(cancel.clone()));

        let (ptx, _prx) = mpsc::channel(8);
        let doomed = Arc::new(ClientConnection::new("p".into(), ptx));
        assert!(handle.tx.send(HubCommand::Panic(doomed)).await.is_ok());

        let (tx, mut rx) = mpsc::channel(16);
        assert!(handle.connect(Arc::new(ClientConnection::new("a".into(), tx))).await);
        assert!(
            handle
                .dispatch("a", ClientEvent::Identify { user_id: "alice".into() })
                .await
        );
        let status: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(status["data"]["userId"], "alice");
        assert_eq!(handle.stats().online_users, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_stops_when_handles_dropped() {
        let (hub, handle) = RelayHub::new();
        let task = tokio::spawn(hub.run(CancellationToken::new()));
        drop(handle);
        task.await.unwrap();
    }
}
