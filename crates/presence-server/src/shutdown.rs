//! Shutdown signalling for the relay.
//!
//! One `CancellationToken` fans out to the HTTP server, the presence hub and
//! every WebSocket session. Sessions close their sockets when it fires, the
//! hub stops consuming commands, and the serve task returned by
//! [`RelayServer::listen`](crate::server::RelayServer::listen) resolves once
//! both are done.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`ShutdownCoordinator::drain`] waits when no timeout is given.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the relay-wide cancellation token.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator with a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to the hub and to each session.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal every holder of the token.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown and wait for the serve task (and anything else passed
    /// in) to finish.
    ///
    /// Returns `false` if the wait hit `timeout` (default 10s). Tasks that
    /// panicked are logged and counted as finished.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(tasks = tasks.len(), ?timeout, "draining relay tasks");

        let Ok(results) = tokio::time::timeout(timeout, join_all(tasks)).await else {
            warn!(?timeout, "drain timed out, exiting with tasks still running");
            return false;
        };
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "relay tasks ended abnormally during drain");
        }
        true
    }
}
