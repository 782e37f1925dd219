//! # presence-relay
//!
//! Presence relay server binary. Loads configuration, installs logging and
//! metrics, then serves until interrupted.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use presence_server::config::ServerConfig;
use presence_server::logging::{self, LogFormat};
use presence_server::server::RelayServer;

/// Presence relay server.
#[derive(Parser, Debug)]
#[command(name = "presence-relay", about = "WebSocket presence tracking and chat relay")]
struct Cli {
    /// Host to bind (overrides `RELAY_HOST`).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides `PORT`).
    #[arg(long)]
    port: Option<u16>,

    /// Allowed browser origin, or `*` (overrides `CLIENT_URL`).
    #[arg(long)]
    client_origin: Option<String>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: `text` or `json`.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        self.apply_to(&mut config);
        config
    }

    fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(ref host) = self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref origin) = self.client_origin {
            config.client_origin.clone_from(origin);
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    logging::init_subscriber(&args.log_level, args.log_format)
        .context("Failed to initialize logging")?;

    let metrics = match presence_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let config = args.server_config();
    let server = RelayServer::new(config, metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!("Presence relay listening on http://{addr}");

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    if server.shutdown().drain(vec![handle], None).await {
        tracing::info!("Shutdown complete");
    }
    Ok(())
}
