//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::health::{self, HealthResponse, RUNNING_MESSAGE};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::new_connection_id;
use crate::websocket::hub::{HubHandle, RelayHub};
use crate::websocket::session::{SessionSettings, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sender side of the presence hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// One permit per admitted socket, held until its session ends.
    pub connection_slots: Arc<Semaphore>,
}

/// The presence relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    hub: HubHandle,
    /// Taken by [`RelayServer::listen`], which spawns it.
    pending_hub: Mutex<Option<RelayHub>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
    connection_slots: Arc<Semaphore>,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let (hub, handle) = RelayHub::new();
        let slots = config.max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            connection_slots: Arc::new(Semaphore::new(slots)),
            config: Arc::new(config),
            hub: handle,
            pending_hub: Mutex::new(Some(hub)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Result<Router> {
        let state = AppState {
            hub: self.hub.clone(),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            connection_slots: Arc::clone(&self.connection_slots),
        };

        Ok(Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(cors_layer(&self.config)?)
            .layer(TraceLayer::new_for_http()))
    }

    /// Bind the listener, start the hub, and serve until shutdown.
    ///
    /// Returns the bound address and a handle that completes once both the
    /// HTTP server and the hub have stopped.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let router = self.router()?;
        let bind_addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let hub_task = self
            .pending_hub
            .lock()
            .take()
            .map(|hub| tokio::spawn(hub.run(self.shutdown.token())));

        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "http server stopped with error");
            }
            if let Some(hub_task) = hub_task {
                let _ = hub_task.await;
            }
        });

        info!(addr = %local_addr, origin = %self.config.client_origin, "presence relay listening");
        Ok((local_addr, handle))
    }

    /// Get the hub handle.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sockets that can still be admitted before upgrades get 503.
    pub fn available_slots(&self) -> usize {
        self.connection_slots.available_permits()
    }
}

fn cors_layer(config: &ServerConfig) -> Result<CorsLayer> {
    let origin = if config.allows_any_origin() {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(config.client_origin.trim_end_matches('/'))
            .map_err(|_| ServerError::InvalidOrigin(config.client_origin.clone()))?;
        AllowOrigin::exact(value)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST]))
}

/// GET /
async fn root_handler() -> &'static str {
    RUNNING_MESSAGE
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.hub.stats()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws (WebSocket upgrade)
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        counter!(WS_REJECTED_TOTAL, "reason" => "origin").increment(1);
        warn!(origin = origin.unwrap_or_default(), "rejected upgrade from disallowed origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let Ok(permit) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        warn!(max = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let connection_id = new_connection_id();
    let settings = SessionSettings::from(state.config.as_ref());
    let hub = state.hub.clone();
    let cancel = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = run_ws_session(socket, connection_id, hub, settings, cancel).await;
            drop(permit);
        })
}
