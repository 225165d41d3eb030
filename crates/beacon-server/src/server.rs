//! Axum host for the broadcast hub: WebSocket upgrade, health and data routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use beacon_store::Database;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{handle_socket, BroadcastHub, ConnectionSlots, SocketSettings};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub db: Database,
    pub config: Arc<ServerConfig>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub slots: ConnectionSlots,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Self {
        Self {
            hub: Arc::new(BroadcastHub::new()),
            db,
            slots: ConnectionSlots::new(config.max_connections),
            config: Arc::new(config),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    fn socket_settings(&self) -> SocketSettings {
        SocketSettings {
            send_queue: self.config.send_queue,
            heartbeat_interval: Duration::from_secs(self.config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.config.heartbeat_timeout_secs),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve in the background.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, db);
    let router = build_router(state.clone());

    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        environment = %state.config.environment,
        database = %state.db.path().display(),
        "beacon server started"
    );

    let token = state.shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        state,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.state.hub
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Close every socket, stop accepting, and wait for the listener task.
    pub async fn shutdown(self) {
        info!(connections = self.state.hub.connection_count(), "shutting down");
        self.state.hub.close_all();
        self.state
            .shutdown
            .graceful_shutdown(vec![self.server], None)
            .await;
    }
}

/// GET /ws, /api/ws
///
/// A slot is reserved before upgrading and released when the socket task
/// ends, so `max_connections` is a hard limit under concurrent upgrades.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "server is shutting down" })),
        )
            .into_response();
    }
    let Some(slot) = state.slots.try_acquire() else {
        warn!(max = state.slots.max(), "connection limit reached, refusing upgrade");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "too many connections" })),
        )
            .into_response();
    };

    let hub = state.hub.clone();
    let settings = state.socket_settings();
    let token = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            handle_socket(socket, hub, settings, token).await;
        })
}

/// GET /health, /api/v1/health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.config.environment,
        &state.config.name,
        state.hub.connection_count(),
    ))
}
