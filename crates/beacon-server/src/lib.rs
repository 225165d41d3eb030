//! # beacon-server
//!
//! Axum host for the Beacon broadcast hub.
//!
//! - `WebSocket` gateway on `/ws` and `/api/ws`: registry, fan-out, heartbeat
//! - HTTP ingest for time-series and sensor data, broadcast after each create
//! - Health check, layered config loading, graceful shutdown

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{load_config, ConfigError, ServerConfig};
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use websocket::{BroadcastHub, ClientConnection, ConnectionRegistry, RelayReport};
