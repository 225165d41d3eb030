//! `/health` endpoint body.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub environment: String,
    pub name: String,
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
}

pub fn health_check(
    start_time: Instant,
    environment: &str,
    name: &str,
    connections: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        environment: environment.to_string(),
        name: name.to_string(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}
