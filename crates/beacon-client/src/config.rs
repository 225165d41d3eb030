//! Client connection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Automatic reconnects allowed after an unexpected close.
    pub max_reconnect_attempts: u32,
    /// Delay before each automatic reconnect, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Decoded messages kept for `history()`.
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".into(),
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 3000,
            history_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
