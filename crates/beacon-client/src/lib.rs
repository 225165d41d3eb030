//! # beacon-client
//!
//! Reconnecting client for the Beacon broadcast hub.
//!
//! - [`ConnectionManager`]: status machine, bounded automatic reconnects,
//!   typed `send`, per-kind subscriptions and a bounded message history
//! - [`Connector`]: the transport seam, backed by `tokio-tungstenite`

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod history;
pub mod manager;
pub mod subscribers;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use history::MessageHistory;
pub use manager::{ConnectionManager, ConnectionStatus, MANUAL_DISCONNECT};
pub use subscribers::{Callback, Subscription};
pub use transport::{Connector, Outgoing, TransportEvent, TransportLink, WsConnector};
