//! WebSocket connection management, heartbeat and broadcasting.

pub mod connection;
pub mod heartbeat;
pub mod hub;
pub mod registry;
pub mod slots;
pub mod socket;

pub use connection::{ClientConnection, Liveness};
pub use hub::{BroadcastHub, RelayReport, CONNECTED_MESSAGE};
pub use registry::ConnectionRegistry;
pub use slots::{ConnectionSlots, SlotGuard};
pub use socket::{handle_socket, SocketSettings};
