//! Server-side state for one connected peer.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Liveness of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A connected WebSocket peer as seen by the registry and hub.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Outbound frames, drained by the socket's writer task.
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    liveness: AtomicU8,
    /// Set on every pong or inbound frame, cleared by the heartbeat check.
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    /// Cancelled to make the socket task close this connection.
    close: CancellationToken,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_close_token(id, tx, CancellationToken::new())
    }

    /// Use `close` as the connection's close signal, typically a child of the
    /// server shutdown token.
    pub fn with_close_token(
        id: ConnectionId,
        tx: mpsc::Sender<Arc<String>>,
        close: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            liveness: AtomicU8::new(Liveness::Open as u8),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            close,
        }
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Enqueue a text frame without waiting.
    ///
    /// Returns `false` when the connection is not `Open` or its queue is full
    /// or closed. Queue failures increment the drop counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the socket task to close. The registry entry is removed when the
    /// task finishes.
    pub fn close(&self) {
        let _ = self.liveness.compare_exchange(
            Liveness::Open as u8,
            Liveness::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.close.cancel();
    }

    pub fn mark_closed(&self) {
        self.liveness.store(Liveness::Closed as u8, Ordering::Release);
        self.close.cancel();
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Read and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
