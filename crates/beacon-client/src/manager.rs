//! Client-side owner of one logical connection: status, reconnects,
//! typed send and subscriptions.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open ok--> Connected
//!      ^                          |                     |  \
//!      |                  open failed            close  |   error event
//!      +-----------<--------------+----------<----------+    -> Error
//!   unexpected close schedules a reconnect while attempts remain
//! ```

use std::fmt;
use std::sync::Arc;

use beacon_core::{
    now_millis, Envelope, MessageId, MessageKind, Payload, RawEnvelope,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::history::MessageHistory;
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::transport::{Connector, Outgoing, TransportEvent, TransportLink, WsConnector};

/// Close reason sent by [`ConnectionManager::disconnect`].
pub const MANUAL_DISCONNECT: &str = "Manual disconnect";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

struct State {
    status: ConnectionStatus,
    last_error: Option<String>,
    reconnect_attempt: u32,
    /// Bumped by every connect attempt and by `disconnect()`. Work started
    /// under an older generation is discarded.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outgoing>>,
    /// Pending reconnect timer.
    reconnect: Option<CancellationToken>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    status_tx: watch::Sender<ConnectionStatus>,
    subscribers: Arc<SubscriberRegistry>,
    history: Mutex<MessageHistory>,
}

/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager using a real WebSocket transport.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let history = MessageHistory::new(config.history_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    last_error: None,
                    reconnect_attempt: 0,
                    generation: 0,
                    outbound: None,
                    reconnect: None,
                }),
                status_tx,
                subscribers: Arc::new(SubscriberRegistry::new()),
                history: Mutex::new(history),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// Automatic reconnects used since the last successful open or manual
    /// `connect()`.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.state.lock().reconnect_attempt
    }

    /// Open the connection. No-op while connecting or connected.
    ///
    /// Resets the reconnect counter, clears the last error and cancels any
    /// pending reconnect. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let mut st = self.inner.state.lock();
            st.last_error = Some("connect() called outside a Tokio runtime".into());
            self.inner.set_status(&mut st, ConnectionStatus::Error);
            warn!("connect() called outside a Tokio runtime");
            return;
        };

        let generation = {
            let mut st = self.inner.state.lock();
            if matches!(
                st.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) {
                debug!(status = %st.status, "connect ignored");
                return;
            }
            if let Some(timer) = st.reconnect.take() {
                timer.cancel();
            }
            if let Some(outbound) = st.outbound.take() {
                let _ = outbound.send(Outgoing::close_normal(MANUAL_DISCONNECT));
            }
            st.reconnect_attempt = 0;
            st.last_error = None;
            self.inner.begin_attempt(&mut st)
        };

        drop(runtime.spawn(self.inner.clone().run(generation)));
    }

    /// Close with code 1000 and cancel any pending reconnect. No automatic
    /// reconnect follows.
    pub fn disconnect(&self) {
        let mut st = self.inner.state.lock();
        if let Some(timer) = st.reconnect.take() {
            timer.cancel();
        }
        st.generation += 1;
        if let Some(outbound) = st.outbound.take() {
            let _ = outbound.send(Outgoing::close_normal(MANUAL_DISCONNECT));
        }
        if st.status != ConnectionStatus::Disconnected {
            info!(url = %self.inner.config.url, "disconnected");
        }
        self.inner.set_status(&mut st, ConnectionStatus::Disconnected);
    }

    /// Send a typed payload with a fresh timestamp and `client_` id.
    ///
    /// Returns `false` (and logs) when not connected.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        let envelope = Envelope::new(payload).with_id(MessageId::client());
        let kind = envelope.type_tag().to_string();
        let result = envelope
            .encode()
            .map_err(ClientError::from)
            .and_then(|frame| self.write(frame));
        match result {
            Ok(()) => {
                debug!(kind = %kind, "message sent");
                true
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "message not sent");
                false
            }
        }
    }

    /// Send an envelope built from a wire tag and untyped data.
    ///
    /// Data for a known kind must match its payload shape; unknown kinds pass
    /// through as-is.
    pub fn send_raw(&self, kind: &str, data: Value) -> Result<(), ClientError> {
        let envelope = Envelope::from_raw(RawEnvelope {
            kind: kind.to_string(),
            data,
            timestamp: now_millis(),
            id: Some(MessageId::client().to_string()),
        })?;
        self.write(envelope.encode()?)
    }

    fn write(&self, frame: String) -> Result<(), ClientError> {
        let st = self.inner.state.lock();
        match (&st.status, &st.outbound) {
            (ConnectionStatus::Connected, Some(outbound)) => outbound
                .send(Outgoing::Text(frame))
                .map_err(|_| ClientError::Transport(TransportError::Closed)),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Call `callback` for every decoded envelope of `kind`.
    pub fn subscribe<F>(&self, kind: MessageKind, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Subscription::register(&self.inner.subscribers, Some(kind), Arc::new(callback))
    }

    /// Call `callback` for every decoded envelope, unknown kinds included.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Subscription::register(&self.inner.subscribers, None, Arc::new(callback))
    }

    pub fn last_message(&self) -> Option<Envelope> {
        self.inner.history.lock().last().cloned()
    }

    pub fn last_message_of(&self, kind: MessageKind) -> Option<Envelope> {
        self.inner.history.lock().last_of(kind).cloned()
    }

    /// Newest first.
    pub fn history(&self) -> Vec<Envelope> {
        self.inner.history.lock().to_vec()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("status", &st.status)
            .field("reconnect_attempt", &st.reconnect_attempt)
            .finish()
    }
}

impl Inner {
    fn set_status(&self, st: &mut State, status: ConnectionStatus) {
        if st.status != status {
            debug!(from = %st.status, to = %status, "status changed");
        }
        st.status = status;
        let _ = self.status_tx.send_replace(status);
    }

    fn begin_attempt(&self, st: &mut State) -> u64 {
        st.generation += 1;
        self.set_status(st, ConnectionStatus::Connecting);
        st.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// One connect call and its reconnects. Ends on a clean close, when
    /// attempts run out, or when superseded.
    async fn run(self: Arc<Self>, mut generation: u64) {
        loop {
            let (clean, error) = self.attempt(generation).await;
            let Some(timer) = self.on_closed(generation, clean, error) else {
                return;
            };

            tokio::select! {
                () = timer.cancelled() => return,
                () = tokio::time::sleep(self.config.reconnect_interval()) => {}
            }

            let Some(next) = self.claim_reconnect(&timer) else {
                return;
            };
            generation = next;
        }
    }

    /// Open a transport and pump its events until it closes.
    /// Returns `(clean, error)`.
    async fn attempt(&self, generation: u64) -> (bool, Option<String>) {
        let TransportLink {
            outbound,
            mut inbound,
        } = match self.connector.connect(&self.config.url).await {
            Ok(link) => link,
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "connect failed");
                return (false, Some(e.to_string()));
            }
        };

        {
            let mut st = self.state.lock();
            if st.generation != generation {
                debug!("connection superseded before open completed");
                let _ = outbound.send(Outgoing::close_normal(MANUAL_DISCONNECT));
                return (true, None);
            }
            st.outbound = Some(outbound);
            st.reconnect_attempt = 0;
            self.set_status(&mut st, ConnectionStatus::Connected);
        }
        info!(url = %self.config.url, "connected");

        while let Some(event) = inbound.recv().await {
            if !self.is_current(generation) {
                return (true, None);
            }
            match event {
                TransportEvent::Message(text) => self.on_frame(&text),
                TransportEvent::Error(error) => self.on_transport_error(generation, error),
                TransportEvent::Closed {
                    clean,
                    code,
                    reason,
                } => {
                    info!(clean, code = ?code, reason = %reason, "connection closed");
                    return (clean, None);
                }
            }
        }
        (false, None)
    }

    fn on_frame(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => {
                self.history.lock().push(envelope.clone());
                let observers = self.subscribers.dispatch(&envelope);
                debug!(kind = envelope.type_tag(), observers, "message received");
            }
            Err(e) => warn!(error = %e, kind = e.error_kind(), "dropping undecodable frame"),
        }
    }

    fn on_transport_error(&self, generation: u64, error: String) {
        let mut st = self.state.lock();
        if st.generation != generation {
            return;
        }
        warn!(url = %self.config.url, error = %error, "transport error");
        st.last_error = Some(error);
        self.set_status(&mut st, ConnectionStatus::Error);
    }

    /// Record a close. Returns the timer for a scheduled reconnect.
    fn on_closed(
        &self,
        generation: u64,
        clean: bool,
        error: Option<String>,
    ) -> Option<CancellationToken> {
        let mut st = self.state.lock();
        if st.generation != generation {
            return None;
        }
        st.outbound = None;
        if let Some(error) = error {
            st.last_error = Some(error);
        }
        self.set_status(&mut st, ConnectionStatus::Disconnected);
        if clean {
            return None;
        }

        let max = self.config.max_reconnect_attempts;
        if st.reconnect_attempt >= max {
            warn!(attempts = max, url = %self.config.url, "reconnect attempts exhausted");
            st.last_error = Some(format!("reconnect failed after {max} attempts"));
            return None;
        }

        st.reconnect_attempt += 1;
        let timer = CancellationToken::new();
        st.reconnect = Some(timer.clone());
        info!(
            attempt = st.reconnect_attempt,
            max,
            delay_ms = self.config.reconnect_interval_ms,
            "scheduling reconnect"
        );
        Some(timer)
    }

    /// Start the scheduled attempt unless the timer was cancelled meanwhile.
    fn claim_reconnect(&self, timer: &CancellationToken) -> Option<u64> {
        let mut st = self.state.lock();
        if timer.is_cancelled() || st.status != ConnectionStatus::Disconnected {
            return None;
        }
        st.reconnect = None;
        Some(self.begin_attempt(&mut st))
    }
}
