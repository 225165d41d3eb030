//! The socket seam under the connection manager.
//!
//! A [`Connector`] opens a [`TransportLink`]: a pair of channels, one for
//! frames going out and one for events coming in. [`WsConnector`] backs it
//! with `tokio-tungstenite`; tests substitute their own.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// A frame or command for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

impl Outgoing {
    pub fn close_normal(reason: impl Into<String>) -> Self {
        Self::Close {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        }
    }
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    /// Always the last event. `clean` means a close handshake was received.
    Closed {
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
}

/// An open connection.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(ws_pump(ws, out_rx, in_tx)));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_pump(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut close_frame: Option<(u16, String)> = None;
    let mut outbound_open = true;

    let clean = loop {
        tokio::select! {
            out = out_rx.recv(), if outbound_open => {
                let msg = match out {
                    Some(Outgoing::Text(text)) => Message::text(text),
                    Some(Outgoing::Close { code, reason }) => {
                        outbound_open = false;
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                    }
                    None => {
                        outbound_open = false;
                        Message::Close(None)
                    }
                };
                if let Err(e) = ws_tx.send(msg).await {
                    debug!(error = %e, "websocket send failed");
                    if close_frame.is_some() {
                        break true;
                    }
                    let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                    break false;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = in_tx.send(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        trace!(?frame, "close frame received");
                        close_frame = Some(
                            frame.map_or((CLOSE_NORMAL, String::new()), |f| {
                                (u16::from(f.code), f.reason.as_str().to_owned())
                            }),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // Teardown after a close frame is not an error.
                        if close_frame.is_some() {
                            trace!(error = %e, "error after close frame");
                            break true;
                        }
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        break false;
                    }
                    None => break close_frame.is_some(),
                }
            }
        }
    };

    let (code, reason) = match close_frame {
        Some((code, reason)) => (Some(code), reason),
        None => (None, String::new()),
    };
    let _ = in_tx.send(TransportEvent::Closed {
        clean,
        code,
        reason,
    });
}
