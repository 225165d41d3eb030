//! Per-socket lifecycle: reader, writer and heartbeat tasks around one
//! upgraded WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use beacon_core::ConnectionId;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::ClientConnection;
use super::heartbeat::{run_heartbeat, HeartbeatResult};
use super::hub::BroadcastHub;

/// Per-socket settings taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct SocketSettings {
    pub send_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Drive one upgraded socket until it closes, then unregister it.
///
/// `shutdown` is the server-wide token; the connection gets a child of it.
pub async fn handle_socket(
    socket: WebSocket,
    hub: Arc<BroadcastHub>,
    settings: SocketSettings,
    shutdown: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(settings.send_queue.max(1));
    let connection = Arc::new(ClientConnection::with_close_token(
        ConnectionId::new(),
        tx,
        shutdown.child_token(),
    ));
    let conn_id = connection.id.clone();
    let close = connection.close_token();

    hub.on_connect(connection.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: outbound queue and pings to the socket.
    let writer_close = close.clone();
    let writer_id = conn_id.clone();
    let ping_every = settings.heartbeat_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(WsMessage::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    trace!(conn_id = %writer_id, "sent ping");
                }
                () = writer_close.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: socket to hub.
    let reader_hub = hub.clone();
    let reader_conn = connection.clone();
    let mut reader = tokio::spawn(async move {
        let id = &reader_conn.id;
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    reader_conn.mark_alive();
                    let _ = reader_hub.on_message(id, text.as_str());
                }
                Ok(WsMessage::Pong(_) | WsMessage::Ping(_)) => reader_conn.mark_alive(),
                Ok(WsMessage::Binary(_)) => {
                    reader_conn.mark_alive();
                    debug!(conn_id = %id, "ignoring binary frame");
                }
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    reader_hub.on_error(id, &e);
                    break;
                }
            }
        }
    });

    let heartbeat_conn = connection.clone();
    let heartbeat = tokio::spawn(run_heartbeat(
        connection.clone(),
        settings.heartbeat_interval,
        settings.heartbeat_timeout,
        close.clone(),
    ));
    let heartbeat_watch = tokio::spawn(async move {
        if let Ok(HeartbeatResult::TimedOut) = heartbeat.await {
            warn!(conn_id = %heartbeat_conn.id, "heartbeat timed out, closing connection");
            heartbeat_conn.close();
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            close.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), &mut writer).await;
            writer.abort();
        }
    }

    hub.on_disconnect(&conn_id);
    close.cancel();
    let _ = heartbeat_watch.await;
}
