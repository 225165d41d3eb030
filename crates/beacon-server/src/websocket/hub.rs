//! Fan-out of envelopes to connected peers.

use std::fmt;
use std::sync::Arc;

use beacon_core::{
    frame_type, ConnectionId, Envelope, EnvelopeError, NotificationLevel, SystemNotification,
};
use tracing::{debug, info, warn};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;

/// Message sent to each peer right after it connects.
pub const CONNECTED_MESSAGE: &str = "Connected to Beacon broadcast hub";

/// Outcome of relaying one inbound frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    /// Peers that were not writable for this frame.
    pub skipped: usize,
}

/// Owns the connection registry and applies the broadcast policy.
///
/// Delivery is best-effort: a peer whose outbound queue is full misses the
/// frame, and nothing is retried.
pub struct BroadcastHub {
    registry: ConnectionRegistry,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Greet a new peer, then register it.
    ///
    /// The greeting is queued before registration so it is always the first
    /// frame the peer receives.
    pub fn on_connect(&self, connection: Arc<ClientConnection>) {
        match Envelope::new(SystemNotification::info(CONNECTED_MESSAGE)).encode() {
            Ok(frame) => {
                if !connection.send(Arc::new(frame)) {
                    warn!(conn_id = %connection.id, "failed to queue connect notification");
                }
            }
            Err(e) => warn!(conn_id = %connection.id, error = %e, "failed to encode connect notification"),
        }
        self.registry.add(connection.clone());
        info!(conn_id = %connection.id, connections = self.registry.len(), "client connected");
    }

    /// Relay an inbound frame verbatim to every other writable peer.
    ///
    /// Frames that are not a JSON object with a string `type` are dropped and
    /// reported as [`EnvelopeError::MalformedFrame`]. Nothing else in the
    /// frame is checked.
    pub fn on_message(&self, from: &ConnectionId, raw: &str) -> Result<RelayReport, EnvelopeError> {
        let kind = match frame_type(raw) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(conn_id = %from, error = %e, "dropping malformed frame");
                return Err(e);
            }
        };

        let frame = Arc::new(raw.to_owned());
        let report = self.fan_out(Some(from), &frame);
        debug!(
            conn_id = %from,
            kind = %kind,
            delivered = report.delivered,
            skipped = report.skipped,
            "relayed frame"
        );
        Ok(report)
    }

    /// Mark a peer closed and forget it.
    pub fn on_disconnect(&self, id: &ConnectionId) {
        if let Some(conn) = self.registry.get(id) {
            conn.mark_closed();
        }
        if self.registry.remove(id) {
            info!(conn_id = %id, connections = self.registry.len(), "client disconnected");
        }
    }

    /// Record a transport error. Removal is left to the close path.
    pub fn on_error(&self, id: &ConnectionId, error: &dyn fmt::Display) {
        warn!(conn_id = %id, error = %error, "connection error");
    }

    /// Send a server-originated envelope to every peer. Returns the number
    /// of peers it was queued for.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(kind = envelope.type_tag(), error = %e, "failed to encode broadcast");
                return 0;
            }
        };
        let report = self.fan_out(None, &frame);
        debug!(
            kind = envelope.type_tag(),
            recipients = report.delivered,
            skipped = report.skipped,
            "broadcast envelope"
        );
        report.delivered
    }

    /// Send an envelope to one peer. `false` if it is unknown or not writable.
    pub fn send_to(&self, id: &ConnectionId, envelope: &Envelope) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        match envelope.encode() {
            Ok(frame) => conn.send(Arc::new(frame)),
            Err(e) => {
                warn!(conn_id = %id, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    /// Broadcast a `system_notification`.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) -> usize {
        self.broadcast(&Envelope::new(SystemNotification::new(level, message)))
    }

    /// Ask every socket task to close.
    pub fn close_all(&self) {
        self.registry.for_each(None, |conn| conn.close());
    }

    fn fan_out(&self, excluding: Option<&ConnectionId>, frame: &Arc<String>) -> RelayReport {
        let mut report = RelayReport::default();
        self.registry.for_each(excluding, |conn| {
            if conn.send(frame.clone()) {
                report.delivered += 1;
            } else {
                report.skipped += 1;
                debug!(conn_id = %conn.id, dropped = conn.drop_count(), "peer not writable, skipped");
            }
        });
        report
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{MessageKind, Payload, SensorUpdate};
    use tokio::sync::mpsc;

    struct Peer {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Peer {
        fn id(&self) -> &ConnectionId {
            &self.conn.id
        }

        fn drain(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push((*frame).clone());
            }
            out
        }
    }

    fn connect(hub: &BroadcastHub, capacity: usize) -> Peer {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        hub.on_connect(conn.clone());
        Peer { conn, rx }
    }

    fn connect_quiet(hub: &BroadcastHub) -> Peer {
        let mut peer = connect(hub, 16);
        let _ = peer.drain();
        peer
    }

    const SENSOR_FRAME: &str =
        r#"{"type":"sensor_update","data":{"sensorId":"s1","temperature":21.5},"timestamp":1700000000000}"#;

    #[test]
    fn connect_sends_one_notification_first() {
        let hub = BroadcastHub::new();
        let mut peer = connect(&hub, 16);
        let frames = peer.drain();
        assert_eq!(frames.len(), 1);

        let envelope = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(envelope.kind(), Some(MessageKind::SystemNotification));
        match envelope.payload {
            Payload::SystemNotification(n) => {
                assert_eq!(n.level, NotificationLevel::Info);
                assert_eq!(n.message, CONNECTED_MESSAGE);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(envelope.timestamp > 0);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn relay_reaches_everyone_but_sender_verbatim() {
        let hub = BroadcastHub::new();
        let mut a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        let mut c = connect_quiet(&hub);

        let report = hub.on_message(a.id(), SENSOR_FRAME).unwrap();
        assert_eq!(report, RelayReport { delivered: 2, skipped: 0 });

        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![SENSOR_FRAME.to_string()]);
        assert_eq!(c.drain(), vec![SENSOR_FRAME.to_string()]);
    }

    #[test]
    fn unknown_kind_is_relayed() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        let frame = r#"{"type":"chat_message","data":{"text":"hi"}}"#;
        let report = hub.on_message(a.id(), frame).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(b.drain(), vec![frame.to_string()]);
    }

    #[test]
    fn known_kind_with_odd_payload_is_still_relayed() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        let frame = r#"{"type":"sensor_update","data":{"unexpected":true}}"#;
        assert_eq!(hub.on_message(a.id(), frame).unwrap().delivered, 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn envelope_fields_beyond_type_are_not_checked() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        let frames = [
            r#"{"type":"sensor_update","data":{"sensorId":"s1"},"timestamp":1700000000000,"id":42}"#,
            r#"{"type":"sensor_update","data":{"sensorId":"s1"},"timestamp":null}"#,
            r#"{"type":"user_status","timestamp":1700000000000.5}"#,
            r#"{"type":"custom","timestamp":"2024-01-01T00:00:00Z","id":{"n":1}}"#,
        ];
        for frame in frames {
            assert_eq!(hub.on_message(a.id(), frame).unwrap().delivered, 1, "{frame}");
        }
        assert_eq!(b.drain(), frames.map(String::from).to_vec());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);

        for frame in ["not json", "[1,2]", r#"{"data":{}}"#, r#"{"type":5}"#, ""] {
            let err = hub.on_message(a.id(), frame).unwrap_err();
            assert!(matches!(err, EnvelopeError::MalformedFrame(_)), "{frame:?}");
        }
        assert!(b.drain().is_empty());
        assert!(hub.registry().contains(a.id()));
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn full_queue_peer_is_skipped_for_that_frame_only() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        // Capacity 1 is taken by the connect notification.
        let mut slow = connect(&hub, 1);
        let mut fast = connect_quiet(&hub);

        let report = hub.on_message(a.id(), SENSOR_FRAME).unwrap();
        assert_eq!(report, RelayReport { delivered: 1, skipped: 1 });
        assert_eq!(slow.conn.drop_count(), 1);
        assert_eq!(fast.drain().len(), 1);

        assert_eq!(slow.drain().len(), 1);
        let report = hub.on_message(a.id(), SENSOR_FRAME).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(slow.drain(), vec![SENSOR_FRAME.to_string()]);
    }

    #[test]
    fn closing_peer_is_not_writable() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        b.conn.close();
        let report = hub.on_message(a.id(), SENSOR_FRAME).unwrap();
        assert_eq!(report, RelayReport { delivered: 0, skipped: 1 });
        assert!(b.drain().is_empty());
    }

    #[test]
    fn disconnect_removes_and_stops_delivery() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);

        hub.on_disconnect(b.id());
        hub.on_disconnect(b.id());
        assert_eq!(hub.connection_count(), 1);
        assert!(b.conn.close_token().is_cancelled());

        let report = hub.on_message(a.id(), SENSOR_FRAME).unwrap();
        assert_eq!(report.delivered, 0);
        assert!(b.drain().is_empty());
    }

    #[test]
    fn error_does_not_remove() {
        let hub = BroadcastHub::new();
        let a = connect_quiet(&hub);
        hub.on_error(a.id(), &"connection reset");
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn broadcast_includes_everyone() {
        let hub = BroadcastHub::new();
        let mut peers: Vec<Peer> = (0..3).map(|_| connect_quiet(&hub)).collect();
        let envelope = Envelope::new(SensorUpdate {
            sensor_id: "s9".into(),
            ..Default::default()
        });
        assert_eq!(hub.broadcast(&envelope), 3);
        for peer in &mut peers {
            let frames = peer.drain();
            assert_eq!(frames.len(), 1);
            assert_eq!(Envelope::decode(&frames[0]).unwrap(), envelope);
        }
    }

    #[test]
    fn broadcast_with_no_peers_is_zero() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.notify(NotificationLevel::Warning, "maintenance"), 0);
    }

    #[test]
    fn send_to_targets_one_peer() {
        let hub = BroadcastHub::new();
        let mut a = connect_quiet(&hub);
        let mut b = connect_quiet(&hub);
        let envelope = Envelope::new(SystemNotification::info("just you"));
        assert!(hub.send_to(a.id(), &envelope));
        assert!(!hub.send_to(&ConnectionId::new(), &envelope));
        assert_eq!(a.drain().len(), 1);
        assert!(b.drain().is_empty());
    }

    #[test]
    fn notify_broadcasts_system_notification() {
        let hub = BroadcastHub::new();
        let mut a = connect_quiet(&hub);
        assert_eq!(hub.notify(NotificationLevel::Error, "disk full"), 1);
        let envelope = Envelope::decode(&a.drain()[0]).unwrap();
        match envelope.payload {
            Payload::SystemNotification(n) => {
                assert_eq!(n.level, NotificationLevel::Error);
                assert_eq!(n.message, "disk full");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn close_all_signals_every_connection() {
        let hub = BroadcastHub::new();
        let peers: Vec<Peer> = (0..2).map(|_| connect_quiet(&hub)).collect();
        hub.close_all();
        assert!(peers.iter().all(|p| p.conn.close_token().is_cancelled()));
    }

    #[test]
    fn disconnect_during_concurrent_relays() {
        let hub = Arc::new(BroadcastHub::new());
        let sender = connect_quiet(&hub);
        let mut peers: Vec<Peer> = (0..10).map(|_| connect(&hub, 512)).collect();
        let sender_id = sender.id().clone();

        let relay_hub = hub.clone();
        let relayer = std::thread::spawn(move || {
            for _ in 0..200 {
                let _ = relay_hub.on_message(&sender_id, SENSOR_FRAME).unwrap();
            }
        });
        for peer in &peers[..5] {
            hub.on_disconnect(peer.id());
        }
        relayer.join().unwrap();

        assert_eq!(hub.connection_count(), 6);
        for peer in &mut peers[5..] {
            // connect notification plus every relay
            assert_eq!(peer.drain().len(), 201);
        }
    }
}
