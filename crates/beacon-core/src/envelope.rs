//! The wire contract for every message exchanged over a Beacon connection.
//!
//! A frame is a UTF-8 JSON object `{ type, data, timestamp, id? }`. Decoding
//! happens at two levels:
//!
//! - [`frame_type`] checks structure only (an object with a string `type`);
//!   every other field is left alone. The hub relays anything that passes.
//! - [`RawEnvelope::parse`] also reads `timestamp` as integer milliseconds and
//!   `id` as a string.
//! - [`Envelope::decode`] additionally decodes `data` into the typed payload
//!   for the four known kinds. Unknown kinds survive as [`Payload::Unknown`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;
use crate::ids::MessageId;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The closed set of message kinds with typed payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "timeseries_update")]
    TimeSeriesUpdate,
    #[serde(rename = "sensor_update")]
    SensorUpdate,
    #[serde(rename = "user_status")]
    UserStatus,
    #[serde(rename = "system_notification")]
    SystemNotification,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        Self::TimeSeriesUpdate,
        Self::SensorUpdate,
        Self::UserStatus,
        Self::SystemNotification,
    ];

    /// The `type` tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeSeriesUpdate => "timeseries_update",
            Self::SensorUpdate => "sensor_update",
            Self::UserStatus => "user_status",
            Self::SystemNotification => "system_notification",
        }
    }

    /// Look up a wire tag. `None` for anything outside the known set.
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| format!("unknown message kind: {s}"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesUpdate {
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdate {
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemNotification {
    pub level: NotificationLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SystemNotification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            title: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }
}

/// Typed message body. `Unknown` carries frames whose `type` is outside
/// [`MessageKind`] so they can still be relayed and observed.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    TimeSeriesUpdate(TimeSeriesUpdate),
    SensorUpdate(SensorUpdate),
    UserStatus(UserStatus),
    SystemNotification(SystemNotification),
    Unknown { kind: String, data: Value },
}

impl Payload {
    /// `None` for [`Payload::Unknown`].
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::TimeSeriesUpdate(_) => Some(MessageKind::TimeSeriesUpdate),
            Self::SensorUpdate(_) => Some(MessageKind::SensorUpdate),
            Self::UserStatus(_) => Some(MessageKind::UserStatus),
            Self::SystemNotification(_) => Some(MessageKind::SystemNotification),
            Self::Unknown { .. } => None,
        }
    }

    /// The wire `type` tag, including unknown ones.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().map_or("", |k| k.as_str()),
        }
    }

    fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::TimeSeriesUpdate(p) => serde_json::to_value(p),
            Self::SensorUpdate(p) => serde_json::to_value(p),
            Self::UserStatus(p) => serde_json::to_value(p),
            Self::SystemNotification(p) => serde_json::to_value(p),
            Self::Unknown { data, .. } => Ok(data.clone()),
        }
    }

    fn from_data(tag: String, data: Value) -> Result<Self, EnvelopeError> {
        let Some(kind) = MessageKind::from_wire(&tag) else {
            return Ok(Self::Unknown { kind: tag, data });
        };
        let invalid = |e: serde_json::Error| EnvelopeError::InvalidPayload {
            kind: kind.as_str(),
            detail: e.to_string(),
        };
        Ok(match kind {
            MessageKind::TimeSeriesUpdate => {
                Self::TimeSeriesUpdate(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageKind::SensorUpdate => {
                Self::SensorUpdate(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageKind::UserStatus => {
                Self::UserStatus(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageKind::SystemNotification => {
                Self::SystemNotification(serde_json::from_value(data).map_err(invalid)?)
            }
        })
    }
}

impl From<TimeSeriesUpdate> for Payload {
    fn from(p: TimeSeriesUpdate) -> Self {
        Self::TimeSeriesUpdate(p)
    }
}

impl From<SensorUpdate> for Payload {
    fn from(p: SensorUpdate) -> Self {
        Self::SensorUpdate(p)
    }
}

impl From<UserStatus> for Payload {
    fn from(p: UserStatus) -> Self {
        Self::UserStatus(p)
    }
}

impl From<SystemNotification> for Payload {
    fn from(p: SystemNotification) -> Self {
        Self::SystemNotification(p)
    }
}

/// The `type` tag of a frame that is a JSON object with a string `type`.
///
/// Other fields are not inspected, so `"id":42` or `"timestamp":null` pass.
pub fn frame_type(frame: &str) -> Result<String, EnvelopeError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| EnvelopeError::MalformedFrame(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(EnvelopeError::MalformedFrame("expected a JSON object".into()));
    };
    match fields.remove("type") {
        Some(Value::String(kind)) => Ok(kind),
        Some(_) => Err(EnvelopeError::MalformedFrame("`type` must be a string".into())),
        None => Err(EnvelopeError::MalformedFrame("missing `type`".into())),
    }
}

/// Structural view of a frame: the fields every envelope has, with `data`
/// left untyped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// `0` when the sender omitted it.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl RawEnvelope {
    /// Fail-closed structural parse of an inbound text frame.
    pub fn parse(frame: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| EnvelopeError::MalformedFrame(e.to_string()))?;
        if !value.is_object() {
            return Err(EnvelopeError::MalformedFrame("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| EnvelopeError::MalformedFrame(e.to_string()))
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_wire(&self.kind)
    }
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub id: Option<MessageId>,
}

impl Envelope {
    /// Stamp a payload with the current time. No id is attached.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: now_millis(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.payload.kind()
    }

    pub fn type_tag(&self) -> &str {
        self.payload.type_tag()
    }

    /// Structural parse followed by typed payload decoding.
    pub fn decode(frame: &str) -> Result<Self, EnvelopeError> {
        Self::from_raw(RawEnvelope::parse(frame)?)
    }

    pub fn from_raw(raw: RawEnvelope) -> Result<Self, EnvelopeError> {
        Ok(Self {
            payload: Payload::from_data(raw.kind, raw.data)?,
            timestamp: raw.timestamp,
            id: raw.id.map(MessageId::from_raw),
        })
    }

    pub fn to_raw(&self) -> Result<RawEnvelope, EnvelopeError> {
        Ok(RawEnvelope {
            kind: self.type_tag().to_string(),
            data: self
                .payload
                .to_data()
                .map_err(|e| EnvelopeError::Encode(e.to_string()))?,
            timestamp: self.timestamp,
            id: self.id.as_ref().map(|id| id.as_str().to_string()),
        })
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(&self.to_raw()?).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_tags() {
        assert_eq!(MessageKind::TimeSeriesUpdate.as_str(), "timeseries_update");
        assert_eq!(MessageKind::from_wire("user_status"), Some(MessageKind::UserStatus));
        assert_eq!(MessageKind::from_wire("chat_message"), None);
        assert!("sensor_update".parse::<MessageKind>().is_ok());
        assert!("nope".parse::<MessageKind>().is_err());
    }

    #[test]
    fn kind_serde_matches_wire_tag() {
        for kind in MessageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn raw_parse_accepts_minimal_object() {
        let raw = RawEnvelope::parse(r#"{"type":"sensor_update","data":{"sensorId":"s1"}}"#).unwrap();
        assert_eq!(raw.kind, "sensor_update");
        assert_eq!(raw.timestamp, 0);
        assert!(raw.id.is_none());
        assert_eq!(raw.message_kind(), Some(MessageKind::SensorUpdate));
    }

    #[test]
    fn raw_parse_rejects_bad_syntax() {
        let err = RawEnvelope::parse("{not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedFrame(_)));
    }

    #[test]
    fn raw_parse_rejects_non_objects() {
        for frame in ["[\"sensor_update\"]", "42", "\"text\"", "null"] {
            assert!(RawEnvelope::parse(frame).is_err(), "accepted {frame}");
        }
    }

    #[test]
    fn raw_parse_requires_string_type() {
        assert!(RawEnvelope::parse(r#"{"data":{}}"#).is_err());
        assert!(RawEnvelope::parse(r#"{"type":7,"data":{}}"#).is_err());
    }

    #[test]
    fn frame_type_ignores_other_fields() {
        for frame in [
            r#"{"type":"sensor_update","data":{"sensorId":"s1"},"timestamp":1700000000000,"id":42}"#,
            r#"{"type":"sensor_update","timestamp":null}"#,
            r#"{"type":"sensor_update","timestamp":1700000000000.5}"#,
            r#"{"type":"sensor_update","timestamp":"2024-01-01T00:00:00Z"}"#,
        ] {
            assert_eq!(frame_type(frame).unwrap(), "sensor_update", "{frame}");
        }
    }

    #[test]
    fn frame_type_rejects_what_raw_parse_rejects() {
        for frame in ["{not json", "[1]", "null", r#"{"data":{}}"#, r#"{"type":7}"#] {
            assert!(
                matches!(frame_type(frame), Err(EnvelopeError::MalformedFrame(_))),
                "accepted {frame}"
            );
        }
    }

    #[test]
    fn decode_sensor_update() {
        let env = Envelope::decode(
            r#"{"type":"sensor_update","data":{"sensorId":"s1","temperature":21.5},"timestamp":1700000000000,"id":"client_1"}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), Some(MessageKind::SensorUpdate));
        assert_eq!(env.timestamp, 1_700_000_000_000);
        assert_eq!(env.id.as_ref().map(MessageId::as_str), Some("client_1"));
        match env.payload {
            Payload::SensorUpdate(p) => {
                assert_eq!(p.sensor_id, "s1");
                assert_eq!(p.temperature, Some(21.5));
                assert!(p.humidity.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_kind_is_pass_through() {
        let env = Envelope::decode(r#"{"type":"chat_message","data":{"text":"hi"},"timestamp":5}"#).unwrap();
        assert_eq!(env.kind(), None);
        assert_eq!(env.type_tag(), "chat_message");
        assert_eq!(
            env.payload,
            Payload::Unknown {
                kind: "chat_message".into(),
                data: json!({"text": "hi"}),
            }
        );
    }

    #[test]
    fn decode_known_kind_with_wrong_shape() {
        let err = Envelope::decode(r#"{"type":"user_status","data":{"userId":"u1"}}"#).unwrap_err();
        match err {
            EnvelopeError::InvalidPayload { kind, .. } => assert_eq!(kind, "user_status"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn encode_uses_camel_case_and_skips_absent_fields() {
        let env = Envelope::new(SensorUpdate {
            sensor_id: "s9".into(),
            humidity: Some(40.0),
            ..Default::default()
        })
        .with_id(MessageId::from_raw("msg_1"));
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "sensor_update");
        assert_eq!(value["data"], json!({"sensorId": "s9", "humidity": 40.0}));
        assert_eq!(value["id"], "msg_1");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn encode_without_id_omits_field() {
        let env = Envelope::new(SystemNotification::info("hello"));
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["data"], json!({"level": "info", "message": "hello"}));
    }

    #[test]
    fn unknown_payload_reencodes_its_tag() {
        let env = Envelope::decode(r#"{"type":"x_custom","data":[1,2],"timestamp":9}"#).unwrap();
        let raw = env.to_raw().unwrap();
        assert_eq!(raw.kind, "x_custom");
        assert_eq!(raw.data, json!([1, 2]));
        assert_eq!(raw.timestamp, 9);
    }

    #[test]
    fn user_status_lowercase_status() {
        let env = Envelope::decode(r#"{"type":"user_status","data":{"userId":"u1","status":"away"}}"#).unwrap();
        match env.payload {
            Payload::UserStatus(s) => assert_eq!(s.status, PresenceStatus::Away),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn time_series_update_with_tags_and_timestamp() {
        let env = Envelope::decode(
            r#"{"type":"timeseries_update","data":{"metric":"cpu","value":0.5,"tags":{"host":"a"},"timestamp":"2026-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        match env.payload {
            Payload::TimeSeriesUpdate(p) => {
                assert_eq!(p.metric, "cpu");
                assert_eq!(p.tags.unwrap()["host"], "a");
                assert!(p.timestamp.is_some());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
