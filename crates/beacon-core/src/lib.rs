//! Shared types for the Beacon broadcast hub: the message envelope contract,
//! branded identifiers and envelope errors.

pub mod envelope;
pub mod errors;
pub mod ids;

pub use envelope::{
    frame_type, now_millis, Envelope, MessageKind, NotificationLevel, Payload, PresenceStatus, RawEnvelope,
    SensorUpdate, SystemNotification, TimeSeriesUpdate, UserStatus,
};
pub use errors::EnvelopeError;
pub use ids::{ConnectionId, MessageId, SensorReadingId, TimeSeriesId};
