/// Reasons an inbound frame cannot be turned into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Not JSON, not an object, or no string `type` field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A known `type` whose `data` does not match that kind's payload shape.
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: &'static str, detail: String },

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl EnvelopeError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::Encode(_) => "encode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = EnvelopeError::MalformedFrame("expected value".into());
        assert_eq!(err.to_string(), "malformed frame: expected value");

        let err = EnvelopeError::InvalidPayload {
            kind: "sensor_update",
            detail: "missing field `sensorId`".into(),
        };
        assert!(err.to_string().starts_with("invalid sensor_update payload"));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(EnvelopeError::MalformedFrame(String::new()).error_kind(), "malformed_frame");
        assert_eq!(EnvelopeError::Encode(String::new()).error_kind(), "encode");
    }
}
