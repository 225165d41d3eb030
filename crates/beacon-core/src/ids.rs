use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConnectionId, "conn");
branded_id!(MessageId, "msg");
branded_id!(TimeSeriesId, "ts");
branded_id!(SensorReadingId, "sensor");

impl MessageId {
    /// Id for an envelope originating from a client connection manager.
    pub fn client() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn message_id_prefixes() {
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(MessageId::client().as_str().starts_with("client_"));
    }

    #[test]
    fn record_id_prefixes() {
        assert!(TimeSeriesId::new().as_str().starts_with("ts_"));
        assert!(SensorReadingId::new().as_str().starts_with("sensor_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = MessageId::client();
        let b = MessageId::client();
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = MessageId::from_raw("msg_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"msg_1\"");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<ConnectionId> = (0..100).map(|_| ConnectionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
