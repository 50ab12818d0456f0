//! The bridge `Message` envelope (§3, §6).
//!
//! The envelope is the unit the [`crate::bridge::Bridge`] relays between a
//! client and a backend service. Its five identity fields are preserved
//! exactly by the wire codec (see [`crate::codec`]); the `payload` is an
//! opaque, type-defined structured value the bridge never interprets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A protocol-agnostic message relayed by a [`crate::bridge::Bridge`].
///
/// `payload` is carried verbatim: the bridge dispatches on `message_type`
/// without ever inspecting or validating the payload's shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub source: String,
    pub destination: String,
    pub payload: serde_json::Value,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Message {
    /// Builds a message with a fresh globally-unique id and the current
    /// timestamp.
    pub fn new(
        message_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            message_type: message_type.into(),
            source: source.into(),
            destination: destination.into(),
            payload,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_cbor() {
        let msg = Message::new(
            "chat.send",
            "svc-a",
            "svc-b",
            serde_json::json!({"text": "hi"}),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&msg, &mut buf).unwrap();
        let decoded: Message = ciborium::from_reader(buf.as_slice()).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn ids_are_unique_per_sender() {
        let a = Message::new("t", "s", "d", serde_json::Value::Null);
        let b = Message::new("t", "s", "d", serde_json::Value::Null);
        assert_ne!(a.id, b.id);
    }
}
