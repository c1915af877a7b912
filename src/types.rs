//! Shared data structures for the gateway pipeline
//!
//! An [`Event`] is the immutable record every inbound message becomes at the
//! ingest edge. It flows from the broker pool into the event store, the
//! mapper engine, the alert engine and the broadcast hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec;

/// Immutable record written by ingest for every successful inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifies the origin connection.
    pub broker_id: String,
    /// Slash-separated path; wildcard-free at write.
    pub topic: String,
    /// Opaque bytes; decoded lazily by queries that need structure.
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    /// Set monotonically at the ingest edge.
    pub timestamp: DateTime<Utc>,
    /// Mapper republish depth. Zero for broker-originated messages;
    /// incremented each time the mapper republishes a derived message.
    #[serde(default)]
    pub hop: u8,
    /// True for mapper-produced events.
    #[serde(default)]
    pub generated: bool,
    /// QoS the message arrived with; mapper republishes inherit it.
    #[serde(default)]
    pub qos: u8,
    /// Retain flag the message arrived with.
    #[serde(default)]
    pub retain: bool,
}

impl Event {
    pub fn new(broker_id: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            broker_id: broker_id.into(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            hop: 0,
            generated: false,
            qos: 0,
            retain: false,
        }
    }

    /// Decode the payload through the codec registry.
    pub fn decode_payload(&self) -> codec::Payload {
        codec::decode(&self.topic, &self.payload)
    }

    /// Wire shape forwarded to hub clients:
    /// `{ broker_id, topic, payload, timestamp }`.
    pub fn wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "broker_id": self.broker_id,
            "topic": self.topic,
            "payload": self.decode_payload().to_json(),
            "timestamp": self.timestamp.to_rfc3339(),
            "generated": self.generated,
        })
    }
}

/// Payload bytes serialize as a UTF-8 string when possible, else as a byte
/// array. Stored rows keep the exact bytes; this codec only affects JSON
/// views of an `Event`.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(s) => ser.serialize_str(s),
            Err(_) => ser.collect_seq(bytes.iter()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Bytes(Vec<u8>),
        }
        Ok(match Repr::deserialize(de)? {
            Repr::Text(s) => s.into_bytes(),
            Repr::Bytes(b) => b,
        })
    }
}

/// Authenticated caller identity, produced by the auth middleware from the
/// opaque identity oracle.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub admin: bool,
}

/// Connection state of a single broker, reported by `/context/status` and
/// the hub `db-status` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}
