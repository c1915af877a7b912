//! Payload codec registry
//!
//! The only entry point that constructs structured payload variants. Topic
//! prefix `spBv1.0/` selects Sparkplug-B decoding; otherwise a JSON parse is
//! attempted with a raw-bytes fallback. Decode failures never propagate —
//! a payload that fails to decode is carried as raw bytes.

pub mod sparkplug;

pub use sparkplug::{SparkplugMetric, SparkplugPayload};

use serde::Serialize;
use serde_json::Value;

use crate::topic::is_sparkplug_topic;

/// Decoded payload, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes (non-JSON, or any decode failure).
    Raw(Vec<u8>),
    /// A parsed JSON document.
    Json(Value),
    /// A decoded Sparkplug-B metric list.
    Sparkplug(SparkplugPayload),
}

/// Payload kind discriminant, used on the wire and in query responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Raw,
    Json,
    SparkplugB,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::Json(_) => PayloadKind::Json,
            Payload::Sparkplug(_) => PayloadKind::SparkplugB,
        }
    }

    /// JSON view of the payload for the hub, query responses and the
    /// sandbox `msg.payload` binding. Raw bytes become a (lossy) string.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Raw(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
            Payload::Json(v) => v.clone(),
            Payload::Sparkplug(sp) => serde_json::to_value(sp).unwrap_or(Value::Null),
        }
    }

    /// Serialize back to wire bytes: JSON for structured variants, the
    /// original bytes for raw.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            Payload::Sparkplug(sp) => sparkplug::encode(sp),
        }
    }
}

/// Decode payload bytes according to the topic's namespace.
pub fn decode(topic: &str, bytes: &[u8]) -> Payload {
    if is_sparkplug_topic(topic) {
        if let Some(sp) = sparkplug::decode(bytes) {
            return Payload::Sparkplug(sp);
        }
        tracing::debug!(topic, "Sparkplug-B decode failed, falling back to raw");
        return Payload::Raw(bytes.to_vec());
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(v) => Payload::Json(v),
        Err(_) => Payload::Raw(bytes.to_vec()),
    }
}
