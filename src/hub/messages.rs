//! Hub wire messages
//!
//! Request/response and push messages carried over the per-client duplex
//! channel. Responses echo the request `type` with a `-data` suffix and
//! carry the original bounds for correlation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client may send to the hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Set (or clear) the client's live-event topic filter.
    Subscribe {
        #[serde(default)]
        filter: Option<String>,
    },
    /// Newest-first history for one topic.
    GetTopicHistory {
        topic: String,
        #[serde(default)]
        broker_id: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Oldest-first slice of a time range, optionally pattern-filtered.
    GetHistoryRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        #[serde(default)]
        filter: Option<String>,
    },
    /// Publish through the broker pool (same checks as the HTTP path).
    Publish {
        broker_id: String,
        topic: String,
        payload: Value,
        #[serde(default)]
        qos: Option<u8>,
        #[serde(default)]
        retain: Option<bool>,
    },
}

/// Messages the hub pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Initial batch sent on connect.
    Init {
        recent: Vec<Value>,
        mapper_config: Value,
        db_status: Value,
    },
    /// A live event.
    Event {
        broker_id: String,
        topic: String,
        payload: Value,
        timestamp: String,
        generated: bool,
    },
    /// Marker that a mapper target produced `topic`.
    Generated {
        broker_id: String,
        topic: String,
        source_topic: String,
    },
    GetTopicHistoryData {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        broker_id: Option<String>,
        events: Vec<Value>,
    },
    GetHistoryRangeData {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
        events: Vec<Value>,
    },
    ConfigUpdated {
        config: Value,
    },
    DbStatus {
        stats: Value,
    },
    MapperMetrics {
        metrics: Value,
    },
    AlertsUpdated,
    /// Mirrored chat stream chunk (same ids as the NDJSON stream).
    ChatChunk {
        chunk: Value,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Serialized text frame. Serialization of these shapes cannot fail.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}
