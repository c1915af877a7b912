//! Sparkplug-B payload decoding
//!
//! Hand-written prost messages for the subset of the published Sparkplug-B
//! protobuf schema this gateway relies on: `timestamp`, `seq` and the flat
//! metric list (`name`, `value`, `type`). Unknown fields (aliases, property
//! sets, datasets, templates) are skipped by the protobuf decoder.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-format messages. Field tags follow the Eclipse Tahu
/// `sparkplug_b.proto` definition.
pub mod wire {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Payload {
        #[prost(uint64, optional, tag = "1")]
        pub timestamp: Option<u64>,
        #[prost(message, repeated, tag = "2")]
        pub metrics: Vec<Metric>,
        #[prost(uint64, optional, tag = "3")]
        pub seq: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Metric {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(uint64, optional, tag = "3")]
        pub timestamp: Option<u64>,
        #[prost(uint32, optional, tag = "4")]
        pub datatype: Option<u32>,
        #[prost(bool, optional, tag = "7")]
        pub is_null: Option<bool>,
        #[prost(oneof = "metric::Value", tags = "10, 11, 12, 13, 14, 15, 16")]
        pub value: Option<metric::Value>,
    }

    pub mod metric {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Value {
            #[prost(uint32, tag = "10")]
            IntValue(u32),
            #[prost(uint64, tag = "11")]
            LongValue(u64),
            #[prost(float, tag = "12")]
            FloatValue(f32),
            #[prost(double, tag = "13")]
            DoubleValue(f64),
            #[prost(bool, tag = "14")]
            BooleanValue(bool),
            #[prost(string, tag = "15")]
            StringValue(String),
            #[prost(bytes = "vec", tag = "16")]
            BytesValue(Vec<u8>),
        }
    }
}

/// One decoded metric: flat `{name, value, type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparkplugMetric {
    pub name: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub datatype: String,
}

/// A decoded Sparkplug-B payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparkplugPayload {
    pub timestamp: Option<u64>,
    pub seq: Option<u64>,
    pub metrics: Vec<SparkplugMetric>,
}

/// Datatype code names from the Sparkplug-B specification.
fn datatype_name(code: Option<u32>) -> &'static str {
    match code {
        Some(1) => "Int8",
        Some(2) => "Int16",
        Some(3) => "Int32",
        Some(4) => "Int64",
        Some(5) => "UInt8",
        Some(6) => "UInt16",
        Some(7) => "UInt32",
        Some(8) => "UInt64",
        Some(9) => "Float",
        Some(10) => "Double",
        Some(11) => "Boolean",
        Some(12) => "String",
        Some(13) => "DateTime",
        Some(14) => "Text",
        Some(15) => "UUID",
        Some(17) => "Bytes",
        _ => "Unknown",
    }
}

fn metric_value(metric: &wire::Metric) -> Value {
    if metric.is_null == Some(true) {
        return Value::Null;
    }
    match &metric.value {
        Some(wire::metric::Value::IntValue(v)) => Value::from(*v),
        Some(wire::metric::Value::LongValue(v)) => Value::from(*v),
        Some(wire::metric::Value::FloatValue(v)) => Value::from(f64::from(*v)),
        Some(wire::metric::Value::DoubleValue(v)) => Value::from(*v),
        Some(wire::metric::Value::BooleanValue(v)) => Value::from(*v),
        Some(wire::metric::Value::StringValue(v)) => Value::from(v.clone()),
        Some(wire::metric::Value::BytesValue(v)) => {
            // Bytes are surfaced as an array of numbers; consumers that need
            // opaque blobs read the raw event payload instead.
            Value::from(v.clone())
        }
        None => Value::Null,
    }
}

/// Decode a Sparkplug-B payload into the flat metric representation.
///
/// Returns `None` when the bytes are not a valid protobuf payload; the
/// caller falls back to the raw variant.
pub fn decode(bytes: &[u8]) -> Option<SparkplugPayload> {
    let payload = wire::Payload::decode(bytes).ok()?;

    let metrics = payload
        .metrics
        .iter()
        .map(|m| SparkplugMetric {
            name: m.name.clone().unwrap_or_default(),
            value: metric_value(m),
            datatype: datatype_name(m.datatype).to_string(),
        })
        .collect();

    Some(SparkplugPayload {
        timestamp: payload.timestamp,
        seq: payload.seq,
        metrics,
    })
}

/// Re-encode a decoded payload to protobuf bytes.
///
/// Only the fields this gateway decodes are written back, so byte equality
/// with the original is not guaranteed; metric-list equivalence is.
pub fn encode(payload: &SparkplugPayload) -> Vec<u8> {
    let metrics = payload
        .metrics
        .iter()
        .map(|m| {
            let (datatype, value) = encode_value(&m.value, &m.datatype);
            wire::Metric {
                name: Some(m.name.clone()),
                timestamp: None,
                datatype,
                is_null: if m.value.is_null() { Some(true) } else { None },
                value,
            }
        })
        .collect();

    let wire = wire::Payload {
        timestamp: payload.timestamp,
        metrics,
        seq: payload.seq,
    };

    wire.encode_to_vec()
}

fn encode_value(value: &Value, datatype: &str) -> (Option<u32>, Option<wire::metric::Value>) {
    match value {
        Value::Null => (None, None),
        Value::Bool(b) => (Some(11), Some(wire::metric::Value::BooleanValue(*b))),
        Value::Number(n) => {
            if datatype == "Float" {
                let v = n.as_f64().unwrap_or(0.0);
                (Some(9), Some(wire::metric::Value::FloatValue(v as f32)))
            } else if let Some(u) = n.as_u64() {
                match datatype {
                    "Int8" | "Int16" | "Int32" | "UInt8" | "UInt16" | "UInt32" => (
                        datatype_code(datatype),
                        Some(wire::metric::Value::IntValue(u as u32)),
                    ),
                    _ => (
                        datatype_code(datatype).or(Some(8)),
                        Some(wire::metric::Value::LongValue(u)),
                    ),
                }
            } else {
                let v = n.as_f64().unwrap_or(0.0);
                (Some(10), Some(wire::metric::Value::DoubleValue(v)))
            }
        }
        Value::String(s) => (Some(12), Some(wire::metric::Value::StringValue(s.clone()))),
        other => (
            Some(12),
            Some(wire::metric::Value::StringValue(other.to_string())),
        ),
    }
}

fn datatype_code(name: &str) -> Option<u32> {
    match name {
        "Int8" => Some(1),
        "Int16" => Some(2),
        "Int32" => Some(3),
        "Int64" => Some(4),
        "UInt8" => Some(5),
        "UInt16" => Some(6),
        "UInt32" => Some(7),
        "UInt64" => Some(8),
        "Float" => Some(9),
        "Double" => Some(10),
        "Boolean" => Some(11),
        "String" => Some(12),
        "DateTime" => Some(13),
        "Text" => Some(14),
        "UUID" => Some(15),
        "Bytes" => Some(17),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> SparkplugPayload {
        SparkplugPayload {
            timestamp: Some(1_700_000_000_000),
            seq: Some(3),
            metrics: vec![
                SparkplugMetric {
                    name: "Temperature".to_string(),
                    value: Value::from(22.5),
                    datatype: "Double".to_string(),
                },
                SparkplugMetric {
                    name: "Running".to_string(),
                    value: Value::from(true),
                    datatype: "Boolean".to_string(),
                },
                SparkplugMetric {
                    name: "Line".to_string(),
                    value: Value::from("A"),
                    datatype: "String".to_string(),
                },
            ],
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        // A long run of 0xFF bytes is not a valid field header sequence
        assert!(decode(&[0xFF; 16]).is_none());
    }

    #[test]
    fn round_trip_preserves_metric_list() {
        let original = sample_payload();
        let bytes = encode(&original);
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.seq, original.seq);
        assert_eq!(decoded.metrics, original.metrics);
    }

    #[test]
    fn null_metric_survives_round_trip() {
        let payload = SparkplugPayload {
            timestamp: None,
            seq: Some(0),
            metrics: vec![SparkplugMetric {
                name: "Offline".to_string(),
                value: Value::Null,
                datatype: "Unknown".to_string(),
            }],
        };

        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(decoded.metrics[0].value, Value::Null);
        assert_eq!(decoded.metrics[0].name, "Offline");
    }

    #[test]
    fn unsigned_int_kinds_use_int_field() {
        let payload = SparkplugPayload {
            timestamp: None,
            seq: None,
            metrics: vec![SparkplugMetric {
                name: "Count".to_string(),
                value: Value::from(42u32),
                datatype: "UInt32".to_string(),
            }],
        };

        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(decoded.metrics[0].value, Value::from(42u32));
        assert_eq!(decoded.metrics[0].datatype, "UInt32");
    }

    #[test]
    fn empty_payload_decodes() {
        let decoded = decode(&[]).unwrap();
        assert!(decoded.metrics.is_empty());
        assert_eq!(decoded.seq, None);
    }
}
