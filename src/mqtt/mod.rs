//! Multi-broker MQTT connectivity
//!
//! One connection per configured broker, each driven by its own task with
//! exponential back-off reconnect. Inbound messages are stamped with their
//! origin `broker_id` and receive time, then handed to the ingest pipeline.

pub mod pool;

pub use pool::BrokerPool;

use thiserror::Error;

/// Errors returned by the publish path.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("unknown broker '{0}'")]
    UnknownBroker(String),
    #[error("topic '{topic}' is outside the publish allowlist of broker '{broker_id}'")]
    NotAllowed { broker_id: String, topic: String },
    #[error("broker '{0}' is unavailable")]
    Unavailable(String),
}

/// Map a wire QoS number (0..=2) to the client's QoS type, clamping
/// out-of-range values down.
pub fn qos_from_u8(qos: u8) -> rumqttc::QoS {
    match qos {
        2 => rumqttc::QoS::ExactlyOnce,
        1 => rumqttc::QoS::AtLeastOnce,
        _ => rumqttc::QoS::AtMostOnce,
    }
}
