//! `/publish/message`: passthrough to the broker pool.

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppContext;

use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

#[derive(Deserialize)]
pub struct PublishBody {
    broker_id: String,
    topic: String,
    payload: Value,
    #[serde(default)]
    qos: Option<u8>,
    #[serde(default)]
    retain: Option<bool>,
}

/// Publish one message. Topics outside the broker's allowlist are
/// rejected; a down connection is 503.
pub async fn publish_message(
    State(ctx): State<AppContext>,
    Json(body): Json<PublishBody>,
) -> Result<Response, ApiError> {
    if body.topic.is_empty() || body.topic.contains('+') || body.topic.contains('#') {
        return Err(ApiError::bad_request(
            "publish topic must be exact (no wildcards)",
        ));
    }

    let bytes = match &body.payload {
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).map_err(|e| ApiError::internal(e.to_string()))?,
    };

    ctx.pool
        .publish(
            &body.broker_id,
            &body.topic,
            &bytes,
            body.qos.unwrap_or(0),
            body.retain.unwrap_or(false),
        )
        .await?;

    Ok(ApiResponse::ok(json!({
        "published": true,
        "broker_id": body.broker_id,
        "topic": body.topic,
    })))
}
