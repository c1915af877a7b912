//! `/mapper/*` handlers: config read/replace and metrics.

use axum::extract::State;
use axum::response::Response;
use axum::Json;

use crate::mapper::MapperConfig;
use crate::state::AppContext;

use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

/// Current config snapshot.
pub async fn get_config(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(ctx.mapper.config()))
}

/// Atomically replace the full config. 400 on validation failure; the
/// previous snapshot stays active in that case.
pub async fn post_config(
    State(ctx): State<AppContext>,
    Json(config): Json<MapperConfig>,
) -> Result<Response, ApiError> {
    let saved = ctx.mapper.replace_config(config).await?;
    Ok(ApiResponse::ok(saved))
}

/// Current metrics snapshot: per-target counters and ring-buffered logs.
pub async fn get_metrics(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(ctx.mapper.metrics().snapshot()))
}
