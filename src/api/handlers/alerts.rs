//! `/alerts/*` handlers: rule CRUD, active alerts, status transitions.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::alerts::{AlertRuleSpec, AlertStatus};
use crate::state::AppContext;
use crate::types::Identity;

use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

const ACTIVE_LIMIT: usize = 100;

pub async fn list_rules(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(ctx.store.list_alert_rules()?))
}

pub async fn create_rule(
    State(ctx): State<AppContext>,
    Json(spec): Json<AlertRuleSpec>,
) -> Result<Response, ApiError> {
    if spec.name.trim().is_empty() {
        return Err(ApiError::bad_request("rule name must not be empty"));
    }
    if spec.condition_code.trim().is_empty() {
        return Err(ApiError::bad_request("condition_code must not be empty"));
    }

    let rule = ctx.store.insert_alert_rule(&spec)?;
    ctx.alerts.reload_rules()?;
    Ok(ApiResponse::created(rule))
}

pub async fn update_rule(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(spec): Json<AlertRuleSpec>,
) -> Result<Response, ApiError> {
    let rule = ctx.store.update_alert_rule(&id, &spec)?;
    ctx.alerts.reload_rules()?;
    Ok(ApiResponse::ok(rule))
}

pub async fn delete_rule(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    ctx.store.delete_alert_rule(&id)?;
    ctx.alerts.reload_rules()?;
    Ok(ApiResponse::ok(serde_json::json!({"deleted": id})))
}

/// Newest alerts.
pub async fn active_alerts(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(ctx.store.list_alerts(ACTIVE_LIMIT)?))
}

#[derive(Deserialize)]
pub struct TransitionBody {
    status: AlertStatus,
}

/// Operator transition; 409 on an illegal move (`resolved` is absorbing).
pub async fn transition_alert(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Result<Response, ApiError> {
    let alert = ctx
        .store
        .transition_alert(&id, body.status, &identity.user_id)?;
    ctx.hub
        .broadcast(&crate::hub::ServerMessage::AlertsUpdated);
    Ok(ApiResponse::ok(alert))
}
