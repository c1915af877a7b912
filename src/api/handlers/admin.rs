//! `/admin/*` handlers. Admin only.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Extension;
use serde_json::json;

use crate::state::AppContext;
use crate::types::Identity;

use super::super::auth::require_admin;
use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

pub async fn list_users(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;
    Ok(ApiResponse::ok(ctx.store.list_users()?))
}

pub async fn delete_user(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;
    if user_id == identity.user_id {
        return Err(ApiError::bad_request("cannot delete the calling user"));
    }
    ctx.store.delete_user(&user_id)?;
    Ok(ApiResponse::ok(json!({"deleted": user_id})))
}
