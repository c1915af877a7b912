//! `/chat/*` handlers: streaming completion, stop, session CRUD.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::state::AppContext;
use crate::store::sessions::ChatMessage;
use crate::types::Identity;

use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

#[derive(Deserialize)]
pub struct CompletionBody {
    #[serde(default)]
    session_id: Option<String>,
    message: String,
    #[serde(default)]
    client_id: Option<String>,
}

/// One agent turn, streamed as NDJSON chunks
/// `{id, type: status|tool_start|tool_result|message|error, content}`.
pub async fn completion(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CompletionBody>,
) -> Result<Response, ApiError> {
    if !ctx.agent.is_configured() {
        return Err(ApiError::unavailable("no LLM endpoint configured"));
    }
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let session_id = body
        .session_id
        .unwrap_or_else(|| format!("sess_{}", uuid::Uuid::new_v4().simple()));
    let client_id = body.client_id.unwrap_or_else(|| identity.user_id.clone());

    let (tx, rx) = mpsc::channel(64);
    let agent = ctx.agent.clone();
    let message = body.message;
    tokio::spawn(async move {
        agent
            .run_turn(identity, session_id, message, client_id, tx)
            .await;
    });

    let chunk_stream = stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        let line = serde_json::to_string(&chunk).unwrap_or_default();
        Some((Ok::<_, std::convert::Infallible>(format!("{line}\n")), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(chunk_stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}

#[derive(Deserialize)]
pub struct StopBody {
    client_id: String,
}

/// Abort the in-flight stream for a client id.
pub async fn stop(
    State(ctx): State<AppContext>,
    Json(body): Json<StopBody>,
) -> Result<Response, ApiError> {
    let stopped = ctx.agent.stop(&body.client_id);
    Ok(ApiResponse::ok(json!({"stopped": stopped})))
}

fn authorize_session(
    ctx: &AppContext,
    identity: &Identity,
    session_id: &str,
) -> Result<Option<crate::store::sessions::ChatSession>, ApiError> {
    let session = ctx.store.get_session(session_id)?;
    if let Some(session) = &session {
        if session.user_id != identity.user_id && !identity.admin {
            // Do not reveal the session's existence.
            return Err(ApiError::not_found("no such session"));
        }
    }
    Ok(session)
}

pub async fn get_session(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = authorize_session(&ctx, &identity, &id)?
        .ok_or_else(|| ApiError::not_found("no such session"))?;
    Ok(ApiResponse::ok(session))
}

/// Replace the session with the full ordered message list.
pub async fn put_session(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(messages): Json<Vec<ChatMessage>>,
) -> Result<Response, ApiError> {
    authorize_session(&ctx, &identity, &id)?;
    ctx.store.put_session(&id, &identity.user_id, &messages)?;
    Ok(ApiResponse::ok(json!({"session_id": id, "messages": messages.len()})))
}

pub async fn delete_session(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authorize_session(&ctx, &identity, &id)?;
    ctx.store.delete_session(&id)?;
    Ok(ApiResponse::ok(json!({"deleted": id})))
}

/// Session index for the caller.
pub async fn list_sessions(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(ctx.store.list_sessions(&identity.user_id)?))
}
