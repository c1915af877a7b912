//! `/context/*` handlers: status, topic discovery, history, search, prune.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppContext;
use crate::topic::TopicPattern;
use crate::types::{Event, Identity};

use super::super::auth::require_admin;
use super::super::envelope::ApiResponse;
use super::super::error::ApiError;

const HISTORY_DEFAULT_LIMIT: usize = 20;
const HISTORY_MAX_LIMIT: usize = 1_000;
const TOPICS_LIMIT: usize = 1_000;
const SEARCH_LIMIT: usize = 200;

/// Aggregate status snapshot. Non-authoritative.
pub async fn get_status(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    let stats = ctx.store.stats()?;
    Ok(ApiResponse::ok(json!({
        "connections": ctx.pool.connection_states(),
        "db": stats,
        "simulators": [],
        "hub_clients": ctx.hub.client_count(),
        "uptime_secs": ctx.uptime_secs(),
        "started_at": ctx.started_at.to_rfc3339(),
    })))
}

/// Distinct `(broker_id, topic)` pairs. Bounded response.
pub async fn get_topics(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    let topics = ctx.store.distinct_topics(TOPICS_LIMIT)?;
    Ok(ApiResponse::ok(topics))
}

#[derive(Deserialize)]
pub struct TopicQuery {
    broker_id: Option<String>,
}

/// Latest event for one topic; 404 when none exists.
pub async fn get_topic_latest(
    State(ctx): State<AppContext>,
    Path(topic): Path<String>,
    Query(query): Query<TopicQuery>,
) -> Result<Response, ApiError> {
    let event = ctx
        .store
        .get_latest(query.broker_id.as_deref(), &topic)?
        .ok_or_else(|| ApiError::not_found(format!("no events for topic '{topic}'")))?;
    Ok(ApiResponse::ok(event.wire_json()))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    broker_id: Option<String>,
    limit: Option<usize>,
}

/// Newest-first history. `limit` defaults to 20, capped at 1000.
pub async fn get_topic_history(
    State(ctx): State<AppContext>,
    Path(topic): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .min(HISTORY_MAX_LIMIT);
    let events = ctx
        .store
        .get_history(query.broker_id.as_deref(), &topic, limit)?;
    Ok(ApiResponse::ok(
        events.iter().map(Event::wire_json).collect::<Vec<_>>(),
    ))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    q: String,
    broker_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// Full-text substring search; 400 when the query is under 2 characters.
pub async fn search(
    State(ctx): State<AppContext>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let events = ctx.store.search_fulltext(
        &query.q,
        query.broker_id.as_deref(),
        query.start,
        query.end,
        SEARCH_LIMIT,
    )?;
    Ok(ApiResponse::ok(
        events.iter().map(Event::wire_json).collect::<Vec<_>>(),
    ))
}

#[derive(Deserialize)]
pub struct TemplateSearchBody {
    topic_template: String,
    #[serde(default)]
    filters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    broker_id: Option<String>,
}

/// MQTT-pattern search with per-key payload equality filters.
pub async fn search_by_template(
    State(ctx): State<AppContext>,
    Json(body): Json<TemplateSearchBody>,
) -> Result<Response, ApiError> {
    let pattern = TopicPattern::compile(&body.topic_template)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let filters = body.filters.unwrap_or_default();
    let events =
        ctx.store
            .search_by_template(&pattern, &filters, body.broker_id.as_deref(), SEARCH_LIMIT)?;
    Ok(ApiResponse::ok(
        events.iter().map(Event::wire_json).collect::<Vec<_>>(),
    ))
}

#[derive(Deserialize)]
pub struct PruneBody {
    pattern: String,
    #[serde(default)]
    broker_id: Option<String>,
}

/// Delete stored events by pattern and clear matching retained topics on
/// the brokers. Admin only.
pub async fn prune_topic(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<PruneBody>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;

    let pattern =
        TopicPattern::compile(&body.pattern).map_err(|e| ApiError::bad_request(e.to_string()))?;

    // Snapshot matching topics before deletion so retained copies on the
    // brokers can be cleared too.
    let known = ctx.store.distinct_topics(10_000)?;
    let deleted = ctx.store.prune_pattern(&pattern, body.broker_id.as_deref())?;

    let mut purged = 0usize;
    for broker_id in ctx.pool.broker_ids() {
        if let Some(only) = &body.broker_id {
            if *only != broker_id {
                continue;
            }
        }
        let topics: Vec<String> = known
            .iter()
            .filter(|t| t.broker_id == broker_id && pattern.matches(&t.topic))
            .map(|t| t.topic.clone())
            .collect();
        purged += ctx.pool.purge_retained(&broker_id, &topics).await;
    }

    tracing::info!(
        pattern = %body.pattern,
        deleted,
        purged,
        user_id = %identity.user_id,
        "Pruned topics"
    );
    Ok(ApiResponse::ok(json!({
        "deleted": deleted,
        "retained_purged": purged,
    })))
}
