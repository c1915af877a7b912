//! Route table
//!
//! All endpoints require an authenticated identity (see [`super::auth`]);
//! admin checks happen inside the handlers that need them.

use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};

use crate::state::AppContext;

use super::auth::require_identity;
use super::handlers::{admin, alerts, chat, context, mapper, publish, ws};

pub fn api_routes(ctx: AppContext) -> Router {
    Router::new()
        // Context / query surface
        .route("/context/status", get(context::get_status))
        .route("/context/topics", get(context::get_topics))
        .route("/context/topic/*topic", get(context::get_topic_latest))
        .route("/context/history/*topic", get(context::get_topic_history))
        .route("/context/search", get(context::search))
        .route("/context/search/model", post(context::search_by_template))
        .route("/context/prune-topic", post(context::prune_topic))
        // Mapper
        .route("/mapper/config", get(mapper::get_config))
        .route("/mapper/config", post(mapper::post_config))
        .route("/mapper/metrics", get(mapper::get_metrics))
        // Alerts
        .route("/alerts/rules", get(alerts::list_rules))
        .route("/alerts/rules", post(alerts::create_rule))
        .route("/alerts/rules/:id", put(alerts::update_rule))
        .route("/alerts/rules/:id", delete(alerts::delete_rule))
        .route("/alerts/active", get(alerts::active_alerts))
        .route("/alerts/:id/status", post(alerts::transition_alert))
        // Publish passthrough
        .route("/publish/message", post(publish::publish_message))
        // Chat agent
        .route("/chat/completion", post(chat::completion))
        .route("/chat/stop", post(chat::stop))
        .route("/chat/sessions", get(chat::list_sessions))
        .route("/chat/session/:id", get(chat::get_session))
        .route("/chat/session/:id", post(chat::put_session))
        .route("/chat/session/:id", delete(chat::delete_session))
        // Admin
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/:id", delete(admin::delete_user))
        // Live duplex channel
        .route("/ws", get(ws::upgrade))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            require_identity,
        ))
        .with_state(ctx)
}
