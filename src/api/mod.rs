//! HTTP surface
//!
//! Axum application exposing the query/control API, the chat agent and the
//! WebSocket hub endpoint, nested under the configured base path.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod handlers;
mod routes;

pub use error::ApiError;

use axum::Router;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::state::AppContext;

/// Build the complete application router.
pub fn create_app(ctx: AppContext) -> Router {
    let base_path = ctx.config.base_path.clone();
    let api = routes::api_routes(ctx);

    let router = if base_path.is_empty() {
        api
    } else {
        Router::new().nest(&base_path, api)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
