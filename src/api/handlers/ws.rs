//! `/ws`: duplex channel upgrade into the broadcast hub.

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::Extension;

use crate::state::AppContext;
use crate::types::Identity;

pub async fn upgrade(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = ctx.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket, identity.user_id))
}
