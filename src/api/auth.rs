//! Identity middleware
//!
//! The session layer upstream is an opaque identity oracle; here it is a
//! bearer token (Authorization header, `x-api-key`, or `?token=` for
//! WebSocket handshakes) resolved against the users table. Every endpoint
//! requires an authenticated identity; admin-only endpoints additionally
//! check the admin flag.

use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::state::AppContext;
use crate::types::Identity;

use super::error::ApiError;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(raw) = value.to_str() {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    if let Some(value) = request.headers().get("x-api-key") {
        if let Ok(raw) = value.to_str() {
            return Some(raw.trim().to_string());
        }
    }
    None
}

/// Resolve the caller's identity and stash it as a request extension.
pub async fn require_identity(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = match bearer_token(&request) {
        Some(token) => Some(token),
        None => {
            // WebSocket handshakes cannot set headers from a browser.
            Query::<TokenQuery>::try_from_uri(request.uri())
                .ok()
                .and_then(|q| q.0.token)
        }
    };

    let Some(token) = token else {
        return Err(ApiError::unauthorized("missing credentials"));
    };

    let user = ctx
        .store
        .user_by_token(&token)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("unknown credentials"))?;

    request.extensions_mut().insert(Identity {
        user_id: user.user_id,
        admin: user.admin,
    });
    Ok(next.run(request).await)
}

/// Guard for admin-only handlers.
pub fn require_admin(identity: &Identity) -> Result<(), ApiError> {
    if identity.admin {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_guard() {
        let user = Identity {
            user_id: "u".to_string(),
            admin: false,
        };
        assert!(require_admin(&user).is_err());

        let admin = Identity {
            user_id: "a".to_string(),
            admin: true,
        };
        assert!(require_admin(&admin).is_ok());
    }
}
