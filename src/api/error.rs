//! API error taxonomy
//!
//! Maps domain errors onto the HTTP conventions: 400 validation, 401/403
//! auth, 404 missing, 409 state conflict, 429 rate cap (with Retry-After),
//! 503 broker unavailable, 500 unexpected. Sandbox failures never surface
//! here — they stay per-target logs.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::mapper::ConfigWriteError;
use crate::mqtt::PublishError;
use crate::store::StoreError;

/// Error type returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    fn build(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::build(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::build(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::build(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::build(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::build(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        let mut err = Self::build(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message);
        err.retry_after = Some(retry_after_secs);
        err
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::build(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::build(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });

        let mut response = (self.status, axum::Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QueryTooShort => Self::bad_request(err.to_string()),
            StoreError::NotFound => Self::not_found("no such record"),
            StoreError::IllegalTransition { .. } => Self::conflict(err.to_string()),
            StoreError::Db(_) | StoreError::Serde(_) => {
                tracing::error!(error = %err, "Store failure");
                Self::internal("storage failure")
            }
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::UnknownBroker(_) | PublishError::NotAllowed { .. } => {
                Self::bad_request(err.to_string())
            }
            PublishError::Unavailable(_) => Self::unavailable(err.to_string()),
        }
    }
}

impl From<ConfigWriteError> for ApiError {
    fn from(err: ConfigWriteError) -> Self {
        match err {
            ConfigWriteError::Invalid(e) => Self::bad_request(e.to_string()),
            ConfigWriteError::Store(e) => e.into(),
        }
    }
}
