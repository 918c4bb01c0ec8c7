//! Error types shared across the realtime hub, stores, scheduler and REST layer.
//!
//! `HubError` is the only error whose `Display` reaches a websocket client, so its
//! messages are written for clients. Internal details ride in `Internal` and are
//! logged, never rendered.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors returned by websocket message handlers and the read loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Envelope or payload could not be decoded / failed validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No handler is registered for this message type.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Inbound frame exceeded the configured size ceiling.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Per-connection rate limit exceeded for the current window.
    #[error("Rate limit exceeded, slow down")]
    RateLimited,

    /// Caller is not allowed to act on the target (e.g. not a conversation member).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Anything else. The detail is for logs only.
    #[error("Internal error")]
    Internal(String),
}

impl HubError {
    /// Stable machine-readable code sent alongside the error text.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidMessage(_) => "invalid_message",
            HubError::UnknownType(_) => "unknown_type",
            HubError::MessageTooLarge { .. } => "message_too_large",
            HubError::RateLimited => "rate_limited",
            HubError::Forbidden(_) => "forbidden",
            HubError::NotFound(_) => "not_found",
            HubError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => HubError::NotFound(what),
            other => HubError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::InvalidMessage(err.to_string())
    }
}

/// Errors raised by the persistence adapters (SQLite, in-memory stores).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("DB lock poisoned")]
    LockPoisoned,

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store cannot be reached (used by adapters and test doubles).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}

/// Errors raised by the broadcast scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The send pipeline rejected or failed the fan-out.
    #[error("Send pipeline failed: {0}")]
    Pipeline(String),
}

/// Errors returned from REST handlers. Rendered as `{ "error": ..., "code": ... }`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("Not found: {}", what)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(error = %detail, "REST request failed");
        }
        let (status, code) = self.status_and_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "code": code,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_hides_detail() {
        let err = HubError::Internal("no such table: messages".to_string());
        assert_eq!(err.to_string(), "Internal error");
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_store_not_found_maps_to_hub_not_found() {
        let err: HubError = StoreError::NotFound("conversation conv-1".to_string()).into();
        assert_eq!(err, HubError::NotFound("conversation conv-1".to_string()));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
