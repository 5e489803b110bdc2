use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Throttling, pool exhaustion or a dropped connection. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("batch of {requested} keys exceeds the {max} key limit")]
    BatchTooLarge { requested: usize, max: usize },

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                // serialization_failure, deadlock_detected, too_many_connections
                let transient = matches!(
                    db_err.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("53300")
                );
                if transient {
                    StoreError::Unavailable(err.to_string())
                } else {
                    StoreError::Database(err)
                }
            }
            _ => StoreError::Database(err),
        }
    }
}

/// Failures talking to the music API or its accounts service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("malformed upstream payload: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot refresh access token for user {user_id}: no refresh token stored")]
    MissingRefreshToken { user_id: String },

    #[error("token exchange rejected for user {user_id}: {source}")]
    Exchange {
        user_id: String,
        #[source]
        source: UpstreamError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whole-user failure of an ingestion cycle.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to fetch listening history: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Error returned by HTTP handlers. Rendered as
/// `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
            ),
            AppError::Store(e) => {
                tracing::error!("store error: {e}");
                let status = if e.is_transient() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, "STORE_ERROR", "A storage error occurred".to_string())
            }
            AppError::Auth(e) => {
                tracing::warn!("auth error: {e}");
                (StatusCode::UNAUTHORIZED, "AUTH_ERROR", e.to_string())
            }
            AppError::Upstream(e) => {
                tracing::error!("upstream error: {e}");
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
