use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Everything a handler can fail with, mapped onto the wire contract:
/// non-2xx status plus `{status: "error", message}`. Messages are for the
/// end user; database and internal detail goes to the log only.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Translation(String),
    #[error("{0}")]
    Upstream(String),
    #[error("query execution failed")]
    Execution(#[source] sqlx::Error),
    #[error("query timed out")]
    Timeout,
    #[error("too many requests, slow down")]
    RateLimited,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Translation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Execution(e) => {
                tracing::error!(error = %e, "generated query failed to execute");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "query execution failed".to_string(),
                )
            }
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "query timed out".to_string()),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "too many requests, slow down".to_string(),
            ),
            ApiError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}
