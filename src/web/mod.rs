pub mod analytics;
pub mod error;
pub mod query;
pub mod sync;

use crate::state::SharedState;
use crate::web::error::ApiError;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

/// The only application the warehouse currently knows about.
pub const DEFAULT_APP: &str = "classroom";

pub(crate) fn ensure_supported_app(app: &str) -> Result<(), ApiError> {
    if app != DEFAULT_APP {
        return Err(ApiError::Validation(format!("Unsupported app: {app}")));
    }
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Backend is running",
        "service": "CloudReign backend",
    }))
}

async fn health() -> &'static str {
    "OK"
}

pub fn routes(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/sync", sync::router(state.clone()))
        .nest("/query", query::router(state.clone()))
        .nest("/ai", query::ai_router(state.clone()))
        .nest("/analytics", analytics::router(state))
}
