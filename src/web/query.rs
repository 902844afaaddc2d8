use crate::db;
use crate::domain::sql_guard;
use crate::middleware::RateLimiter;
use crate::state::SharedState;
use crate::web::{ensure_supported_app, error::ApiError, DEFAULT_APP};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// NL queries spend model tokens; 20 per IP per minute is plenty for a
/// human clicking a query box.
pub static QUERY_RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(|| RateLimiter::new(20, 60));

/// Hard ceiling for `/query/checkpoint`, independent of the NL path cap.
const CHECKPOINT_MAX_LIMIT: i64 = 500;

/// Extra wall-clock allowance on top of the server-side statement
/// timeout, so Postgres normally cancels first and we report it cleanly.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

fn default_app() -> String {
    DEFAULT_APP.to_string()
}

fn default_max_rows() -> i64 {
    100
}

fn default_limit() -> i64 {
    50
}

#[derive(Deserialize)]
pub struct QueryRunRequest {
    #[serde(default = "default_app")]
    pub app: String,
    pub question: String,
    #[serde(default = "default_max_rows")]
    pub max_rows: i64,
}

#[derive(Serialize)]
pub struct QueryRunResponse {
    pub status: &'static str,
    pub app: String,
    pub question: String,
    pub sql: String,
    pub row_count: usize,
    pub data: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct CheckpointRequest {
    #[serde(default = "default_app")]
    pub app: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Serialize)]
pub struct CheckpointResponse {
    pub status: &'static str,
    pub app: String,
    pub row_count: usize,
    pub data: Vec<db::MetricRow>,
}

#[derive(Deserialize)]
pub struct AiTestRequest {
    pub prompt: String,
}

#[derive(Serialize)]
pub struct AiTestResponse {
    pub status: &'static str,
    pub answer: String,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/run", post(query_run))
        .route("/checkpoint", post(query_checkpoint))
        .with_state(state)
}

pub fn ai_router(state: SharedState) -> Router {
    Router::new().route("/test", post(ai_test)).with_state(state)
}

/// Natural language → SQL → checkpoint table. The generated statement
/// must pass the guard before anything touches Postgres, and execution is
/// read-only, row-capped and time-bounded.
async fn query_run(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<QueryRunRequest>,
) -> Result<Json<QueryRunResponse>, ApiError> {
    if !QUERY_RATE_LIMITER.allow(&client_ip(&headers)).await {
        return Err(ApiError::RateLimited);
    }

    ensure_supported_app(&req.app)?;
    let question = req.question.trim();
    if question.is_empty() {
        return Err(ApiError::Validation("question must not be empty".into()));
    }

    let cap = sql_guard::clamp_limit(req.max_rows, state.query.max_rows);

    let raw = state
        .ai
        .generate_sql(&req.app, question, cap)
        .await
        .map_err(|e| ApiError::Translation(format!("could not translate question: {e}")))?;

    let sql = sql_guard::validate_select(&raw)
        .map_err(|e| ApiError::Validation(format!("generated SQL rejected: {e}")))?;
    tracing::info!(%sql, question, "running generated query");

    let budget = state.query.timeout + TIMEOUT_MARGIN;
    let execution = db::run_checkpoint_query(&state.pool, &sql, cap, state.query.timeout);
    let data = match tokio::time::timeout(budget, execution).await {
        Err(_) => return Err(ApiError::Timeout),
        Ok(Err(e)) if db::is_statement_timeout(&e) => return Err(ApiError::Timeout),
        Ok(Err(e)) => return Err(ApiError::Execution(e)),
        Ok(Ok(rows)) => rows,
    };

    Ok(Json(QueryRunResponse {
        status: "ok",
        app: req.app,
        question: question.to_string(),
        sql,
        row_count: data.len(),
        data,
    }))
}

/// Plain read of the newest checkpoint rows, newest metric date first.
async fn query_checkpoint(
    State(state): State<SharedState>,
    Json(req): Json<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    ensure_supported_app(&req.app)?;

    let limit = sql_guard::clamp_limit(req.limit, CHECKPOINT_MAX_LIMIT);
    let data = db::checkpoint_rows(&state.pool, &req.app, limit).await?;

    Ok(Json(CheckpointResponse {
        status: "ok",
        app: req.app,
        row_count: data.len(),
        data,
    }))
}

/// Sends a prompt straight to the chat model. Lets an operator check the
/// key and model wiring without involving the SQL path.
async fn ai_test(
    State(state): State<SharedState>,
    Json(req): Json<AiTestRequest>,
) -> Result<Json<AiTestResponse>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".into()));
    }

    let answer = state
        .ai
        .generate_text(&req.prompt)
        .await
        .map_err(|e| ApiError::Upstream(format!("model request failed: {e}")))?;

    Ok(Json(AiTestResponse {
        status: "ok",
        answer,
    }))
}

/// Best-effort client identity for rate limiting: first hop of
/// X-Forwarded-For when behind a proxy, else a shared bucket.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_without_header() {
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
