use crate::state::SharedState;
use crate::sync;
use crate::web::{ensure_supported_app, error::ApiError, DEFAULT_APP};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct SyncRequest {
    pub app: String,
}

/// Response shape of the single-step triggers, mirroring the full
/// report's per-step entries.
#[derive(Serialize)]
struct StepResponse {
    status: &'static str,
    task: &'static str,
    rows_loaded: u64,
    error: Option<String>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/app", post(sync_app))
        .route("/classroom/courses", post(sync_courses_step))
        .route("/classroom/enrollments", post(sync_enrollments_step))
        .route("/classroom/submissions", post(sync_submissions_step))
        .route("/classroom/dashboard", post(sync_dashboard_step))
        .with_state(state)
}

/// Full pipeline for the named app. The report carries one entry per
/// step; `status` is "ok" only when every step succeeded.
async fn sync_app(
    State(state): State<SharedState>,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_supported_app(&req.app)?;

    let report = sync::run_sync(&state, &req.app).await;
    let code = if report.all_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((code, Json(report)))
}

async fn sync_courses_step(State(state): State<SharedState>) -> impl IntoResponse {
    let result = sync::sync_courses(&state.pool, state.classroom.as_ref()).await;
    step_response("classroom_courses", result)
}

async fn sync_enrollments_step(State(state): State<SharedState>) -> impl IntoResponse {
    let result = sync::sync_enrollments(&state.pool, state.classroom.as_ref()).await;
    step_response("classroom_enrollments", result)
}

async fn sync_submissions_step(State(state): State<SharedState>) -> impl IntoResponse {
    let result = sync::sync_submissions(&state.pool, state.classroom.as_ref()).await;
    step_response("classroom_submissions", result)
}

async fn sync_dashboard_step(State(state): State<SharedState>) -> impl IntoResponse {
    let result = sync::refresh_dashboard(&state.pool, DEFAULT_APP).await;
    step_response("dashboard_metrics", result)
}

fn step_response(
    task: &'static str,
    result: anyhow::Result<u64>,
) -> (StatusCode, Json<StepResponse>) {
    match result {
        Ok(rows) => (
            StatusCode::OK,
            Json(StepResponse {
                status: "ok",
                task,
                rows_loaded: rows,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!(task, error = %e, "sync step endpoint failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StepResponse {
                    status: "error",
                    task,
                    rows_loaded: 0,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
