use crate::db;
use crate::state::SharedState;
use crate::web::{ensure_supported_app, error::ApiError, DEFAULT_APP};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

const MAX_WINDOW_DAYS: i32 = 365;

fn default_app() -> String {
    DEFAULT_APP.to_string()
}

fn default_days() -> i32 {
    30
}

#[derive(Deserialize)]
pub struct CourseWindowRequest {
    #[serde(default = "default_app")]
    pub app: String,
    pub course_id: String,
    #[serde(default = "default_days")]
    pub days: i32,
}

#[derive(Serialize)]
pub struct CoursesResponse {
    pub status: &'static str,
    pub row_count: usize,
    pub courses: Vec<db::CourseRow>,
}

#[derive(Serialize)]
pub struct TimeseriesResponse {
    pub status: &'static str,
    pub app: String,
    pub course_id: String,
    pub row_count: usize,
    pub data: Vec<db::TimeseriesPoint>,
}

#[derive(Serialize)]
pub struct CourseDetailResponse {
    pub status: &'static str,
    pub app: String,
    pub course_id: String,
    pub days: i32,
    pub course: Option<db::CourseMeta>,
    pub metrics_window: db::WindowRollup,
    pub recent_assignments: Vec<db::AssignmentRollup>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/courses", get(courses))
        .route("/course_timeseries", post(course_timeseries))
        .route("/course_detail", post(course_detail))
        .with_state(state)
}

fn validate_days(days: i32) -> Result<(), ApiError> {
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(ApiError::Validation(format!(
            "days must be between 1 and {MAX_WINDOW_DAYS}"
        )));
    }
    Ok(())
}

/// Course dropdown source. A never-synced app yields an empty list, not
/// an error.
async fn courses(State(state): State<SharedState>) -> Result<Json<CoursesResponse>, ApiError> {
    let courses = db::list_courses(&state.pool, DEFAULT_APP).await?;
    Ok(Json(CoursesResponse {
        status: "ok",
        row_count: courses.len(),
        courses,
    }))
}

/// Daily rows for one course over the trailing window. Days with no
/// activity are simply absent; an unknown course yields empty data.
async fn course_timeseries(
    State(state): State<SharedState>,
    Json(req): Json<CourseWindowRequest>,
) -> Result<Json<TimeseriesResponse>, ApiError> {
    ensure_supported_app(&req.app)?;
    validate_days(req.days)?;

    let data = db::course_timeseries(&state.pool, &req.app, &req.course_id, req.days).await?;

    Ok(Json(TimeseriesResponse {
        status: "ok",
        app: req.app,
        course_id: req.course_id,
        row_count: data.len(),
        data,
    }))
}

/// Metadata, a windowed rollup and recent assignments for one course.
/// Unknown course: `course` is null and the rollup aggregates nothing.
async fn course_detail(
    State(state): State<SharedState>,
    Json(req): Json<CourseWindowRequest>,
) -> Result<Json<CourseDetailResponse>, ApiError> {
    ensure_supported_app(&req.app)?;
    validate_days(req.days)?;

    let course = db::course_meta(&state.pool, &req.app, &req.course_id).await?;
    let metrics_window =
        db::course_window_rollup(&state.pool, &req.app, &req.course_id, req.days).await?;
    let recent_assignments = db::recent_assignments(&state.pool, &req.course_id).await?;

    Ok(Json(CourseDetailResponse {
        status: "ok",
        app: req.app,
        course_id: req.course_id,
        days: req.days,
        course,
        metrics_window,
        recent_assignments,
    }))
}
