use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

/// One row of the aggregated per-course-per-day checkpoint table.
#[derive(Debug, Serialize, FromRow)]
pub struct MetricRow {
    pub app: String,
    pub metric_date: NaiveDate,
    pub course_id: String,
    pub course_name: Option<String>,
    pub section: Option<String>,
    pub primary_teacher_email: Option<String>,
    pub total_students: i64,
    pub total_submissions: i64,
    pub turned_in_submissions: i64,
    pub returned_submissions: i64,
    pub late_submissions: i64,
    pub avg_grade: Option<f64>,
    pub max_grade: Option<f64>,
    pub ingestion_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct CourseRow {
    pub course_id: String,
    pub course_name: Option<String>,
    pub section: Option<String>,
    pub primary_teacher_email: Option<String>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct TimeseriesPoint {
    pub metric_date: NaiveDate,
    pub total_students: i64,
    pub total_submissions: i64,
    pub turned_in_submissions: i64,
    pub returned_submissions: i64,
    pub late_submissions: i64,
    pub avg_grade: Option<f64>,
    pub max_grade: Option<f64>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct CourseMeta {
    pub course_id: String,
    pub course_name: Option<String>,
    pub section: Option<String>,
    pub primary_teacher_email: Option<String>,
    pub latest_metric_date: Option<NaiveDate>,
}

/// SUM/AVG/MAX rollup over a course's trailing window. All fields are
/// nullable: an empty window aggregates to NULLs, which is "no data",
/// not an error.
#[derive(Debug, Serialize, FromRow)]
pub struct WindowRollup {
    pub total_submissions: Option<i64>,
    pub turned_in_submissions: Option<i64>,
    pub returned_submissions: Option<i64>,
    pub late_submissions: Option<i64>,
    pub avg_grade: Option<f64>,
    pub max_grade: Option<f64>,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AssignmentRollup {
    pub course_work_id: String,
    pub course_work_title: Option<String>,
    pub first_assigned_time: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub submissions: i64,
    pub turned_in: i64,
    pub late_submissions: i64,
    pub avg_grade: Option<f64>,
    pub max_grade: Option<f64>,
}

// Import records built by the sync pipeline, one struct per warehouse table.

#[derive(Debug, Clone)]
pub struct CourseImport {
    pub course_id: String,
    pub name: Option<String>,
    pub section: Option<String>,
    pub description: Option<String>,
    pub room: Option<String>,
    pub owner_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub enrollment_code: Option<String>,
    pub course_state: Option<String>,
    pub alternate_link: Option<String>,
    pub ingestion_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EnrollmentImport {
    pub course_id: String,
    pub course_name: Option<String>,
    pub section: Option<String>,
    pub course_state: Option<String>,
    pub course_creation_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub role: String,
    pub primary_teacher: bool,
    pub domain: Option<String>,
    pub ingestion_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmissionImport {
    pub course_id: String,
    pub course_work_id: String,
    pub course_work_title: Option<String>,
    pub submission_id: String,
    pub student_id: Option<String>,
    pub student_email: Option<String>,
    pub state: Option<String>,
    pub assigned_time: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub late: Option<bool>,
    pub grade: Option<f64>,
    pub max_grade: Option<f64>,
    pub update_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub ingestion_time: DateTime<Utc>,
}

pub async fn checkpoint_rows(pool: &PgPool, app: &str, limit: i64) -> sqlx::Result<Vec<MetricRow>> {
    sqlx::query_as::<_, MetricRow>(
        r#"
        SELECT
            app,
            metric_date,
            course_id,
            course_name,
            section,
            primary_teacher_email,
            total_students,
            total_submissions,
            turned_in_submissions,
            returned_submissions,
            late_submissions,
            avg_grade,
            max_grade,
            ingestion_time
        FROM dashboard_metrics
        WHERE app = $1
        ORDER BY metric_date DESC, course_id
        LIMIT $2
        "#,
    )
    .bind(app)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Distinct courses known to the checkpoint, each carrying the attributes
/// of its latest metric row. Ordered by name then id so the frontend's
/// "first course is the default selection" is deterministic.
pub async fn list_courses(pool: &PgPool, app: &str) -> sqlx::Result<Vec<CourseRow>> {
    sqlx::query_as::<_, CourseRow>(
        r#"
        SELECT course_id, course_name, section, primary_teacher_email
        FROM (
            SELECT DISTINCT ON (course_id)
                course_id, course_name, section, primary_teacher_email
            FROM dashboard_metrics
            WHERE app = $1
            ORDER BY course_id, metric_date DESC
        ) c
        ORDER BY course_name NULLS LAST, course_id
        "#,
    )
    .bind(app)
    .fetch_all(pool)
    .await
}

/// Rows in the trailing `days`-day window anchored at the app's latest
/// ingested metric date. A never-synced app or unknown course simply
/// matches nothing.
pub async fn course_timeseries(
    pool: &PgPool,
    app: &str,
    course_id: &str,
    days: i32,
) -> sqlx::Result<Vec<TimeseriesPoint>> {
    sqlx::query_as::<_, TimeseriesPoint>(
        r#"
        SELECT
            metric_date,
            total_students,
            total_submissions,
            turned_in_submissions,
            returned_submissions,
            late_submissions,
            avg_grade,
            max_grade
        FROM dashboard_metrics
        WHERE app = $1
          AND course_id = $2
          AND metric_date > (SELECT MAX(metric_date) FROM dashboard_metrics WHERE app = $1) - $3::int
        ORDER BY metric_date
        "#,
    )
    .bind(app)
    .bind(course_id)
    .bind(days)
    .fetch_all(pool)
    .await
}

pub async fn course_meta(
    pool: &PgPool,
    app: &str,
    course_id: &str,
) -> sqlx::Result<Option<CourseMeta>> {
    sqlx::query_as::<_, CourseMeta>(
        r#"
        SELECT
            course_id,
            course_name,
            section,
            primary_teacher_email,
            MAX(metric_date) OVER () AS latest_metric_date
        FROM dashboard_metrics
        WHERE app = $1
          AND course_id = $2
        ORDER BY metric_date DESC
        LIMIT 1
        "#,
    )
    .bind(app)
    .bind(course_id)
    .fetch_optional(pool)
    .await
}

pub async fn course_window_rollup(
    pool: &PgPool,
    app: &str,
    course_id: &str,
    days: i32,
) -> sqlx::Result<WindowRollup> {
    sqlx::query_as::<_, WindowRollup>(
        r#"
        SELECT
            SUM(total_submissions)::bigint      AS total_submissions,
            SUM(turned_in_submissions)::bigint  AS turned_in_submissions,
            SUM(returned_submissions)::bigint   AS returned_submissions,
            SUM(late_submissions)::bigint       AS late_submissions,
            AVG(avg_grade)                      AS avg_grade,
            MAX(max_grade)                      AS max_grade,
            MIN(metric_date)                    AS window_start,
            MAX(metric_date)                    AS window_end
        FROM dashboard_metrics
        WHERE app = $1
          AND course_id = $2
          AND metric_date > (SELECT MAX(metric_date) FROM dashboard_metrics WHERE app = $1) - $3::int
        "#,
    )
    .bind(app)
    .bind(course_id)
    .bind(days)
    .fetch_one(pool)
    .await
}

pub async fn recent_assignments(
    pool: &PgPool,
    course_id: &str,
) -> sqlx::Result<Vec<AssignmentRollup>> {
    sqlx::query_as::<_, AssignmentRollup>(
        r#"
        SELECT
            course_work_id,
            MAX(course_work_title)                   AS course_work_title,
            MIN(assigned_time)                       AS first_assigned_time,
            MAX(due_time)                            AS due_time,
            COUNT(*)                                 AS submissions,
            COUNT(*) FILTER (WHERE state = 'TURNED_IN') AS turned_in,
            COUNT(*) FILTER (WHERE late)             AS late_submissions,
            AVG(grade)                               AS avg_grade,
            MAX(max_grade)                           AS max_grade
        FROM classroom_submissions
        WHERE course_id = $1
        GROUP BY course_work_id
        ORDER BY due_time DESC NULLS LAST
        LIMIT 20
        "#,
    )
    .bind(course_id)
    .fetch_all(pool)
    .await
}

/// Replaces `classroom_courses` wholesale. Delete and insert share one
/// transaction, so readers never observe a half-loaded table.
pub async fn replace_courses(pool: &PgPool, rows: &[CourseImport]) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM classroom_courses")
        .execute(&mut *tx)
        .await?;
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO classroom_courses (
                course_id, name, section, description, room, owner_id,
                creation_time, update_time, enrollment_code, course_state,
                alternate_link, ingestion_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&r.course_id)
        .bind(&r.name)
        .bind(&r.section)
        .bind(&r.description)
        .bind(&r.room)
        .bind(&r.owner_id)
        .bind(r.creation_time)
        .bind(r.update_time)
        .bind(&r.enrollment_code)
        .bind(&r.course_state)
        .bind(&r.alternate_link)
        .bind(r.ingestion_time)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

pub async fn replace_enrollments(pool: &PgPool, rows: &[EnrollmentImport]) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM classroom_enrollments")
        .execute(&mut *tx)
        .await?;
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO classroom_enrollments (
                course_id, course_name, section, course_state, course_creation_time,
                user_id, user_email, role, primary_teacher, domain, ingestion_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&r.course_id)
        .bind(&r.course_name)
        .bind(&r.section)
        .bind(&r.course_state)
        .bind(r.course_creation_time)
        .bind(&r.user_id)
        .bind(&r.user_email)
        .bind(&r.role)
        .bind(r.primary_teacher)
        .bind(&r.domain)
        .bind(r.ingestion_time)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

pub async fn replace_submissions(pool: &PgPool, rows: &[SubmissionImport]) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM classroom_submissions")
        .execute(&mut *tx)
        .await?;
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO classroom_submissions (
                course_id, course_work_id, course_work_title, submission_id,
                student_id, student_email, state, assigned_time, due_time, late,
                grade, max_grade, update_time, creation_time, ingestion_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&r.course_id)
        .bind(&r.course_work_id)
        .bind(&r.course_work_title)
        .bind(&r.submission_id)
        .bind(&r.student_id)
        .bind(&r.student_email)
        .bind(&r.state)
        .bind(r.assigned_time)
        .bind(r.due_time)
        .bind(r.late)
        .bind(r.grade)
        .bind(r.max_grade)
        .bind(r.update_time)
        .bind(r.creation_time)
        .bind(r.ingestion_time)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

/// Rebuilds the app's slice of `dashboard_metrics` from the source tables.
/// Submission counters and roster facts are aggregated separately before
/// the join; joining first would count each submission once per enrollment
/// row. Returns the number of rows written.
pub async fn refresh_dashboard(pool: &PgPool, app: &str) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM dashboard_metrics WHERE app = $1")
        .bind(app)
        .execute(&mut *tx)
        .await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO dashboard_metrics (
            app, metric_date, course_id, course_name, section, primary_teacher_email,
            total_students, total_submissions, turned_in_submissions,
            returned_submissions, late_submissions, avg_grade, max_grade, ingestion_time
        )
        WITH daily AS (
            SELECT
                course_id,
                (assigned_time AT TIME ZONE 'UTC')::date            AS metric_date,
                COUNT(*)                                            AS total_submissions,
                COUNT(*) FILTER (WHERE state = 'TURNED_IN')         AS turned_in_submissions,
                COUNT(*) FILTER (WHERE state = 'RETURNED')          AS returned_submissions,
                COUNT(*) FILTER (WHERE late)                        AS late_submissions,
                AVG(grade)                                          AS avg_grade,
                MAX(max_grade)                                      AS max_grade
            FROM classroom_submissions
            WHERE assigned_time IS NOT NULL
            GROUP BY course_id, (assigned_time AT TIME ZONE 'UTC')::date
        ),
        roster AS (
            SELECT
                course_id,
                MAX(course_name) AS course_name,
                MAX(section)     AS section,
                COALESCE(
                    MAX(user_email) FILTER (WHERE role = 'OWNER'),
                    MAX(user_email) FILTER (WHERE role = 'TEACHER')
                ) AS primary_teacher_email,
                COUNT(DISTINCT user_id) FILTER (WHERE role = 'STUDENT') AS total_students
            FROM classroom_enrollments
            GROUP BY course_id
        )
        SELECT
            $1,
            d.metric_date,
            d.course_id,
            r.course_name,
            r.section,
            r.primary_teacher_email,
            COALESCE(r.total_students, 0),
            d.total_submissions,
            d.turned_in_submissions,
            d.returned_submissions,
            d.late_submissions,
            d.avg_grade,
            d.max_grade,
            now()
        FROM daily d
        LEFT JOIN roster r USING (course_id)
        "#,
    )
    .bind(app)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(inserted.rows_affected())
}

/// Executes an already-guarded SELECT inside a read-only transaction with
/// a server-side statement timeout, capped at `cap` rows. Rows come back
/// as JSON objects so the caller never needs to know the column set the
/// model picked.
pub async fn run_checkpoint_query(
    pool: &PgPool,
    sql: &str,
    cap: i64,
    timeout: Duration,
) -> sqlx::Result<Vec<serde_json::Value>> {
    let wrapped = format!(
        "SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) \
         FROM (SELECT * FROM ({sql}) s LIMIT {cap}) q"
    );

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    // SET does not take bind parameters; the value is a trusted integer.
    sqlx::query(&format!(
        "SET LOCAL statement_timeout = {}",
        timeout.as_millis()
    ))
    .execute(&mut *tx)
    .await?;

    let value: serde_json::Value = sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await?;
    tx.commit().await?;

    match value {
        serde_json::Value::Array(rows) => Ok(rows),
        _ => Ok(Vec::new()),
    }
}

/// True when the error is Postgres canceling a statement for exceeding
/// `statement_timeout` (SQLSTATE 57014).
pub fn is_statement_timeout(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "57014")
        .unwrap_or(false)
}
