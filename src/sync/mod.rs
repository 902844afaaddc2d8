//! The Classroom → warehouse sync pipeline.
//!
//! Four steps run in order: courses, enrollments, submissions, dashboard
//! refresh. Each step replaces its table inside one transaction, so
//! re-running the pipeline can never duplicate rows and readers only ever
//! see a complete table. A failed step is recorded in the report and the
//! remaining steps still run.

use crate::db::{self, CourseImport, EnrollmentImport, SubmissionImport};
use crate::services::classroom::{due_timestamp, ClassroomSource, Course, Member};
use crate::state::SharedState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use uuid::Uuid;

/// Concurrent per-course submission fetches. The Classroom API tolerates
/// some parallelism but not a stampede across a whole district.
const COURSE_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub ok: bool,
    pub rows: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncSteps {
    pub courses: StepReport,
    pub enrollments: StepReport,
    pub submissions: StepReport,
    pub dashboard: StepReport,
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub status: String,
    pub app: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub steps: SyncSteps,
}

impl SyncReport {
    pub fn all_ok(&self) -> bool {
        self.steps.courses.ok
            && self.steps.enrollments.ok
            && self.steps.submissions.ok
            && self.steps.dashboard.ok
    }
}

async fn run_step<F, Fut>(name: &'static str, step: F) -> StepReport
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    match step().await {
        Ok(rows) => {
            tracing::info!(step = name, rows, "sync step finished");
            StepReport {
                ok: true,
                rows,
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(step = name, error = %e, "sync step failed");
            StepReport {
                ok: false,
                rows: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Runs the whole pipeline for `app`. Overlapping invocations queue on
/// the state's sync lock rather than erroring.
pub async fn run_sync(state: &SharedState, app: &str) -> SyncReport {
    let _guard = state.sync_lock.lock().await;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    tracing::info!(%run_id, app, "sync started");

    let source = state.classroom.as_ref();
    let courses = run_step("courses", || sync_courses(&state.pool, source)).await;
    let enrollments = run_step("enrollments", || sync_enrollments(&state.pool, source)).await;
    let submissions = run_step("submissions", || sync_submissions(&state.pool, source)).await;
    let dashboard = run_step("dashboard", || refresh_dashboard(&state.pool, app)).await;

    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds() as f64;
    let steps = SyncSteps {
        courses,
        enrollments,
        submissions,
        dashboard,
    };
    let all_ok = steps.courses.ok && steps.enrollments.ok && steps.submissions.ok && steps.dashboard.ok;

    tracing::info!(%run_id, app, ok = all_ok, duration_ms, "sync finished");

    SyncReport {
        status: if all_ok { "ok" } else { "error" }.to_string(),
        app: app.to_string(),
        run_id,
        started_at,
        finished_at,
        duration_ms,
        steps,
    }
}

pub async fn sync_courses(pool: &PgPool, source: &dyn ClassroomSource) -> Result<u64> {
    let now = Utc::now();
    let rows = collect_course_rows(source, now).await?;
    db::replace_courses(pool, &rows).await
}

pub async fn sync_enrollments(pool: &PgPool, source: &dyn ClassroomSource) -> Result<u64> {
    let now = Utc::now();
    let rows = collect_enrollment_rows(source, now).await?;
    db::replace_enrollments(pool, &rows).await
}

pub async fn sync_submissions(pool: &PgPool, source: &dyn ClassroomSource) -> Result<u64> {
    let now = Utc::now();
    let rows = collect_submission_rows(source, now).await?;
    db::replace_submissions(pool, &rows).await
}

pub async fn refresh_dashboard(pool: &PgPool, app: &str) -> Result<u64> {
    db::refresh_dashboard(pool, app).await
}

pub(crate) async fn collect_course_rows(
    source: &dyn ClassroomSource,
    now: DateTime<Utc>,
) -> Result<Vec<CourseImport>> {
    let courses = source.list_courses().await?;
    tracing::debug!(count = courses.len(), "fetched courses");
    Ok(courses
        .into_iter()
        .map(|c| CourseImport {
            course_id: c.id,
            name: c.name,
            section: c.section,
            description: c.description,
            room: c.room,
            owner_id: c.owner_id,
            creation_time: c.creation_time,
            update_time: c.update_time,
            enrollment_code: c.enrollment_code,
            course_state: c.course_state,
            alternate_link: c.alternate_link,
            ingestion_time: now,
        })
        .collect())
}

/// Builds enrollment rows for every course. A roster fetch failing for
/// one course (archived, access revoked) skips that course, it does not
/// fail the step.
pub(crate) async fn collect_enrollment_rows(
    source: &dyn ClassroomSource,
    now: DateTime<Utc>,
) -> Result<Vec<EnrollmentImport>> {
    let courses = source.list_courses().await?;
    let mut rows = Vec::new();

    for course in &courses {
        match source.list_students(&course.id).await {
            Ok(students) => {
                for s in students {
                    rows.push(enrollment_row(course, &s, "STUDENT", false, now));
                }
            }
            Err(e) => {
                tracing::warn!(course_id = %course.id, error = %e, "student roster fetch failed");
            }
        }

        match source.list_teachers(&course.id).await {
            Ok(teachers) => {
                for t in teachers {
                    let is_owner = match (&course.owner_id, t.resolved_user_id()) {
                        (Some(owner), Some(user)) => *owner == user,
                        _ => false,
                    };
                    let role = if is_owner { "OWNER" } else { "TEACHER" };
                    rows.push(enrollment_row(course, &t, role, is_owner, now));
                }
            }
            Err(e) => {
                tracing::warn!(course_id = %course.id, error = %e, "teacher roster fetch failed");
            }
        }
    }

    tracing::debug!(count = rows.len(), "built enrollment rows");
    Ok(rows)
}

fn enrollment_row(
    course: &Course,
    member: &Member,
    role: &str,
    primary_teacher: bool,
    now: DateTime<Utc>,
) -> EnrollmentImport {
    let email = member.email();
    let domain = email
        .as_deref()
        .and_then(|e| e.split_once('@'))
        .map(|(_, d)| d.to_string());

    EnrollmentImport {
        course_id: course.id.clone(),
        course_name: course.name.clone(),
        section: course.section.clone(),
        course_state: course.course_state.clone(),
        course_creation_time: course.creation_time,
        user_id: member.resolved_user_id(),
        user_email: email,
        role: role.to_string(),
        primary_teacher,
        domain,
        ingestion_time: now,
    }
}

/// Walks courses → course work → student submissions. Courses are fetched
/// with bounded parallelism; any per-course failure fails the step, since
/// a partially collected submissions table would skew every aggregate
/// built from it.
pub(crate) async fn collect_submission_rows(
    source: &dyn ClassroomSource,
    now: DateTime<Utc>,
) -> Result<Vec<SubmissionImport>> {
    let courses = source.list_courses().await?;

    let per_course: Vec<Result<Vec<SubmissionImport>>> = futures::stream::iter(
        courses
            .into_iter()
            .map(|course| async move { course_submission_rows(source, course, now).await }),
    )
    .buffer_unordered(COURSE_FETCH_CONCURRENCY)
    .collect()
    .await;

    let mut rows = Vec::new();
    for result in per_course {
        rows.append(&mut result?);
    }
    tracing::debug!(count = rows.len(), "built submission rows");
    Ok(rows)
}

async fn course_submission_rows(
    source: &dyn ClassroomSource,
    course: Course,
    now: DateTime<Utc>,
) -> Result<Vec<SubmissionImport>> {
    let mut rows = Vec::new();
    let course_work = source.list_course_work(&course.id).await?;

    for cw in course_work {
        let due = due_timestamp(cw.due_date, cw.due_time);
        let submissions = source.list_submissions(&course.id, &cw.id).await?;
        for s in submissions {
            rows.push(SubmissionImport {
                course_id: course.id.clone(),
                course_work_id: cw.id.clone(),
                course_work_title: cw.title.clone(),
                submission_id: s.id,
                student_id: s.user_id,
                // Joined from enrollments downstream when needed.
                student_email: None,
                state: s.state,
                assigned_time: cw.creation_time,
                due_time: due,
                late: s.late,
                grade: s.assigned_grade,
                max_grade: cw.max_points,
                update_time: s.update_time,
                creation_time: s.creation_time,
                ingestion_time: now,
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::classroom::{CourseWork, StudentSubmission};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeClassroom {
        courses: Vec<Course>,
        students: HashMap<String, Vec<Member>>,
        teachers: HashMap<String, Vec<Member>>,
        course_work: HashMap<String, Vec<CourseWork>>,
        submissions: HashMap<(String, String), Vec<StudentSubmission>>,
        broken_rosters: bool,
    }

    #[async_trait]
    impl ClassroomSource for FakeClassroom {
        async fn list_courses(&self) -> Result<Vec<Course>> {
            Ok(self.courses.clone())
        }

        async fn list_students(&self, course_id: &str) -> Result<Vec<Member>> {
            if self.broken_rosters {
                return Err(anyhow!("roster access denied"));
            }
            Ok(self.students.get(course_id).cloned().unwrap_or_default())
        }

        async fn list_teachers(&self, course_id: &str) -> Result<Vec<Member>> {
            if self.broken_rosters {
                return Err(anyhow!("roster access denied"));
            }
            Ok(self.teachers.get(course_id).cloned().unwrap_or_default())
        }

        async fn list_course_work(&self, course_id: &str) -> Result<Vec<CourseWork>> {
            Ok(self.course_work.get(course_id).cloned().unwrap_or_default())
        }

        async fn list_submissions(
            &self,
            course_id: &str,
            course_work_id: &str,
        ) -> Result<Vec<StudentSubmission>> {
            Ok(self
                .submissions
                .get(&(course_id.to_string(), course_work_id.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn course(id: &str, owner: &str) -> Course {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("Course {id}"),
            "section": "A",
            "ownerId": owner,
            "courseState": "ACTIVE"
        }))
        .unwrap()
    }

    fn member(id: &str, email: &str) -> Member {
        serde_json::from_value(json!({
            "userId": id,
            "profile": {"id": id, "emailAddress": email}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn enrollment_rows_map_roles_and_domains() {
        let mut fake = FakeClassroom {
            courses: vec![course("c1", "t-owner")],
            ..Default::default()
        };
        fake.students
            .insert("c1".into(), vec![member("s1", "kid@school.edu")]);
        fake.teachers.insert(
            "c1".into(),
            vec![
                member("t-owner", "owner@school.edu"),
                member("t2", "helper@school.edu"),
            ],
        );

        let rows = collect_enrollment_rows(&fake, Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 3);

        let student = rows.iter().find(|r| r.role == "STUDENT").unwrap();
        assert_eq!(student.domain.as_deref(), Some("school.edu"));
        assert!(!student.primary_teacher);

        let owner = rows.iter().find(|r| r.role == "OWNER").unwrap();
        assert_eq!(owner.user_email.as_deref(), Some("owner@school.edu"));
        assert!(owner.primary_teacher);

        let teacher = rows.iter().find(|r| r.role == "TEACHER").unwrap();
        assert_eq!(teacher.user_id.as_deref(), Some("t2"));
        assert!(!teacher.primary_teacher);
    }

    #[tokio::test]
    async fn broken_rosters_skip_courses_without_failing() {
        let fake = FakeClassroom {
            courses: vec![course("c1", "t-owner")],
            broken_rosters: true,
            ..Default::default()
        };
        let rows = collect_enrollment_rows(&fake, Utc::now()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn submission_rows_carry_course_work_facts() {
        let mut fake = FakeClassroom {
            courses: vec![course("c1", "t-owner")],
            ..Default::default()
        };
        fake.course_work.insert(
            "c1".into(),
            vec![serde_json::from_value(json!({
                "id": "cw1",
                "title": "Homework 3",
                "creationTime": "2025-10-01T12:00:00Z",
                "dueDate": {"year": 2025, "month": 10, "day": 8},
                "maxPoints": 100.0
            }))
            .unwrap()],
        );
        fake.submissions.insert(
            ("c1".into(), "cw1".into()),
            vec![serde_json::from_value(json!({
                "id": "sub1",
                "userId": "s1",
                "state": "TURNED_IN",
                "late": false,
                "assignedGrade": 87.5
            }))
            .unwrap()],
        );

        let rows = collect_submission_rows(&fake, Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.course_work_title.as_deref(), Some("Homework 3"));
        assert_eq!(row.max_grade, Some(100.0));
        assert_eq!(row.grade, Some(87.5));
        assert_eq!(
            row.due_time.unwrap().to_rfc3339(),
            "2025-10-08T00:00:00+00:00"
        );
        assert!(row.assigned_time.is_some());
    }

    #[tokio::test]
    async fn course_rows_preserve_identity_fields() {
        let fake = FakeClassroom {
            courses: vec![course("c9", "owner-9")],
            ..Default::default()
        };
        let rows = collect_course_rows(&fake, Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].course_id, "c9");
        assert_eq!(rows[0].owner_id.as_deref(), Some("owner-9"));
        assert_eq!(rows[0].course_state.as_deref(), Some("ACTIVE"));
    }
}
