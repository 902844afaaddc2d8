//! Read-only client for the Google Classroom REST API.
//!
//! Auth is the service-account JWT bearer flow with domain-wide
//! delegation: an RS256 assertion signed with the service-account key,
//! exchanged at the token endpoint for a short-lived access token that
//! impersonates the delegated admin. Tokens are cached until shortly
//! before expiry.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const API_BASE: &str = "https://classroom.googleapis.com/v1";
const PAGE_SIZE: u32 = 100;

// Must match the scopes granted to the service account in the Admin
// Console, or every call comes back 403.
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/classroom.courses.readonly",
    "https://www.googleapis.com/auth/classroom.rosters.readonly",
    "https://www.googleapis.com/auth/classroom.coursework.students.readonly",
    "https://www.googleapis.com/auth/classroom.student-submissions.students.readonly",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
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
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Option<String>,
    pub email_address: Option<String>,
}

/// A course member as returned by `students.list` / `teachers.list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: Option<String>,
    pub profile: Option<UserProfile>,
}

impl Member {
    /// The profile id when present, else the top-level userId.
    pub fn resolved_user_id(&self) -> Option<String> {
        self.profile
            .as_ref()
            .and_then(|p| p.id.clone())
            .or_else(|| self.user_id.clone())
    }

    pub fn email(&self) -> Option<String> {
        self.profile.as_ref().and_then(|p| p.email_address.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DueDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DueTimeOfDay {
    pub hours: Option<u32>,
    pub minutes: Option<u32>,
    pub seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseWork {
    pub id: String,
    pub title: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub due_date: Option<DueDate>,
    pub due_time: Option<DueTimeOfDay>,
    pub max_points: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSubmission {
    pub id: String,
    pub user_id: Option<String>,
    pub state: Option<String>,
    pub late: Option<bool>,
    pub assigned_grade: Option<f64>,
    pub creation_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

/// Assembles the API's structured dueDate/dueTime pair into a UTC
/// timestamp. No date (or an incomplete one) means no deadline.
pub fn due_timestamp(date: Option<DueDate>, time: Option<DueTimeOfDay>) -> Option<DateTime<Utc>> {
    let date = date?;
    let (year, month, day) = (date.year?, date.month?, date.day?);
    let time = time.unwrap_or_default();
    Utc.with_ymd_and_hms(
        year,
        month,
        day,
        time.hours.unwrap_or(0),
        time.minutes.unwrap_or(0),
        time.seconds.unwrap_or(0),
    )
    .single()
}

/// Seam between the sync pipeline and the Classroom API, so the pipeline
/// is testable against an in-memory fake.
#[async_trait]
pub trait ClassroomSource: Send + Sync {
    async fn list_courses(&self) -> Result<Vec<Course>>;
    async fn list_students(&self, course_id: &str) -> Result<Vec<Member>>;
    async fn list_teachers(&self, course_id: &str) -> Result<Vec<Member>>;
    async fn list_course_work(&self, course_id: &str) -> Result<Vec<CourseWork>>;
    async fn list_submissions(&self, course_id: &str, course_work_id: &str)
        -> Result<Vec<StudentSubmission>>;
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct ClassroomClient {
    http: reqwest::Client,
    key: ServiceAccountKey,
    subject: String,
    token: RwLock<Option<CachedToken>>,
}

impl ClassroomClient {
    /// Builds the client from `GOOGLE_SERVICE_ACCOUNT_FILE` (path to the
    /// key JSON) or `GOOGLE_SERVICE_ACCOUNT_B64` (the JSON itself,
    /// base64), plus `DELEGATED_ADMIN` as the impersonation subject.
    pub fn from_env() -> Result<Self> {
        let raw = if let Ok(path) = std::env::var("GOOGLE_SERVICE_ACCOUNT_FILE") {
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading service account key from {path}"))?
        } else if let Ok(b64) = std::env::var("GOOGLE_SERVICE_ACCOUNT_B64") {
            let bytes = general_purpose::STANDARD
                .decode(b64)
                .context("GOOGLE_SERVICE_ACCOUNT_B64 must be base64")?;
            String::from_utf8(bytes).context("decoded service account key is not UTF-8")?
        } else {
            return Err(anyhow!(
                "set GOOGLE_SERVICE_ACCOUNT_FILE or GOOGLE_SERVICE_ACCOUNT_B64"
            ));
        };

        let key: ServiceAccountKey =
            serde_json::from_str(&raw).context("parsing service account key JSON")?;
        let subject =
            std::env::var("DELEGATED_ADMIN").context("DELEGATED_ADMIN missing")?;

        Ok(Self {
            http: reqwest::Client::new(),
            key,
            subject,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(t) = cached.as_ref() {
                if t.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                    return Ok(t.token.clone());
                }
            }
        }

        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            sub: &self.subject,
            scope: SCOPES.join(" "),
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
        };
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
                .context("service account private key is not valid PEM")?,
        )
        .context("signing token assertion")?;

        let resp: TokenResponse = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("token endpoint unreachable")?
            .error_for_status()
            .context("token exchange rejected")?
            .json()
            .await
            .context("token response malformed")?;

        let token = resp.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            token: resp.access_token,
            expires_at: now + chrono::Duration::seconds(resp.expires_in),
        });
        Ok(token)
    }

    /// Pages through a listing endpoint, extracting the item array from
    /// each page with `pick` until no nextPageToken remains.
    async fn list_paged<T, F>(&self, path: &str, pick: F) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&mut serde_json::Value) -> Option<serde_json::Value>,
    {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.access_token().await?;
            let mut request = self
                .http
                .get(format!("{API_BASE}{path}"))
                .bearer_auth(token)
                .query(&[("pageSize", PAGE_SIZE.to_string())]);
            if let Some(t) = &page_token {
                request = request.query(&[("pageToken", t.as_str())]);
            }

            let mut page: serde_json::Value = request
                .send()
                .await
                .with_context(|| format!("GET {path} failed"))?
                .error_for_status()
                .with_context(|| format!("GET {path} rejected"))?
                .json()
                .await
                .with_context(|| format!("GET {path} returned malformed JSON"))?;

            if let Some(chunk) = pick(&mut page) {
                let mut parsed: Vec<T> = serde_json::from_value(chunk)
                    .with_context(|| format!("GET {path} items did not match schema"))?;
                items.append(&mut parsed);
            }

            page_token = page
                .get("nextPageToken")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if page_token.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

fn take_array(page: &mut serde_json::Value, field: &str) -> Option<serde_json::Value> {
    page.get_mut(field)
        .map(serde_json::Value::take)
        .filter(|v| !v.is_null())
}

#[async_trait]
impl ClassroomSource for ClassroomClient {
    async fn list_courses(&self) -> Result<Vec<Course>> {
        self.list_paged("/courses", |p| take_array(p, "courses")).await
    }

    async fn list_students(&self, course_id: &str) -> Result<Vec<Member>> {
        self.list_paged(&format!("/courses/{course_id}/students"), |p| {
            take_array(p, "students")
        })
        .await
    }

    async fn list_teachers(&self, course_id: &str) -> Result<Vec<Member>> {
        self.list_paged(&format!("/courses/{course_id}/teachers"), |p| {
            take_array(p, "teachers")
        })
        .await
    }

    async fn list_course_work(&self, course_id: &str) -> Result<Vec<CourseWork>> {
        self.list_paged(&format!("/courses/{course_id}/courseWork"), |p| {
            take_array(p, "courseWork")
        })
        .await
    }

    async fn list_submissions(
        &self,
        course_id: &str,
        course_work_id: &str,
    ) -> Result<Vec<StudentSubmission>> {
        self.list_paged(
            &format!("/courses/{course_id}/courseWork/{course_work_id}/studentSubmissions"),
            |p| take_array(p, "studentSubmissions"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn due_timestamp_with_time() {
        let ts = due_timestamp(
            Some(DueDate {
                year: Some(2025),
                month: Some(11),
                day: Some(3),
            }),
            Some(DueTimeOfDay {
                hours: Some(23),
                minutes: Some(59),
                seconds: None,
            }),
        )
        .unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-11-03T23:59:00+00:00");
    }

    #[test]
    fn due_timestamp_date_only_is_midnight_utc() {
        let ts = due_timestamp(
            Some(DueDate {
                year: Some(2025),
                month: Some(1),
                day: Some(15),
            }),
            None,
        )
        .unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-15T00:00:00+00:00");
    }

    #[test]
    fn due_timestamp_incomplete_date_is_none() {
        assert!(due_timestamp(None, None).is_none());
        assert!(due_timestamp(
            Some(DueDate {
                year: Some(2025),
                month: None,
                day: Some(1),
            }),
            None
        )
        .is_none());
    }

    #[test]
    fn parses_course_page_items() {
        let page = json!([{
            "id": "42",
            "name": "Algebra I",
            "section": "P3",
            "ownerId": "teacher-1",
            "courseState": "ACTIVE",
            "creationTime": "2025-09-01T08:00:00Z",
            "alternateLink": "https://classroom.google.com/c/42"
        }]);
        let courses: Vec<Course> = serde_json::from_value(page).unwrap();
        assert_eq!(courses[0].id, "42");
        assert_eq!(courses[0].owner_id.as_deref(), Some("teacher-1"));
        assert!(courses[0].creation_time.is_some());
        assert!(courses[0].room.is_none());
    }

    #[test]
    fn member_prefers_profile_id_and_splits_email() {
        let member: Member = serde_json::from_value(json!({
            "userId": "outer",
            "profile": {"id": "inner", "emailAddress": "kid@school.edu"}
        }))
        .unwrap();
        assert_eq!(member.resolved_user_id().as_deref(), Some("inner"));
        assert_eq!(member.email().as_deref(), Some("kid@school.edu"));
    }
}
