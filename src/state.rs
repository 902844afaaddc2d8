use crate::services::ai::AiService;
use crate::services::classroom::ClassroomSource;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct AppState {
    pub pool: PgPool,
    pub ai: Arc<AiService>,
    pub classroom: Arc<dyn ClassroomSource>,
    /// Serializes sync runs; overlapping requests wait instead of failing.
    pub sync_lock: Mutex<()>,
    pub query: QueryLimits,
}

/// Server-side bounds for the NL query path. Request values are clamped
/// against these, never trusted as-is.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_rows: i64,
    pub timeout: Duration,
}

impl QueryLimits {
    pub fn from_env() -> Self {
        let max_rows = std::env::var("QUERY_MAX_ROWS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        let timeout_secs = std::env::var("QUERY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Self {
            max_rows,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

pub type SharedState = Arc<AppState>;
