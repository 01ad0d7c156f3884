use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Single-row leadership lock. The row exists iff some instance believes
/// itself to be leader; a stale heartbeat means the lock may be taken over.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SchedulerLock {
    pub id: i64,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct CleanupLog {
    pub id: i64,
    pub executed_at: DateTime<Utc>,
    pub posts_removed: i64,
    pub unread_removed: i64,
    pub full_content_cleared: i64,
    pub duration_seconds: Option<f64>,
    pub notes: Option<String>,
}
