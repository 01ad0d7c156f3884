use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Content-addressed AI summary. Identical content across feeds shares one row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AiSummary {
    pub id: i64,
    pub content_hash: String,
    pub summary: String,
    pub one_line_summary: String,
    pub translated_title: Option<String>,
    /// JSON-encoded list of tags supplied by the model
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AiSummary {
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .and_then(|t| serde_json::from_str::<Vec<String>>(t).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SummaryQueueEntry {
    pub id: i64,
    pub post_id: i64,
    pub content_hash: String,
    /// Higher first; 0 = background, 10 = user-requested, -1 = backfill
    pub priority: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// 'temporary' or 'permanent'
    pub error_type: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Archive of content hashes that exhausted their retries
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SummaryFailure {
    pub id: i64,
    pub content_hash: String,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}
