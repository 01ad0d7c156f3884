use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Feed {
    pub id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub url: String,
    pub site_url: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disable_reason: Option<String>,
    pub guid_unreliable: bool,
    pub guid_collision_count: i64,
    pub allow_duplicate_urls: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateFeedRequest {
    #[validate(url)]
    pub url: String,
    pub title: Option<String>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateFeedRequest {
    pub title: Option<String>,
    pub category_id: Option<i64>,
    pub site_url: Option<String>,
    pub allow_duplicate_urls: Option<bool>,
}

/// Feed with its unread count, for list views
#[derive(Debug, Serialize, ToSchema)]
pub struct FeedResponse {
    #[serde(flatten)]
    pub feed: Feed,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DiscoveredFeed {
    pub url: String,
    pub title: Option<String>,
}
