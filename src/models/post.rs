use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Post {
    pub id: i64,
    pub feed_id: i64,
    pub guid: Option<String>,
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    /// Sanitized short content (truncated at 500 chars)
    pub content: Option<String>,
    /// Full article content, extracted on demand
    pub full_content: Option<String>,
    pub content_hash: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub sort_date: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_starred: bool,
    pub starred_at: Option<DateTime<Utc>>,
    pub is_liked: bool,
    pub liked_at: Option<DateTime<Utc>>,
    pub is_suggested: bool,
    pub suggestion_score: Option<f64>,
    pub suggested_at: Option<DateTime<Utc>>,
    pub fetch_full_attempted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct PostTag {
    pub id: i64,
    pub post_id: i64,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PostListQuery {
    pub feed_id: Option<i64>,
    pub category_id: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub starred_only: bool,
    #[serde(default)]
    pub liked_only: bool,
    #[serde(default)]
    pub suggested_only: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FeedUnreadCount {
    pub feed_id: i64,
    pub unread: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PostListResponse {
    pub posts: Vec<Post>,
    pub total: i64,
    pub has_more: bool,
    pub unread_counts: Vec<FeedUnreadCount>,
    pub starred_count: i64,
}

/// Post detail with its AI summary fields and tags joined in
#[derive(Debug, Serialize, ToSchema)]
pub struct PostDetailResponse {
    #[serde(flatten)]
    pub post: Post,
    pub summary: Option<String>,
    pub one_line_summary: Option<String>,
    pub translated_title: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MarkReadRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetFlagRequest {
    pub value: bool,
}
