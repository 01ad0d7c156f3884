//! Post endpoints: listing, detail with on-demand enrichment, flags,
//! batch read, outbound redirect, summary regeneration.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use sqlx::QueryBuilder;
use std::sync::Arc;

use crate::AppState;
use crate::models::{
    FeedUnreadCount, MarkReadRequest, Post, PostDetailResponse, PostListQuery, PostListResponse,
    SetFlagRequest,
};
use crate::services::content_extractor::extract_full_content;
use crate::utils::{ApiError, ApiResult};

use super::proxy::validate_public_url;

const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 50;
/// Priority for user-requested summary regeneration
const USER_PRIORITY: i64 = 10;

fn push_filters(qb: &mut QueryBuilder<'_, sqlx::Sqlite>, query: &PostListQuery) {
    if let Some(feed_id) = query.feed_id {
        qb.push(" AND p.feed_id = ").push_bind(feed_id);
    }
    if let Some(category_id) = query.category_id {
        qb.push(" AND p.feed_id IN (SELECT id FROM feeds WHERE category_id = ")
            .push_bind(category_id)
            .push(")");
    }
    if query.unread_only {
        qb.push(" AND p.is_read = FALSE");
    }
    if query.starred_only {
        qb.push(" AND p.is_starred = TRUE");
    }
    if query.liked_only {
        qb.push(" AND p.is_liked = TRUE");
    }
    if query.suggested_only {
        qb.push(" AND p.is_suggested = TRUE");
    }
}

/// List posts with filters, newest first
/// GET /api/posts
#[utoipa::path(
    get,
    path = "/api/posts",
    responses((status = 200, description = "Filtered post page", body = PostListResponse)),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn list_posts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostListQuery>,
) -> ApiResult<Json<PostListResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let mut qb = QueryBuilder::new("SELECT p.* FROM posts p WHERE 1=1");
    push_filters(&mut qb, &query);
    qb.push(" ORDER BY p.sort_date DESC, p.id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let posts: Vec<Post> = qb.build_query_as().fetch_all(&state.db).await?;

    let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM posts p WHERE 1=1");
    push_filters(&mut count_qb, &query);
    let total: (i64,) = count_qb.build_query_as().fetch_one(&state.db).await?;

    let unread: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT feed_id, COUNT(*) FROM posts WHERE is_read = FALSE GROUP BY feed_id",
    )
    .fetch_all(&state.db)
    .await?;
    let starred: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_starred = TRUE")
        .fetch_one(&state.db)
        .await?;

    Ok(Json(PostListResponse {
        has_more: offset + (posts.len() as i64) < total.0,
        posts,
        total: total.0,
        unread_counts: unread
            .into_iter()
            .map(|(feed_id, unread)| FeedUnreadCount { feed_id, unread })
            .collect(),
        starred_count: starred.0,
    }))
}

/// Post detail with its AI summary; extracts full content on demand and
/// enqueues a summary at user priority when none exists yet
/// GET /api/posts/:id
#[utoipa::path(
    get,
    path = "/api/posts/{id}",
    params(("id" = i64, Path, description = "Post ID")),
    responses((status = 200, description = "Post detail", body = PostDetailResponse)),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn get_post(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PostDetailResponse>> {
    let mut post = load_post(&state, id).await?;

    // On-demand full content, once per post
    if let Some(url) = post
        .url
        .clone()
        .filter(|_| post.full_content.is_none() && post.fetch_full_attempted_at.is_none())
    {
        let extracted = extract_full_content(&url).await;
        let now = Utc::now();
        if extracted.success && !extracted.content.is_empty() {
            sqlx::query(
                "UPDATE posts SET full_content = ?, fetch_full_attempted_at = ? WHERE id = ?",
            )
            .bind(&extracted.content)
            .bind(now)
            .bind(id)
            .execute(&state.db)
            .await?;
            post.full_content = Some(extracted.content);
        } else {
            sqlx::query("UPDATE posts SET fetch_full_attempted_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&state.db)
                .await?;
        }
        post.fetch_full_attempted_at = Some(now);
    }

    let summary = load_summary(&state, post.content_hash.as_deref()).await?;

    // No summary yet: bump it to the front of the queue
    if summary.is_none() {
        if let Some(hash) = post.content_hash.as_deref() {
            enqueue_at_priority(&state, post.id, hash, USER_PRIORITY).await?;
        }
    }

    let tags: Vec<crate::models::PostTag> =
        sqlx::query_as("SELECT * FROM post_tags WHERE post_id = ? ORDER BY tag")
            .bind(id)
            .fetch_all(&state.db)
            .await?;

    let (summary_text, one_line, translated_title) = match summary {
        Some(s) => (Some(s.summary), Some(s.one_line_summary), s.translated_title),
        None => (None, None, None),
    };

    Ok(Json(PostDetailResponse {
        post,
        summary: summary_text,
        one_line_summary: one_line,
        translated_title,
        tags: tags.into_iter().map(|t| t.tag).collect(),
    }))
}

/// Set or clear the read flag
/// PATCH /api/posts/:id/read
#[utoipa::path(
    patch,
    path = "/api/posts/{id}/read",
    params(("id" = i64, Path, description = "Post ID")),
    request_body = SetFlagRequest,
    responses((status = 200, description = "Updated post", body = Post)),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn set_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SetFlagRequest>,
) -> ApiResult<Json<Post>> {
    load_post(&state, id).await?;
    let read_at = req.value.then(Utc::now);
    sqlx::query("UPDATE posts SET is_read = ?, read_at = ? WHERE id = ?")
        .bind(req.value)
        .bind(read_at)
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_post(&state, id).await?))
}

/// Set or clear the star flag. Starred posts survive retention.
/// PATCH /api/posts/:id/star
#[utoipa::path(
    patch,
    path = "/api/posts/{id}/star",
    params(("id" = i64, Path, description = "Post ID")),
    request_body = SetFlagRequest,
    responses((status = 200, description = "Updated post", body = Post)),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn set_starred(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SetFlagRequest>,
) -> ApiResult<Json<Post>> {
    load_post(&state, id).await?;
    let starred_at = req.value.then(Utc::now);
    sqlx::query("UPDATE posts SET is_starred = ?, starred_at = ? WHERE id = ?")
        .bind(req.value)
        .bind(starred_at)
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_post(&state, id).await?))
}

/// Set or clear the like flag; likes feed the interest profile
/// PATCH /api/posts/:id/like
#[utoipa::path(
    patch,
    path = "/api/posts/{id}/like",
    params(("id" = i64, Path, description = "Post ID")),
    request_body = SetFlagRequest,
    responses((status = 200, description = "Updated post", body = Post)),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn set_liked(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SetFlagRequest>,
) -> ApiResult<Json<Post>> {
    load_post(&state, id).await?;
    let liked_at = req.value.then(Utc::now);
    sqlx::query("UPDATE posts SET is_liked = ?, liked_at = ? WHERE id = ?")
        .bind(req.value)
        .bind(liked_at)
        .bind(id)
        .execute(&state.db)
        .await?;

    // Likes changed: the interest profile is stale until regenerated
    state.profile_service.invalidate().await?;

    Ok(Json(load_post(&state, id).await?))
}

/// Mark a batch of posts as read
/// POST /api/posts/mark-read
#[utoipa::path(
    post,
    path = "/api/posts/mark-read",
    request_body = MarkReadRequest,
    responses((status = 200, description = "Number of posts updated")),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn mark_read_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.ids.is_empty() {
        return Ok(Json(serde_json::json!({"updated": 0})));
    }

    let mut qb = QueryBuilder::new("UPDATE posts SET is_read = TRUE, read_at = ");
    qb.push_bind(Utc::now());
    qb.push(" WHERE is_read = FALSE AND id IN (");
    let mut separated = qb.separated(", ");
    for id in &req.ids {
        separated.push_bind(id);
    }
    qb.push(")");

    let updated = qb.build().execute(&state.db).await?.rows_affected();
    Ok(Json(serde_json::json!({"updated": updated})))
}

/// Validate the post URL, mark the post read, and redirect to it
/// GET /api/posts/:id/redirect
#[utoipa::path(
    get,
    path = "/api/posts/{id}/redirect",
    params(("id" = i64, Path, description = "Post ID")),
    responses(
        (status = 302, description = "Redirect to the original article"),
        (status = 400, description = "Post URL is unsafe")
    ),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn redirect_to_post(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let post = load_post(&state, id).await?;
    let url = post
        .url
        .as_deref()
        .ok_or_else(|| ApiError::invalid_data("Post has no URL"))?;

    validate_public_url(url)?;

    sqlx::query("UPDATE posts SET is_read = TRUE, read_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(&state.db)
        .await?;

    Ok((StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response())
}

/// Drop the stored summary and requeue at user priority
/// POST /api/posts/:id/regenerate-summary
#[utoipa::path(
    post,
    path = "/api/posts/{id}/regenerate-summary",
    params(("id" = i64, Path, description = "Post ID")),
    responses((status = 202, description = "Regeneration queued")),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn regenerate_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let post = load_post(&state, id).await?;
    let hash = post
        .content_hash
        .as_deref()
        .ok_or_else(|| ApiError::invalid_data("Post has no content hash"))?;

    sqlx::query("DELETE FROM ai_summaries WHERE content_hash = ?")
        .bind(hash)
        .execute(&state.db)
        .await?;

    enqueue_at_priority(&state, post.id, hash, USER_PRIORITY).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Stored or freshly-extracted full content
/// GET /api/posts/:id/full-content
#[utoipa::path(
    get,
    path = "/api/posts/{id}/full-content",
    params(("id" = i64, Path, description = "Post ID")),
    responses((status = 200, description = "Full article content")),
    security(("bearer_auth" = [])),
    tag = "Posts"
)]
pub async fn get_full_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let post = load_post(&state, id).await?;

    if let Some(full) = post.full_content {
        return Ok(Json(serde_json::json!({"full_content": full})));
    }

    let url = post
        .url
        .as_deref()
        .ok_or_else(|| ApiError::invalid_data("Post has no URL"))?;

    let extracted = extract_full_content(url).await;
    let now = Utc::now();
    if extracted.success && !extracted.content.is_empty() {
        sqlx::query("UPDATE posts SET full_content = ?, fetch_full_attempted_at = ? WHERE id = ?")
            .bind(&extracted.content)
            .bind(now)
            .bind(id)
            .execute(&state.db)
            .await?;
        Ok(Json(serde_json::json!({"full_content": extracted.content})))
    } else {
        sqlx::query("UPDATE posts SET fetch_full_attempted_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&state.db)
            .await?;
        Err(ApiError::upstream_error(
            extracted.error.unwrap_or_else(|| "Extraction failed".to_string()),
        ))
    }
}

async fn load_post(state: &AppState, id: i64) -> ApiResult<Post> {
    sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Post {} not found", id)))
}

async fn load_summary(
    state: &AppState,
    content_hash: Option<&str>,
) -> ApiResult<Option<crate::models::AiSummary>> {
    let Some(hash) = content_hash else { return Ok(None) };
    Ok(sqlx::query_as("SELECT * FROM ai_summaries WHERE content_hash = ?")
        .bind(hash)
        .fetch_optional(&state.db)
        .await?)
}

/// Insert a queue entry or raise an existing one to the given priority
async fn enqueue_at_priority(
    state: &AppState,
    post_id: i64,
    content_hash: &str,
    priority: i64,
) -> ApiResult<()> {
    sqlx::query(
        r#"INSERT INTO summary_queue (post_id, content_hash, priority) VALUES (?, ?, ?)
           ON CONFLICT(post_id) DO UPDATE SET priority = MAX(priority, excluded.priority)"#,
    )
    .bind(post_id)
    .bind(content_hash)
    .bind(priority)
    .execute(&state.db)
    .await?;
    Ok(())
}
