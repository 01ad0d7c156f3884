//! Operational endpoints: status counters, queue introspection, manual
//! requeues, vacuum.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::models::{CleanupLog, SummaryFailure, SummaryQueueEntry};
use crate::services::app_settings::KEY_HEALTH_WARNING;
use crate::services::summarizer::{CircuitStatus, RotatorStatus};
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub feeds: i64,
    pub posts: i64,
    pub unread_posts: i64,
    pub starred_posts: i64,
    pub summaries: i64,
    pub queue_size: i64,
    pub failures: i64,
    pub is_leader: bool,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<CleanupLog>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueStatusResponse {
    pub total: i64,
    pub ready: i64,
    pub locked: i64,
    pub cooling_down: i64,
    pub next_entries: Vec<SummaryQueueEntry>,
    pub recent_failures: Vec<SummaryFailure>,
    pub rotator: RotatorStatus,
    pub circuit: CircuitStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReprocessRequest {
    pub content_hash: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublicConfigResponse {
    pub llm_model: String,
    pub summary_language: String,
    pub max_rpm: u32,
    pub feed_update_interval_minutes: u64,
    pub max_post_age_days: i64,
    pub max_unread_days: i64,
}

/// System counters and health
/// GET /api/admin/status
#[utoipa::path(
    get,
    path = "/api/admin/status",
    responses((status = 200, description = "System status", body = StatusResponse)),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let count = |sql: &'static str| {
        let db = state.db.clone();
        async move {
            let row: (i64,) = sqlx::query_as(sql).fetch_one(&db).await?;
            Ok::<i64, ApiError>(row.0)
        }
    };

    let db_size_bytes = std::fs::metadata(&state.config.database.path)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(Json(StatusResponse {
        feeds: count("SELECT COUNT(*) FROM feeds").await?,
        posts: count("SELECT COUNT(*) FROM posts").await?,
        unread_posts: count("SELECT COUNT(*) FROM posts WHERE is_read = FALSE").await?,
        starred_posts: count("SELECT COUNT(*) FROM posts WHERE is_starred = TRUE").await?,
        summaries: count("SELECT COUNT(*) FROM ai_summaries").await?,
        queue_size: count("SELECT COUNT(*) FROM summary_queue").await?,
        failures: count("SELECT COUNT(*) FROM summary_failures").await?,
        is_leader: state.scheduler.is_leader(),
        db_size_bytes,
        health_warning: state.settings.get(KEY_HEALTH_WARNING).await?,
        last_cleanup: sqlx::query_as(
            "SELECT * FROM cleanup_logs ORDER BY executed_at DESC LIMIT 1",
        )
        .fetch_optional(&state.db)
        .await?,
    }))
}

/// Queue, rotator, and circuit breaker snapshot
/// GET /api/admin/queue-status
#[utoipa::path(
    get,
    path = "/api/admin/queue-status",
    responses((status = 200, description = "Queue snapshot", body = QueueStatusResponse)),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_queue_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<QueueStatusResponse>> {
    let now = Utc::now();

    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
        .fetch_one(&state.db)
        .await?;
    let locked: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM summary_queue WHERE locked_at IS NOT NULL")
            .fetch_one(&state.db)
            .await?;
    let cooling: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM summary_queue WHERE cooldown_until > ?")
            .bind(now)
            .fetch_one(&state.db)
            .await?;

    let next_entries: Vec<SummaryQueueEntry> = sqlx::query_as(
        r#"SELECT * FROM summary_queue
           WHERE (locked_at IS NULL) AND (cooldown_until IS NULL OR cooldown_until < ?)
           ORDER BY priority DESC, created_at ASC
           LIMIT 10"#,
    )
    .bind(now)
    .fetch_all(&state.db)
    .await?;

    let recent_failures: Vec<SummaryFailure> =
        sqlx::query_as("SELECT * FROM summary_failures ORDER BY failed_at DESC LIMIT 10")
            .fetch_all(&state.db)
            .await?;

    Ok(Json(QueueStatusResponse {
        total: total.0,
        ready: total.0 - locked.0 - cooling.0,
        locked: locked.0,
        cooling_down: cooling.0,
        next_entries,
        recent_failures,
        rotator: state.summarizer.rotator().status().await,
        circuit: state.summarizer.circuit().status().await,
    }))
}

/// Requeue summarization for every post with the given content hash
/// POST /api/admin/reprocess-summary
#[utoipa::path(
    post,
    path = "/api/admin/reprocess-summary",
    request_body = ReprocessRequest,
    responses((status = 202, description = "Requeued")),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn reprocess_summary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReprocessRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let hash = req.content_hash.trim();
    if hash.is_empty() {
        return Err(ApiError::invalid_data("content_hash is required"));
    }

    sqlx::query("DELETE FROM ai_summaries WHERE content_hash = ?")
        .bind(hash)
        .execute(&state.db)
        .await?;
    sqlx::query("DELETE FROM summary_failures WHERE content_hash = ?")
        .bind(hash)
        .execute(&state.db)
        .await?;

    let requeued = sqlx::query(
        r#"INSERT INTO summary_queue (post_id, content_hash, priority)
           SELECT id, content_hash, 10 FROM posts
           WHERE content_hash = ?
             AND NOT EXISTS (SELECT 1 FROM summary_queue q WHERE q.post_id = posts.id)"#,
    )
    .bind(hash)
    .execute(&state.db)
    .await?
    .rows_affected();

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"requeued": requeued}))))
}

/// Clear queue cooldowns and key cooldowns
/// POST /api/admin/clear-queue-cooldowns
#[utoipa::path(
    post,
    path = "/api/admin/clear-queue-cooldowns",
    responses((status = 200, description = "Cooldowns cleared")),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn clear_queue_cooldowns(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let cleared = sqlx::query(
        "UPDATE summary_queue SET cooldown_until = NULL, attempts = 0 WHERE cooldown_until IS NOT NULL",
    )
    .execute(&state.db)
    .await?
    .rows_affected();

    state.summarizer.rotator().clear_cooldowns().await;

    Ok(Json(serde_json::json!({"cleared": cleared})))
}

/// Reclaim free space in the database file
/// POST /api/admin/vacuum
#[utoipa::path(
    post,
    path = "/api/admin/vacuum",
    responses((status = 200, description = "Vacuum complete")),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn vacuum(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let before = std::fs::metadata(&state.config.database.path)
        .map(|m| m.len())
        .unwrap_or(0);

    // VACUUM cannot run inside a transaction
    sqlx::query("VACUUM").execute(&state.db).await?;

    let after = std::fs::metadata(&state.config.database.path)
        .map(|m| m.len())
        .unwrap_or(0);

    tracing::info!("Vacuum complete: {} -> {} bytes", before, after);
    Ok(Json(serde_json::json!({
        "before_bytes": before,
        "after_bytes": after,
    })))
}

/// Non-sensitive configuration echo
/// GET /api/admin/config
#[utoipa::path(
    get,
    path = "/api/admin/config",
    responses((status = 200, description = "Public configuration", body = PublicConfigResponse)),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_config(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PublicConfigResponse>> {
    Ok(Json(PublicConfigResponse {
        llm_model: state.settings.effective_model(&state.config.llm.model).await?,
        summary_language: state
            .settings
            .effective_language(&state.config.llm.summary_language)
            .await?,
        max_rpm: state.config.llm.max_rpm,
        feed_update_interval_minutes: state.config.jobs.feed_update_interval_minutes,
        max_post_age_days: state.config.retention.max_post_age_days,
        max_unread_days: state.config.retention.max_unread_days,
    }))
}
