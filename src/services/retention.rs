//! Time-based retention cleanup.
//!
//! Starred posts are inviolable: no pass deletes or strips them.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::time::Instant;

use crate::config::RetentionConfig;
use crate::utils::ApiResult;

/// Read posts keep their full content this long after being read
const FULL_CONTENT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Default)]
pub struct CleanupStats {
    pub posts_removed: u64,
    pub unread_removed: u64,
    pub full_content_cleared: u64,
    pub duration_seconds: f64,
}

/// Run the three retention passes and record a cleanup_logs row.
pub async fn run_cleanup(pool: &SqlitePool, config: &RetentionConfig) -> ApiResult<CleanupStats> {
    let started = Instant::now();
    let now = Utc::now();
    let mut stats = CleanupStats::default();

    // 1. Read posts past max_post_age_days
    let cutoff_read = now - Duration::days(config.max_post_age_days);
    stats.posts_removed = sqlx::query(
        "DELETE FROM posts WHERE is_read = TRUE AND read_at < ? AND is_starred != TRUE",
    )
    .bind(cutoff_read)
    .execute(pool)
    .await?
    .rows_affected();

    // 2. Unread posts past max_unread_days
    let cutoff_unread = now - Duration::days(config.max_unread_days);
    stats.unread_removed = sqlx::query(
        "DELETE FROM posts WHERE is_read = FALSE AND fetched_at < ? AND is_starred != TRUE",
    )
    .bind(cutoff_unread)
    .execute(pool)
    .await?
    .rows_affected();

    // 3. Strip stored full content from long-read posts
    let cutoff_full = now - Duration::days(FULL_CONTENT_RETENTION_DAYS);
    stats.full_content_cleared = sqlx::query(
        r#"UPDATE posts SET full_content = NULL
           WHERE is_read = TRUE AND read_at < ? AND is_starred != TRUE
             AND full_content IS NOT NULL"#,
    )
    .bind(cutoff_full)
    .execute(pool)
    .await?
    .rows_affected();

    stats.duration_seconds = started.elapsed().as_secs_f64();

    sqlx::query(
        r#"INSERT INTO cleanup_logs
           (posts_removed, unread_removed, full_content_cleared, duration_seconds)
           VALUES (?, ?, ?, ?)"#,
    )
    .bind(stats.posts_removed as i64)
    .bind(stats.unread_removed as i64)
    .bind(stats.full_content_cleared as i64)
    .bind(stats.duration_seconds)
    .execute(pool)
    .await?;

    tracing::info!(
        "Cleanup done in {:.1}s - removed: {}, unread removed: {}, full_content cleared: {}",
        stats.duration_seconds,
        stats.posts_removed,
        stats.unread_removed,
        stats.full_content_cleared
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::DateTime;

    async fn insert_post(
        pool: &SqlitePool,
        is_read: bool,
        read_at: Option<DateTime<Utc>>,
        fetched_at: DateTime<Utc>,
        is_starred: bool,
        full_content: Option<&str>,
    ) -> i64 {
        sqlx::query("INSERT OR IGNORE INTO feeds (id, title, url) VALUES (1, 'f', 'https://f.io/rss')")
            .execute(pool)
            .await
            .unwrap();
        let feed_id = 1i64;
        sqlx::query(
            r#"INSERT INTO posts (feed_id, is_read, read_at, fetched_at, is_starred, full_content)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(feed_id)
        .bind(is_read)
        .bind(read_at)
        .bind(fetched_at)
        .bind(is_starred)
        .bind(full_content)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn config() -> RetentionConfig {
        RetentionConfig { max_post_age_days: 365, max_unread_days: 90, max_db_size_mb: 1024, cleanup_hour: 3 }
    }

    #[tokio::test]
    async fn old_read_posts_are_removed_starred_survive() {
        let pool = db::test_pool().await;
        let two_years_ago = Utc::now() - Duration::days(730);

        let old_read =
            insert_post(&pool, true, Some(two_years_ago), two_years_ago, false, None).await;
        let old_starred =
            insert_post(&pool, true, Some(two_years_ago), two_years_ago, true, None).await;

        let stats = run_cleanup(&pool, &config()).await.unwrap();
        assert_eq!(stats.posts_removed, 1);

        let remaining: Vec<(i64,)> = sqlx::query_as("SELECT id FROM posts")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, old_starred);
        let _ = old_read;
    }

    #[tokio::test]
    async fn stale_unread_posts_are_removed() {
        let pool = db::test_pool().await;
        let old = Utc::now() - Duration::days(120);
        let fresh = Utc::now() - Duration::days(5);

        insert_post(&pool, false, None, old, false, None).await;
        let kept = insert_post(&pool, false, None, fresh, false, None).await;

        let stats = run_cleanup(&pool, &config()).await.unwrap();
        assert_eq!(stats.unread_removed, 1);

        let remaining: Vec<(i64,)> = sqlx::query_as("SELECT id FROM posts")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, kept);
    }

    #[tokio::test]
    async fn full_content_cleared_for_long_read_posts() {
        let pool = db::test_pool().await;
        let long_read = Utc::now() - Duration::days(60);

        let cleared = insert_post(&pool, true, Some(long_read), long_read, false, Some("full")).await;
        let starred = insert_post(&pool, true, Some(long_read), long_read, true, Some("full")).await;

        let stats = run_cleanup(&pool, &config()).await.unwrap();
        assert_eq!(stats.full_content_cleared, 1);

        let cleared_row: (Option<String>,) =
            sqlx::query_as("SELECT full_content FROM posts WHERE id = ?")
                .bind(cleared)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(cleared_row.0, None);

        let starred_row: (Option<String>,) =
            sqlx::query_as("SELECT full_content FROM posts WHERE id = ?")
                .bind(starred)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(starred_row.0.as_deref(), Some("full"));
    }

    #[tokio::test]
    async fn cleanup_is_logged() {
        let pool = db::test_pool().await;
        run_cleanup(&pool, &config()).await.unwrap();

        let logs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cleanup_logs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(logs.0, 1);
    }
}
