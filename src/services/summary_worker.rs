//! Summary queue worker.
//!
//! Each tick claims the highest-priority ready queue entry with an
//! optimistic conditional UPDATE (safe across workers and processes),
//! resolves the post content (extracting the full article on demand), and
//! runs the summarizer. The outcome switch applies the retry policy:
//! temporary errors back off with bounded attempts, permanent ones are
//! archived after five strikes.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::{Post, SummaryQueueEntry};
use crate::utils::ApiResult;

use super::content_extractor::extract_full_content;
use super::post_tags::save_post_tags;
use super::summarizer::{LlmError, SummarizerClient, SummaryResult};

const MAX_ATTEMPTS: i64 = 5;
const FAILURE_COOLDOWN_HOURS: i64 = 24;
/// Pause after a full-content fetch to stay under upstream rate limits
const EXTRACTION_PAUSE_SECS: u64 = 2;

/// What a single tick did, for logging and tests
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerTick {
    /// An entry was claimed and handled (including fast-path deletions)
    Processed,
    /// Queue empty or claim lost to a concurrent worker
    Idle,
    /// Breaker or key rotation denied the tick before any work
    Denied(String),
}

pub struct SummaryWorker {
    pool: SqlitePool,
    client: Arc<SummarizerClient>,
    lock_timeout_seconds: i64,
}

impl SummaryWorker {
    pub fn new(pool: SqlitePool, client: Arc<SummarizerClient>, lock_timeout_seconds: i64) -> Self {
        Self { pool, client, lock_timeout_seconds }
    }

    /// Run one worker tick.
    pub async fn process_next(&self) -> ApiResult<WorkerTick> {
        if let Err(reason) = self.client.circuit().can_call().await {
            return Ok(WorkerTick::Denied(reason));
        }
        if !self.client.rotator().has_available_key().await {
            return Ok(WorkerTick::Denied("No API key available".to_string()));
        }

        let now = Utc::now();
        let lock_cutoff = now - Duration::seconds(self.lock_timeout_seconds);

        let candidate: Option<SummaryQueueEntry> = sqlx::query_as(
            r#"SELECT * FROM summary_queue
               WHERE (locked_at IS NULL OR locked_at < ?)
                 AND (cooldown_until IS NULL OR cooldown_until < ?)
               ORDER BY priority DESC, created_at ASC, id ASC
               LIMIT 1"#,
        )
        .bind(lock_cutoff)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(entry) = candidate else {
            return Ok(WorkerTick::Idle);
        };

        // Optimistic claim; zero affected rows means another worker won
        let claimed = sqlx::query(
            "UPDATE summary_queue SET locked_at = ? WHERE id = ? AND (locked_at IS NULL OR locked_at < ?)",
        )
        .bind(now)
        .bind(entry.id)
        .bind(lock_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(WorkerTick::Idle);
        }

        // Deduplication payoff: someone already summarized this content
        let summary_exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM ai_summaries WHERE content_hash = ?")
                .bind(&entry.content_hash)
                .fetch_optional(&self.pool)
                .await?;
        if summary_exists.is_some() {
            self.delete_entry(entry.id).await?;
            tracing::debug!("Summary already exists for hash {:.16}...", entry.content_hash);
            return Ok(WorkerTick::Processed);
        }

        let post: Option<Post> = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(entry.post_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(post) = post else {
            self.delete_entry(entry.id).await?;
            return Ok(WorkerTick::Processed);
        };

        // Already-read posts are not worth an API call
        if post.is_read {
            self.delete_entry(entry.id).await?;
            tracing::debug!("Post {} already read, skipping summary", post.id);
            return Ok(WorkerTick::Processed);
        }

        let content = self.resolve_content(&post).await?;
        let Some(content) = content else {
            self.delete_entry(entry.id).await?;
            return Ok(WorkerTick::Processed);
        };

        tracing::info!("Generating summary for post {}...", post.id);
        let outcome = self
            .client
            .generate_summary(&content, post.title.as_deref().unwrap_or(""))
            .await;

        self.record_outcome(&entry, post.id, outcome).await?;
        Ok(WorkerTick::Processed)
    }

    /// Full content when stored; otherwise extract it on demand, falling
    /// back to the short RSS content.
    async fn resolve_content(&self, post: &Post) -> ApiResult<Option<String>> {
        if let Some(full) = post.full_content.as_deref().filter(|c| !c.is_empty()) {
            return Ok(Some(full.to_string()));
        }

        if let Some(url) = post.url.as_deref() {
            tracing::info!("Fetching full content for post {}...", post.id);
            let extracted = extract_full_content(url).await;
            let now = Utc::now();

            if extracted.success && !extracted.content.is_empty() {
                sqlx::query(
                    "UPDATE posts SET full_content = ?, fetch_full_attempted_at = ? WHERE id = ?",
                )
                .bind(&extracted.content)
                .bind(now)
                .bind(post.id)
                .execute(&self.pool)
                .await?;

                tokio::time::sleep(std::time::Duration::from_secs(EXTRACTION_PAUSE_SECS)).await;
                return Ok(Some(extracted.content));
            }

            sqlx::query("UPDATE posts SET fetch_full_attempted_at = ? WHERE id = ?")
                .bind(now)
                .bind(post.id)
                .execute(&self.pool)
                .await?;
            tracing::warn!(
                "Full-content extraction failed for post {}: {}",
                post.id,
                extracted.error.as_deref().unwrap_or("unknown")
            );
            tokio::time::sleep(std::time::Duration::from_secs(EXTRACTION_PAUSE_SECS)).await;
        }

        Ok(post.content.clone().filter(|c| !c.is_empty()))
    }

    /// Apply the outcome switch for a generation attempt.
    pub async fn record_outcome(
        &self,
        entry: &SummaryQueueEntry,
        post_id: i64,
        outcome: Result<SummaryResult, LlmError>,
    ) -> ApiResult<()> {
        let now = Utc::now();

        match outcome {
            Ok(result) => {
                let mut tx = self.pool.begin().await?;

                let tags_json = if result.tags.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&result.tags)?)
                };

                sqlx::query(
                    r#"INSERT INTO ai_summaries
                       (content_hash, summary, one_line_summary, translated_title, tags)
                       VALUES (?, ?, ?, ?, ?)
                       ON CONFLICT(content_hash) DO NOTHING"#,
                )
                .bind(&entry.content_hash)
                .bind(&result.summary)
                .bind(&result.one_line_summary)
                .bind(&result.translated_title)
                .bind(&tags_json)
                .execute(&mut *tx)
                .await?;

                save_post_tags(&mut tx, post_id, &result.tags).await?;

                sqlx::query("DELETE FROM summary_queue WHERE id = ?")
                    .bind(entry.id)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                tracing::info!("Summary stored for post {}", post_id);
            },

            // Key exhaustion releases the lock without spending an attempt
            Err(LlmError::KeysExhausted) => {
                sqlx::query("UPDATE summary_queue SET locked_at = NULL WHERE id = ?")
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await?;
                tracing::debug!("All keys in cooldown, entry {} released", entry.id);
            },

            Err(LlmError::Temporary(message)) => {
                let attempts = entry.attempts + 1;
                if attempts >= MAX_ATTEMPTS {
                    let cooldown_until = now + Duration::hours(FAILURE_COOLDOWN_HOURS);
                    sqlx::query(
                        r#"UPDATE summary_queue
                           SET attempts = 0, last_error = ?, error_type = 'temporary',
                               cooldown_until = ?, locked_at = NULL
                           WHERE id = ?"#,
                    )
                    .bind(&message)
                    .bind(cooldown_until)
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await?;
                    tracing::warn!(
                        "Post {}: {} temporary failures, cooling down 24h",
                        post_id,
                        MAX_ATTEMPTS
                    );
                } else {
                    sqlx::query(
                        r#"UPDATE summary_queue
                           SET attempts = ?, last_error = ?, error_type = 'temporary', locked_at = NULL
                           WHERE id = ?"#,
                    )
                    .bind(attempts)
                    .bind(&message)
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await?;
                    tracing::warn!("Temporary error for post {}: {}", post_id, message);
                }
            },

            Err(LlmError::Permanent(message)) => {
                let attempts = entry.attempts + 1;
                if attempts >= MAX_ATTEMPTS {
                    let mut tx = self.pool.begin().await?;
                    sqlx::query(
                        "INSERT INTO summary_failures (content_hash, last_error) VALUES (?, ?)",
                    )
                    .bind(&entry.content_hash)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM summary_queue WHERE id = ?")
                        .bind(entry.id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    tracing::error!(
                        "Post {}: permanent failure after {} attempts",
                        post_id,
                        MAX_ATTEMPTS
                    );
                } else {
                    sqlx::query(
                        r#"UPDATE summary_queue
                           SET attempts = ?, last_error = ?, error_type = 'permanent', locked_at = NULL
                           WHERE id = ?"#,
                    )
                    .bind(attempts)
                    .bind(&message)
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await?;
                    tracing::error!("Permanent error for post {}: {}", post_id, message);
                }
            },
        }

        Ok(())
    }

    async fn delete_entry(&self, entry_id: i64) -> ApiResult<()> {
        sqlx::query("DELETE FROM summary_queue WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Backfill sweep: posts that have a content hash but neither a queue
/// entry, a summary, nor read status are re-enqueued below background
/// priority. Keeps the pipeline eventually consistent after partial
/// failures.
pub async fn backfill_missing_summaries(pool: &SqlitePool) -> ApiResult<u64> {
    let result = sqlx::query(
        r#"INSERT INTO summary_queue (post_id, content_hash, priority)
           SELECT p.id, p.content_hash, -1
           FROM posts p
           WHERE p.content_hash IS NOT NULL
             AND p.is_read = FALSE
             AND NOT EXISTS (SELECT 1 FROM summary_queue q WHERE q.post_id = p.id)
             AND NOT EXISTS (SELECT 1 FROM ai_summaries s WHERE s.content_hash = p.content_hash)"#,
    )
    .execute(pool)
    .await?
    .rows_affected();

    if result > 0 {
        tracing::info!("Backfill enqueued {} posts for summarization", result);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn insert_post(pool: &SqlitePool, hash: &str) -> i64 {
        let feed_id = sqlx::query("INSERT INTO feeds (title, url) VALUES ('f', ?)")
            .bind(format!("https://f.example/rss-{}", hash))
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query(
            "INSERT INTO posts (feed_id, title, content, content_hash) VALUES (?, 't', 'c', ?)",
        )
        .bind(feed_id)
        .bind(hash)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn insert_entry(pool: &SqlitePool, post_id: i64, hash: &str) -> SummaryQueueEntry {
        let id = sqlx::query(
            "INSERT INTO summary_queue (post_id, content_hash, priority) VALUES (?, ?, 0)",
        )
        .bind(post_id)
        .bind(hash)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
        sqlx::query_as("SELECT * FROM summary_queue WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn worker(pool: &SqlitePool) -> SummaryWorker {
        use crate::config::LlmConfig;
        use crate::services::app_settings::AppSettingsService;
        use crate::services::summarizer::{ApiKeyRotator, CircuitBreaker, SummarizerClient};

        let config = LlmConfig::default();
        let rotator = Arc::new(ApiKeyRotator::new(pool.clone(), vec!["k".to_string()]).await);
        let circuit = Arc::new(CircuitBreaker::new(pool.clone(), 5, 300, 3, 60_000).await);
        let client = Arc::new(SummarizerClient::new(
            config,
            AppSettingsService::new(pool.clone()),
            rotator,
            circuit,
        ));
        SummaryWorker::new(pool.clone(), client, 300)
    }

    #[tokio::test]
    async fn claim_race_yields_exactly_one_winner() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let entry = insert_entry(&pool, post_id, "hash-1").await;

        let now = Utc::now();
        let cutoff = now - Duration::seconds(300);

        let claim = |pool: SqlitePool| async move {
            sqlx::query(
                "UPDATE summary_queue SET locked_at = ? WHERE id = ? AND (locked_at IS NULL OR locked_at < ?)",
            )
            .bind(now)
            .bind(entry.id)
            .bind(cutoff)
            .execute(&pool)
            .await
            .unwrap()
            .rows_affected()
        };

        let first = claim(pool.clone()).await;
        let second = claim(pool.clone()).await;
        assert_eq!(first + second, 1);
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let entry = insert_entry(&pool, post_id, "hash-1").await;

        let stale = Utc::now() - Duration::seconds(1000);
        sqlx::query("UPDATE summary_queue SET locked_at = ? WHERE id = ?")
            .bind(stale)
            .bind(entry.id)
            .execute(&pool)
            .await
            .unwrap();

        let now = Utc::now();
        let cutoff = now - Duration::seconds(300);
        let claimed = sqlx::query(
            "UPDATE summary_queue SET locked_at = ? WHERE id = ? AND (locked_at IS NULL OR locked_at < ?)",
        )
        .bind(now)
        .bind(entry.id)
        .bind(cutoff)
        .execute(&pool)
        .await
        .unwrap()
        .rows_affected();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn success_stores_summary_tags_and_clears_queue() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let entry = insert_entry(&pool, post_id, "hash-1").await;
        let worker = worker(&pool).await;

        let result = SummaryResult {
            summary: "resumo".to_string(),
            one_line_summary: "linha".to_string(),
            translated_title: Some("Titulo".to_string()),
            tags: vec!["rust".to_string(), "feeds".to_string()],
        };
        worker.record_outcome(&entry, post_id, Ok(result)).await.unwrap();

        let summary: crate::models::AiSummary =
            sqlx::query_as("SELECT * FROM ai_summaries WHERE content_hash = 'hash-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(summary.summary, "resumo");
        assert_eq!(summary.tag_list(), vec!["rust", "feeds"]);

        let queue: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queue.0, 0);

        let tags: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM post_tags WHERE post_id = ?")
            .bind(post_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tags.0, 2);
    }

    #[tokio::test]
    async fn temporary_errors_accumulate_then_cool_down() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let worker = worker(&pool).await;

        insert_entry(&pool, post_id, "hash-1").await;

        for i in 1..=4 {
            let entry: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
            worker
                .record_outcome(&entry, post_id, Err(LlmError::Temporary("boom".to_string())))
                .await
                .unwrap();

            let updated: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(updated.attempts, i);
            assert_eq!(updated.error_type.as_deref(), Some("temporary"));
            assert!(updated.locked_at.is_none());
            assert!(updated.cooldown_until.is_none());
        }

        // Fifth strike: 24h cooldown, attempts reset
        let entry: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        worker
            .record_outcome(&entry, post_id, Err(LlmError::Temporary("boom".to_string())))
            .await
            .unwrap();
        let updated: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(updated.attempts, 0);
        assert!(updated.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn permanent_errors_archive_after_five_attempts() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let worker = worker(&pool).await;
        insert_entry(&pool, post_id, "hash-1").await;

        for _ in 1..=5 {
            let entry: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
            worker
                .record_outcome(&entry, post_id, Err(LlmError::Permanent("bad".to_string())))
                .await
                .unwrap();
        }

        let queue: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queue.0, 0);

        let failures: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM summary_failures WHERE content_hash = 'hash-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(failures.0, 1);
    }

    #[tokio::test]
    async fn key_exhaustion_releases_lock_without_attempt() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        let entry = insert_entry(&pool, post_id, "hash-1").await;
        let worker = worker(&pool).await;

        sqlx::query("UPDATE summary_queue SET locked_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(entry.id)
            .execute(&pool)
            .await
            .unwrap();

        worker.record_outcome(&entry, post_id, Err(LlmError::KeysExhausted)).await.unwrap();

        let updated: SummaryQueueEntry = sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(updated.attempts, 0);
        assert!(updated.locked_at.is_none());
    }

    #[tokio::test]
    async fn read_posts_are_dequeued_without_summarizing() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        insert_entry(&pool, post_id, "hash-1").await;
        sqlx::query("UPDATE posts SET is_read = TRUE WHERE id = ?")
            .bind(post_id)
            .execute(&pool)
            .await
            .unwrap();

        let worker = worker(&pool).await;
        let tick = worker.process_next().await.unwrap();
        assert_eq!(tick, WorkerTick::Processed);

        let queue: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queue.0, 0);
    }

    #[tokio::test]
    async fn existing_summary_dequeues_entry() {
        let pool = db::test_pool().await;
        let post_id = insert_post(&pool, "hash-1").await;
        insert_entry(&pool, post_id, "hash-1").await;
        sqlx::query(
            "INSERT INTO ai_summaries (content_hash, summary, one_line_summary) VALUES ('hash-1', 's', 'o')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let worker = worker(&pool).await;
        let tick = worker.process_next().await.unwrap();
        assert_eq!(tick, WorkerTick::Processed);

        let queue: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queue.0, 0);
    }

    #[tokio::test]
    async fn priority_order_governs_selection() {
        let pool = db::test_pool().await;
        let a = insert_post(&pool, "hash-a").await;
        let b = insert_post(&pool, "hash-b").await;
        insert_entry(&pool, a, "hash-a").await;
        let high = insert_entry(&pool, b, "hash-b").await;
        sqlx::query("UPDATE summary_queue SET priority = 10 WHERE id = ?")
            .bind(high.id)
            .execute(&pool)
            .await
            .unwrap();

        let now = Utc::now();
        let cutoff = now - Duration::seconds(300);
        let selected: SummaryQueueEntry = sqlx::query_as(
            r#"SELECT * FROM summary_queue
               WHERE (locked_at IS NULL OR locked_at < ?)
                 AND (cooldown_until IS NULL OR cooldown_until < ?)
               ORDER BY priority DESC, created_at ASC, id ASC
               LIMIT 1"#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(selected.id, high.id);
    }

    #[tokio::test]
    async fn backfill_enqueues_only_uncovered_posts() {
        let pool = db::test_pool().await;

        let covered = insert_post(&pool, "hash-covered").await;
        insert_entry(&pool, covered, "hash-covered").await;

        let summarized = insert_post(&pool, "hash-summarized").await;
        sqlx::query(
            "INSERT INTO ai_summaries (content_hash, summary, one_line_summary) VALUES ('hash-summarized', 's', 'o')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let read_post = insert_post(&pool, "hash-read").await;
        sqlx::query("UPDATE posts SET is_read = TRUE WHERE id = ?")
            .bind(read_post)
            .execute(&pool)
            .await
            .unwrap();

        let missing = insert_post(&pool, "hash-missing").await;

        let enqueued = backfill_missing_summaries(&pool).await.unwrap();
        assert_eq!(enqueued, 1);

        let entry: SummaryQueueEntry =
            sqlx::query_as("SELECT * FROM summary_queue WHERE post_id = ?")
                .bind(missing)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(entry.priority, -1);
        let _ = summarized;
    }
}
