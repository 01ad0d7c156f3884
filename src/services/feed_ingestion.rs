//! Feed ingestion: fetch, parse, normalize, sanitize, deduplicate, insert.
//!
//! Each feed is ingested in a single transaction. Dedup runs in order:
//! GUID (with collision tracking), normalized URL, then content hash as a
//! last resort when an entry has neither identifier.

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::Feed;
use crate::utils::{ApiError, ApiResult};

use super::content_hasher::compute_content_hash;
use super::feed_parser::{self, FeedError, ParsedEntry};
use super::html_sanitizer::sanitize_html;
use super::url_normalizer::normalize_url;

/// GUID collisions tolerated before the feed's GUIDs stop being trusted
const GUID_COLLISION_LIMIT: i64 = 3;

/// Retry backoff after a fetch failure: base doubles per consecutive
/// error, capped at a day
const RETRY_BASE_MINUTES: i64 = 15;
const RETRY_MAX_MINUTES: i64 = 24 * 60;
/// Consecutive failures before a feed is disabled outright
const DISABLE_AFTER_ERRORS: i64 = 20;

#[derive(Debug, Default)]
pub struct IngestionResult {
    pub new_posts: u32,
    pub skipped_duplicates: u32,
    pub errors: Vec<String>,
    pub feed_title_updated: bool,
    pub site_url_updated: bool,
}

#[derive(Clone)]
pub struct IngestionService {
    pool: SqlitePool,
}

impl IngestionService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch and ingest one feed, returning counts.
    pub async fn ingest_feed(&self, feed_id: i64) -> ApiResult<IngestionResult> {
        let feed: Feed = sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Feed {} not found", feed_id)))?;

        let mut result = IngestionResult::default();
        let now = Utc::now();

        let parsed = match feed_parser::fetch_and_parse(&feed.url).await {
            Ok((parsed, _final_url)) => parsed,
            Err(e) => {
                self.record_fetch_error(&feed, &e, now).await?;
                result.errors.push(e.to_string());
                return Ok(result);
            },
        };

        let mut tx = self.pool.begin().await?;

        // Replace a hostname-placeholder title with the parsed feed title
        if let Some(parsed_title) = parsed.title.as_deref().filter(|t| !t.trim().is_empty()) {
            if feed.title.contains('.') && !feed.title.contains('/') {
                sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
                    .bind(parsed_title)
                    .bind(feed.id)
                    .execute(&mut *tx)
                    .await?;
                result.feed_title_updated = true;
            }
        }

        if feed.site_url.as_deref().unwrap_or("").is_empty() {
            if let Some(site_url) = parsed.site_url.as_deref() {
                sqlx::query("UPDATE feeds SET site_url = ? WHERE id = ?")
                    .bind(site_url)
                    .bind(feed.id)
                    .execute(&mut *tx)
                    .await?;
                result.site_url_updated = true;
            }
        }

        let mut guid_collision_count = feed.guid_collision_count;
        let mut guid_unreliable = feed.guid_unreliable;

        for entry in &parsed.entries {
            match Self::process_entry(
                &mut tx,
                &feed,
                entry,
                now,
                &mut guid_collision_count,
                &mut guid_unreliable,
            )
            .await
            {
                Ok(true) => result.new_posts += 1,
                Ok(false) => result.skipped_duplicates += 1,
                Err(e) => {
                    tracing::error!("Failed to process entry for feed {}: {}", feed.id, e);
                    result.errors.push(e.to_string());
                },
            }
        }

        if guid_collision_count != feed.guid_collision_count || guid_unreliable != feed.guid_unreliable
        {
            sqlx::query(
                "UPDATE feeds SET guid_collision_count = ?, guid_unreliable = ? WHERE id = ?",
            )
            .bind(guid_collision_count)
            .bind(guid_unreliable)
            .bind(feed.id)
            .execute(&mut *tx)
            .await?;

            if guid_unreliable && !feed.guid_unreliable {
                tracing::warn!(
                    "Feed {} marked guid_unreliable (collisions: {})",
                    feed.id,
                    guid_collision_count
                );
            }
        }

        sqlx::query(
            "UPDATE feeds SET last_fetched_at = ?, error_count = 0, last_error = NULL, next_retry_at = NULL WHERE id = ?",
        )
        .bind(now)
        .bind(feed.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Feed {} ingested: {} new, {} duplicates",
            feed.id,
            result.new_posts,
            result.skipped_duplicates
        );

        Ok(result)
    }

    /// Record a fetch/parse failure: bump the error counter, schedule the
    /// next retry with exponential backoff, and disable the feed after too
    /// many consecutive failures.
    async fn record_fetch_error(
        &self,
        feed: &Feed,
        error: &FeedError,
        now: chrono::DateTime<Utc>,
    ) -> ApiResult<()> {
        let error_count = feed.error_count + 1;
        let message = error.to_string();

        let exponent = (error_count - 1).clamp(0, 10) as u32;
        let backoff_minutes = (RETRY_BASE_MINUTES << exponent).min(RETRY_MAX_MINUTES);
        let next_retry_at = now + chrono::Duration::minutes(backoff_minutes);

        sqlx::query(
            r#"UPDATE feeds
               SET error_count = ?, last_error = ?, last_error_at = ?, next_retry_at = ?
               WHERE id = ?"#,
        )
        .bind(error_count)
        .bind(&message)
        .bind(now)
        .bind(next_retry_at)
        .bind(feed.id)
        .execute(&self.pool)
        .await?;

        if error_count >= DISABLE_AFTER_ERRORS && feed.disabled_at.is_none() {
            sqlx::query("UPDATE feeds SET disabled_at = ?, disable_reason = ? WHERE id = ?")
                .bind(now)
                .bind(format!("{} consecutive fetch failures", error_count))
                .bind(feed.id)
                .execute(&self.pool)
                .await?;
            tracing::warn!("Feed {} disabled after {} consecutive failures", feed.id, error_count);
        }

        tracing::warn!("Feed {} fetch failed ({}): {}", feed.id, error_count, message);
        Ok(())
    }

    /// Process one entry. Returns Ok(true) when a post was inserted,
    /// Ok(false) when it was a duplicate.
    async fn process_entry(
        tx: &mut Transaction<'_, Sqlite>,
        feed: &Feed,
        entry: &ParsedEntry,
        now: chrono::DateTime<Utc>,
        guid_collision_count: &mut i64,
        guid_unreliable: &mut bool,
    ) -> ApiResult<bool> {
        let normalized_url = entry.url.as_deref().and_then(normalize_url);
        let content = sanitize_html(entry.content.as_deref(), true);
        let content_hash =
            compute_content_hash(entry.content.as_deref(), entry.title.as_deref(), entry.url.as_deref());

        // Dedup by GUID, unless this feed's GUIDs have proven unreliable
        if let Some(guid) = entry.guid.as_deref() {
            if !*guid_unreliable {
                let existing: Option<(i64, Option<String>)> = sqlx::query_as(
                    "SELECT id, normalized_url FROM posts WHERE feed_id = ? AND guid = ?",
                )
                .bind(feed.id)
                .bind(guid)
                .fetch_optional(&mut **tx)
                .await?;

                if let Some((_, existing_url)) = existing {
                    // Same GUID but a different URL is a collision: the feed
                    // reuses GUIDs across distinct articles
                    let collision = matches!(
                        (existing_url.as_deref(), normalized_url.as_deref()),
                        (Some(a), Some(b)) if a != b
                    );
                    if collision {
                        *guid_collision_count += 1;
                        if *guid_collision_count >= GUID_COLLISION_LIMIT {
                            *guid_unreliable = true;
                        }
                    }
                    return Ok(false);
                }
            }
        }

        // Dedup by normalized URL
        if let Some(normalized) = normalized_url.as_deref() {
            if !feed.allow_duplicate_urls {
                let existing: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM posts WHERE feed_id = ? AND normalized_url = ?",
                )
                .bind(feed.id)
                .bind(normalized)
                .fetch_optional(&mut **tx)
                .await?;
                if existing.is_some() {
                    return Ok(false);
                }
            }
        }

        // Dedup by content hash, only when the entry has no other identity
        if entry.guid.is_none() && normalized_url.is_none() {
            if let Some(hash) = content_hash.as_deref() {
                let existing: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM posts WHERE feed_id = ? AND content_hash = ?",
                )
                .bind(feed.id)
                .bind(hash)
                .fetch_optional(&mut **tx)
                .await?;
                if existing.is_some() {
                    return Ok(false);
                }
            }
        }

        let sort_date = entry.published_at.unwrap_or(now);

        // Untrusted GUIDs are not stored: the per-feed unique index would
        // otherwise reject reused GUIDs that are in fact distinct articles
        let guid_to_store = if *guid_unreliable { None } else { entry.guid.as_deref() };

        let insert = sqlx::query(
            r#"INSERT INTO posts
               (feed_id, guid, url, normalized_url, title, author, content, content_hash,
                published_at, fetched_at, sort_date, is_read)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE)"#,
        )
        .bind(feed.id)
        .bind(guid_to_store)
        .bind(&entry.url)
        .bind(&normalized_url)
        .bind(&entry.title)
        .bind(&entry.author)
        .bind(&content)
        .bind(&content_hash)
        .bind(entry.published_at)
        .bind(now)
        .bind(sort_date)
        .execute(&mut **tx)
        .await?;

        let post_id = insert.last_insert_rowid();

        if let Some(hash) = content_hash.as_deref() {
            sqlx::query(
                "INSERT INTO summary_queue (post_id, content_hash, priority) VALUES (?, ?, 0)",
            )
            .bind(post_id)
            .bind(hash)
            .execute(&mut **tx)
            .await?;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn insert_feed(pool: &SqlitePool, url: &str) -> i64 {
        sqlx::query("INSERT INTO feeds (title, url) VALUES (?, ?)")
            .bind("example.com")
            .bind(url)
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    fn entry(guid: Option<&str>, url: Option<&str>, content: &str) -> ParsedEntry {
        ParsedEntry {
            guid: guid.map(String::from),
            url: url.map(String::from),
            title: Some("A Title".to_string()),
            author: None,
            content: Some(content.to_string()),
            published_at: None,
        }
    }

    async fn run_entry(pool: &SqlitePool, feed_id: i64, e: &ParsedEntry) -> bool {
        let feed: Feed = sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_one(pool)
            .await
            .unwrap();
        let mut collisions = feed.guid_collision_count;
        let mut unreliable = feed.guid_unreliable;
        let mut tx = pool.begin().await.unwrap();
        let inserted = IngestionService::process_entry(
            &mut tx,
            &feed,
            e,
            Utc::now(),
            &mut collisions,
            &mut unreliable,
        )
        .await
        .unwrap();
        sqlx::query("UPDATE feeds SET guid_collision_count = ?, guid_unreliable = ? WHERE id = ?")
            .bind(collisions)
            .bind(unreliable)
            .bind(feed_id)
            .execute(&mut *tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        inserted
    }

    #[tokio::test]
    async fn duplicate_guid_is_skipped() {
        let pool = db::test_pool().await;
        let feed_id = insert_feed(&pool, "https://a.com/feed").await;

        let e = entry(Some("guid-1"), Some("https://a.com/post"), "<p>body text</p>");
        assert!(run_entry(&pool, feed_id, &e).await);
        assert!(!run_entry(&pool, feed_id, &e).await);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn guid_collisions_flip_unreliable_flag() {
        let pool = db::test_pool().await;
        let feed_id = insert_feed(&pool, "https://a.com/feed").await;

        assert!(run_entry(&pool, feed_id, &entry(Some("g"), Some("https://a.com/1"), "<p>one</p>")).await);

        // Three same-guid different-url entries are collisions
        for i in 2..=4 {
            let url = format!("https://a.com/{}", i);
            let inserted =
                run_entry(&pool, feed_id, &entry(Some("g"), Some(url.as_str()), "<p>x</p>")).await;
            assert!(!inserted);
        }

        let feed: Feed = sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(feed.guid_collision_count, 3);
        assert!(feed.guid_unreliable);

        // GUID dedup is now bypassed: a fresh URL with the same guid inserts,
        // stored without the untrusted guid
        let inserted =
            run_entry(&pool, feed_id, &entry(Some("g"), Some("https://a.com/5"), "<p>five</p>")).await;
        assert!(inserted);

        let stored_guid: (Option<String>,) =
            sqlx::query_as("SELECT guid FROM posts WHERE normalized_url = 'https://a.com/5'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored_guid.0, None);
    }

    #[tokio::test]
    async fn url_dedup_respects_allow_duplicates() {
        let pool = db::test_pool().await;
        let feed_id = insert_feed(&pool, "https://a.com/feed").await;

        let first = entry(None, Some("https://a.com/post?utm_source=x"), "<p>one body</p>");
        let second = entry(None, Some("https://a.com/post"), "<p>other body</p>");
        assert!(run_entry(&pool, feed_id, &first).await);
        assert!(!run_entry(&pool, feed_id, &second).await);

        sqlx::query("UPDATE feeds SET allow_duplicate_urls = TRUE WHERE id = ?")
            .bind(feed_id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(run_entry(&pool, feed_id, &second).await);
    }

    #[tokio::test]
    async fn content_hash_fallback_only_without_identifiers() {
        let pool = db::test_pool().await;
        let feed_id = insert_feed(&pool, "https://a.com/feed").await;

        let bare = entry(None, None, "<p>identical body content</p>");
        assert!(run_entry(&pool, feed_id, &bare).await);
        assert!(!run_entry(&pool, feed_id, &bare).await);

        // Same content with a guid is not deduped by hash
        let with_guid = entry(Some("other"), None, "<p>identical body content</p>");
        assert!(run_entry(&pool, feed_id, &with_guid).await);
    }

    #[tokio::test]
    async fn inserted_posts_are_enqueued_for_summarization() {
        let pool = db::test_pool().await;
        let feed_id = insert_feed(&pool, "https://a.com/feed").await;

        assert!(run_entry(&pool, feed_id, &entry(Some("q"), Some("https://a.com/q"), "<p>text</p>")).await);

        let queue: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queue.0, 1);

        let entry_row: crate::models::SummaryQueueEntry =
            sqlx::query_as("SELECT * FROM summary_queue LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(entry_row.priority, 0);
    }
}
