//! Tag persistence for the suggestion prefilter.

use sqlx::{Sqlite, Transaction};

use crate::utils::ApiResult;

const MAX_TAG_LENGTH: usize = 50;

/// Save tags for a post, replacing any existing tags.
///
/// Tags are lowercased, trimmed, length-bounded, and deduplicated.
/// Runs inside the caller's transaction.
pub async fn save_post_tags(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: i64,
    tags: &[String],
) -> ApiResult<u32> {
    if tags.is_empty() {
        return Ok(0);
    }

    sqlx::query("DELETE FROM post_tags WHERE post_id = ?")
        .bind(post_id)
        .execute(&mut **tx)
        .await?;

    let mut seen = std::collections::HashSet::new();
    let mut count = 0u32;
    for tag in tags {
        let tag = tag.to_lowercase().trim().to_string();
        if !tag.is_empty() && tag.len() <= MAX_TAG_LENGTH && seen.insert(tag.clone()) {
            sqlx::query("INSERT INTO post_tags (post_id, tag) VALUES (?, ?)")
                .bind(post_id)
                .bind(&tag)
                .execute(&mut **tx)
                .await?;
            count += 1;
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup_post(pool: &sqlx::SqlitePool) -> i64 {
        let feed_id = sqlx::query("INSERT INTO feeds (title, url) VALUES ('f', 'https://f.com/rss')")
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query("INSERT INTO posts (feed_id) VALUES (?)")
            .bind(feed_id)
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    #[tokio::test]
    async fn tags_normalized_and_deduped() {
        let pool = db::test_pool().await;
        let post_id = setup_post(&pool).await;

        let tags = vec![
            "Rust".to_string(),
            " rust ".to_string(),
            "".to_string(),
            "databases".to_string(),
            "x".repeat(60),
        ];
        let mut tx = pool.begin().await.unwrap();
        let saved = save_post_tags(&mut tx, post_id, &tags).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(saved, 2);

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM post_tags WHERE post_id = ? ORDER BY tag")
                .bind(post_id)
                .fetch_all(&pool)
                .await
                .unwrap();
        let tags: Vec<&str> = rows.iter().map(|r| r.0.as_str()).collect();
        assert_eq!(tags, vec!["databases", "rust"]);
    }

    #[tokio::test]
    async fn regeneration_replaces_existing_tags() {
        let pool = db::test_pool().await;
        let post_id = setup_post(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        save_post_tags(&mut tx, post_id, &["old".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        save_post_tags(&mut tx, post_id, &["new".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        let rows: Vec<(String,)> = sqlx::query_as("SELECT tag FROM post_tags WHERE post_id = ?")
            .bind(post_id)
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "new");
    }
}
