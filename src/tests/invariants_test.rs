//! Cross-module invariants: schema-level uniqueness, sanitizer safety
//! sweep, normalizer properties.

use crate::db;
use crate::services::content_hasher::compute_content_hash;
use crate::services::html_sanitizer::{extract_text, sanitize_html};
use crate::services::url_normalizer::normalize_url;

async fn insert_feed(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query("INSERT INTO feeds (title, url) VALUES ('f', 'https://feed.example/rss')")
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

#[tokio::test]
async fn queue_is_at_most_once_per_post() {
    let pool = db::test_pool().await;
    let feed_id = insert_feed(&pool).await;
    let post_id = sqlx::query("INSERT INTO posts (feed_id, content_hash) VALUES (?, 'h')")
        .bind(feed_id)
        .execute(&pool)
        .await
        .unwrap()
        .last_insert_rowid();

    sqlx::query("INSERT INTO summary_queue (post_id, content_hash) VALUES (?, 'h')")
        .bind(post_id)
        .execute(&pool)
        .await
        .unwrap();

    let second = sqlx::query("INSERT INTO summary_queue (post_id, content_hash) VALUES (?, 'h')")
        .bind(post_id)
        .execute(&pool)
        .await;
    assert!(second.is_err());
}

#[tokio::test]
async fn schema_rejects_duplicate_guid_per_feed() {
    let pool = db::test_pool().await;
    let feed_id = insert_feed(&pool).await;

    sqlx::query("INSERT INTO posts (feed_id, guid) VALUES (?, 'g-1')")
        .bind(feed_id)
        .execute(&pool)
        .await
        .unwrap();

    let dup = sqlx::query("INSERT INTO posts (feed_id, guid) VALUES (?, 'g-1')")
        .bind(feed_id)
        .execute(&pool)
        .await;
    assert!(dup.is_err());

    // A different feed may reuse the guid
    let other_feed =
        sqlx::query("INSERT INTO feeds (title, url) VALUES ('g', 'https://other.example/rss')")
            .execute(&pool)
            .await
            .unwrap()
            .last_insert_rowid();
    sqlx::query("INSERT INTO posts (feed_id, guid) VALUES (?, 'g-1')")
        .bind(other_feed)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn scheduler_lock_is_single_row() {
    let pool = db::test_pool().await;

    sqlx::query(
        "INSERT INTO scheduler_lock (id, locked_by, locked_at, heartbeat_at) VALUES (1, 'a', CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)",
    )
    .execute(&pool)
    .await
    .unwrap();

    // The check constraint pins the table to id = 1
    let second = sqlx::query(
        "INSERT INTO scheduler_lock (id, locked_by, locked_at, heartbeat_at) VALUES (2, 'b', CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)",
    )
    .execute(&pool)
    .await;
    assert!(second.is_err());
}

#[test]
fn sanitizer_security_sweep() {
    let hostile = [
        r#"<script>steal()</script><p>ok</p>"#,
        r#"<img src="x" onerror="steal()"><p>ok</p>"#,
        r#"<a href="javascript:steal()">ok</a>"#,
        r#"<a href="vbscript:steal()">ok</a>"#,
        r#"<iframe src="https://evil.example"></iframe><p>ok</p>"#,
        r#"<img src="http://evil.example/track.gif"><p>ok</p>"#,
        r#"<p style="background:url(javascript:steal())">ok</p>"#,
        r#"<object data="x"></object><p>ok</p>"#,
    ];

    for input in hostile {
        let output = sanitize_html(Some(input), false).unwrap_or_default();
        let lower = output.to_lowercase();
        assert!(!lower.contains("<script"), "script survived: {}", output);
        assert!(!lower.contains("onerror"), "handler survived: {}", output);
        assert!(!lower.contains("javascript:"), "js url survived: {}", output);
        assert!(!lower.contains("vbscript:"), "vbs url survived: {}", output);
        assert!(!lower.contains("<iframe"), "iframe survived: {}", output);
        assert!(!lower.contains("http://evil.example"), "http img survived: {}", output);
    }
}

#[test]
fn sanitizer_links_always_carry_rel_and_target() {
    let inputs = [
        r#"<a href="https://a.example">x</a>"#,
        r#"<a href="https://a.example" rel="follow">x</a>"#,
        r#"<a href="https://a.example" target="_top">x</a>"#,
        r##"<p>before</p><a href="/rel">x</a><a href="#frag">y</a>"##,
    ];
    for input in inputs {
        let output = sanitize_html(Some(input), false).unwrap();
        let links = output.matches("<a ").count();
        assert_eq!(output.matches(r#"rel="noopener noreferrer""#).count(), links, "{}", output);
        assert_eq!(output.matches(r#"target="_blank""#).count(), links, "{}", output);
    }
}

#[test]
fn normalizer_idempotence_over_corpus() {
    let corpus = [
        "https://Example.COM:443/a/?utm_source=x&b=2&a=1#frag",
        "http://news.example.com:80/path/to/story/",
        "https://example.com/?fbclid=abc&gclid=def",
        "https://example.com/a?z=%20space&y=2",
        "http://example.com:8080/",
        "https://sub.domain.example.com/deep/path?id=1&ref=sidebar",
    ];
    for url in corpus {
        let once = normalize_url(url).unwrap();
        assert_eq!(normalize_url(&once).as_deref(), Some(once.as_str()), "input: {}", url);
    }
}

#[test]
fn content_hash_is_stable_across_pipeline_forms() {
    // The same article arriving as RSS html and as extracted text hashes
    // identically once markup is stripped
    let rss_form = "<div><p>The  quick   brown fox</p></div>";
    let extracted_form = "The quick brown fox";
    assert_eq!(
        compute_content_hash(Some(rss_form), Some("T"), Some("https://x.example/a")),
        compute_content_hash(Some(extracted_form), Some("T"), Some("https://x.example/a")),
    );
}

#[test]
fn extract_text_matches_sanitized_content() {
    let html = r#"<p>Alpha <strong>beta</strong></p><ul><li>gamma</li></ul>"#;
    let text = extract_text(Some(html)).unwrap();
    assert_eq!(text, "Alpha beta gamma");
}
