//! RSS/Atom feed fetching and parsing.
//!
//! Fetching uses manual redirect handling so cross-domain hops can be
//! inspected, and enforces a hard response-size cap while streaming.
//! Decoding is delegated to feed-rs, which tolerates most malformed feeds.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use once_cell::sync::Lazy;
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

pub const USER_AGENT: &str = "Lumen/1.0 (+https://github.com/lumen-reader/lumen; like Miniflux)";
const TIMEOUT_SECONDS: u64 = 10;
const MAX_SIZE_BYTES: usize = 10 * 1024 * 1024;
const MAX_REDIRECTS: u32 = 3;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(TIMEOUT_SECONDS))
        .redirect(Policy::none())
        .build()
        .expect("Failed to create feed HTTP client")
});

/// Parsed entry from a feed
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub guid: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Parsed feed
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Fetch error: {0}")]
    Fetch(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

fn same_host(url1: &str, url2: &str) -> bool {
    match (Url::parse(url1), Url::parse(url2)) {
        (Ok(a), Ok(b)) => {
            a.host_str().map(|h| h.to_ascii_lowercase()) == b.host_str().map(|h| h.to_ascii_lowercase())
        },
        _ => false,
    }
}

fn is_http_to_https(original: &str, redirect: &str) -> bool {
    match (Url::parse(original), Url::parse(redirect)) {
        (Ok(a), Ok(b)) => a.scheme() == "http" && b.scheme() == "https" && same_host(original, redirect),
        _ => false,
    }
}

/// Fetch feed bytes. Returns (body, final URL when redirects were followed).
pub async fn fetch_feed_content(url: &str) -> Result<(Vec<u8>, Option<String>), FeedError> {
    let mut current_url = url.to_string();
    let mut redirects_followed = 0u32;

    while redirects_followed <= MAX_REDIRECTS {
        let response = HTTP_CLIENT
            .get(&current_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FeedError::Fetch(format!("Timeout after {}s", TIMEOUT_SECONDS))
                } else {
                    FeedError::Fetch(format!("Connection error: {}", e))
                }
            })?;

        let status = response.status();

        if matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FeedError::Fetch("Redirect without Location header".to_string()))?;

            // Relative Location headers are resolved against the current URL
            let redirect_url = Url::parse(&current_url)
                .and_then(|base| base.join(location))
                .map(|u| u.to_string())
                .unwrap_or_else(|_| location.to_string());

            let is_safe =
                is_http_to_https(&current_url, &redirect_url) || same_host(&current_url, &redirect_url);
            if !is_safe {
                tracing::warn!("Redirect to different domain: {} -> {}", current_url, redirect_url);
            }

            if status == StatusCode::MOVED_PERMANENTLY {
                tracing::info!(
                    "Permanent redirect (301): {} -> {}. Consider updating the feed URL manually.",
                    current_url,
                    redirect_url
                );
            }

            current_url = redirect_url;
            redirects_followed += 1;
            continue;
        }

        if status.as_u16() >= 400 {
            return Err(FeedError::Fetch(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )));
        }

        if let Some(length) = response.content_length() {
            if length as usize > MAX_SIZE_BYTES {
                return Err(FeedError::Fetch(format!(
                    "Feed too large: {} bytes (max: {})",
                    length, MAX_SIZE_BYTES
                )));
            }
        }

        // Stream-enforce the cap: Content-Length can lie or be absent
        let mut content = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| FeedError::Fetch(format!("Connection error: {}", e)))?;
            content.extend_from_slice(&chunk);
            if content.len() > MAX_SIZE_BYTES {
                return Err(FeedError::Fetch(format!("Feed too large: > {} bytes", MAX_SIZE_BYTES)));
            }
        }

        let final_url = if current_url != url { Some(current_url) } else { None };
        return Ok((content, final_url));
    }

    Err(FeedError::Fetch(format!("Too many redirects (> {})", MAX_REDIRECTS)))
}

/// Decode RSS/Atom bytes into a [`ParsedFeed`].
pub fn parse_feed_content(content: &[u8]) -> Result<ParsedFeed, FeedError> {
    // An empty id generator keeps "no guid" observable; feed-rs would
    // otherwise synthesize one and defeat the content-hash dedup fallback.
    let parser = feed_rs::parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build();

    let feed = parser
        .parse(content)
        .map_err(|e| FeedError::Parse(format!("Invalid feed XML: {}", e)))?;

    let feed_title = feed.title.as_ref().map(|t| t.content.clone());
    let site_url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .or_else(|| feed.links.first())
        .map(|l| l.href.clone());

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

            ParsedEntry {
                guid: Some(entry.id).filter(|id| !id.is_empty()),
                url: entry.links.first().map(|l| l.href.clone()),
                title: entry.title.map(|t| t.content),
                author: entry.authors.first().map(|a| a.name.clone()),
                content,
                published_at: entry.published.or(entry.updated),
            }
        })
        .collect();

    Ok(ParsedFeed { title: feed_title, site_url, entries })
}

/// Fetch and parse a feed. Returns the feed and the final URL when the
/// fetch was redirected.
pub async fn fetch_and_parse(url: &str) -> Result<(ParsedFeed, Option<String>), FeedError> {
    let (content, final_url) = fetch_feed_content(url).await?;
    let parsed = parse_feed_content(&content)?;
    Ok((parsed, final_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_SAMPLE: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example Blog</title>
  <link>https://blog.example.com</link>
  <item>
    <guid>post-1</guid>
    <link>https://blog.example.com/post-1</link>
    <title>First Post</title>
    <author>alice@example.com</author>
    <description>&lt;p&gt;Hello&lt;/p&gt;</description>
    <pubDate>Mon, 06 Jan 2025 12:00:00 GMT</pubDate>
  </item>
  <item>
    <title>No identifiers</title>
    <description>Body only</description>
  </item>
</channel></rss>"#;

    const ATOM_SAMPLE: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <link href="https://atom.example.com/"/>
  <entry>
    <id>urn:uuid:entry-1</id>
    <title>Atom Entry</title>
    <link href="https://atom.example.com/1"/>
    <updated>2025-02-01T10:00:00Z</updated>
    <content type="html">&lt;p&gt;Rich&lt;/p&gt;</content>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_entries() {
        let feed = parse_feed_content(RSS_SAMPLE.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example Blog"));
        assert_eq!(feed.site_url.as_deref(), Some("https://blog.example.com"));
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.guid.as_deref(), Some("post-1"));
        assert_eq!(first.url.as_deref(), Some("https://blog.example.com/post-1"));
        assert_eq!(first.title.as_deref(), Some("First Post"));
        assert!(first.content.as_deref().unwrap().contains("Hello"));
        assert!(first.published_at.is_some());
    }

    #[test]
    fn missing_guid_stays_absent() {
        let feed = parse_feed_content(RSS_SAMPLE.as_bytes()).unwrap();
        let second = &feed.entries[1];
        assert_eq!(second.guid, None);
        assert_eq!(second.url, None);
        assert_eq!(second.content.as_deref(), Some("Body only"));
    }

    #[test]
    fn parses_atom_entries() {
        let feed = parse_feed_content(ATOM_SAMPLE.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Atom Feed"));
        let entry = &feed.entries[0];
        assert_eq!(entry.guid.as_deref(), Some("urn:uuid:entry-1"));
        assert!(entry.content.as_deref().unwrap().contains("Rich"));
        assert!(entry.published_at.is_some());
    }

    #[test]
    fn invalid_xml_is_a_parse_error() {
        let result = parse_feed_content(b"this is not xml at all");
        assert!(matches!(result, Err(FeedError::Parse(_))));
    }

    #[test]
    fn redirect_safety_checks() {
        assert!(same_host("http://a.com/x", "http://A.COM/y"));
        assert!(!same_host("http://a.com/x", "http://b.com/x"));
        assert!(is_http_to_https("http://a.com/x", "https://a.com/x"));
        assert!(!is_http_to_https("https://a.com/x", "http://a.com/x"));
    }
}
