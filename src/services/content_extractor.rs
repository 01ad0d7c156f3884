//! Full article extraction.
//!
//! Readability-style main-text extraction over the fetched page, with a
//! curl-impersonate subprocess fallback for Cloudflare-challenged hosts.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::redirect::Policy;
use reqwest::{Client, header};
use scraper::{Html, Selector};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::html_sanitizer::{extract_text, sanitize_html};

const TIMEOUT_SECONDS: u64 = 15;
const MAX_CONTENT_SIZE: usize = 5 * 1024 * 1024;
const MIN_EXTRACTED_CHARS: usize = 100;
const IMPERSONATE_TIMEOUT_SECONDS: u64 = 35;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Non-article blocks removed before extraction (donation appeals, cookie
/// notices, newsletter popups, modals)
static NON_ARTICLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        "appeal", "donation", "donate", "fundrais", "cookie", "gdpr", "consent", "newsletter",
        "subscribe", "modal", "overlay", "popup",
    ]
    .iter()
    .map(|class| {
        Regex::new(&format!(
            r#"(?is)<div[^>]*class="[^"]*{}[^"]*"[^>]*>.*?</div>"#,
            class
        ))
        .unwrap()
    })
    .collect()
});

/// Phrases indicating the extraction landed on an appeal instead of the article
const NON_ARTICLE_TEXTS: &[&str] = &[
    "please don't scroll past this",
    "can you chip in",
    "please donate",
    "support us",
    "we need your help",
    "chip in today",
    "make a donation",
    "please pitch in",
];

/// Markers of a Cloudflare JavaScript challenge page
const CHALLENGE_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-browser-verification",
    "enable javascript and cookies to continue",
];

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(TIMEOUT_SECONDS))
        .redirect(Policy::limited(5))
        .build()
        .expect("Failed to create extractor HTTP client")
});

/// Result of a full-content extraction attempt
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub title: String,
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ExtractedContent {
    fn failure(title: impl Into<String>, error: impl Into<String>) -> Self {
        Self { title: title.into(), content: String::new(), success: false, error: Some(error.into()) }
    }
}

fn clean_non_article_content(html: &str) -> String {
    let mut html = html.to_string();
    for pattern in NON_ARTICLE_PATTERNS.iter() {
        html = pattern.replace_all(&html, "").into_owned();
    }
    html
}

fn is_non_article_content(text: &str) -> bool {
    let lower = text.to_lowercase();
    let matches = NON_ARTICLE_TEXTS.iter().filter(|phrase| lower.contains(*phrase)).count();
    matches >= 2
}

fn looks_like_challenge(body: &str) -> bool {
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Readability-style scoring: the candidate container with the most
/// paragraph text wins, weighted by class/id hints.
fn readability_extract(html: &str) -> (String, Option<String>) {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").unwrap();
    let title = document
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let candidate_selector = Selector::parse("article, main, section, div").unwrap();
    let paragraph_selector = Selector::parse("p, pre, blockquote, li").unwrap();

    let positive = ["article", "content", "post", "entry", "body", "story", "text", "main"];
    let negative = [
        "nav", "sidebar", "comment", "footer", "header", "menu", "promo", "related", "share",
        "social", "widget", "banner", "ad-",
    ];

    let mut best_score = 0f64;
    let mut best_html: Option<String> = None;

    for element in document.select(&candidate_selector) {
        let text_len: usize = element
            .select(&paragraph_selector)
            .map(|p| p.text().map(str::len).sum::<usize>())
            .sum();
        if text_len < 50 {
            continue;
        }

        let mut score = text_len as f64;

        let hint = format!(
            "{} {}",
            element.value().attr("class").unwrap_or_default(),
            element.value().attr("id").unwrap_or_default()
        )
        .to_lowercase();

        if positive.iter().any(|p| hint.contains(p)) {
            score *= 1.5;
        }
        if negative.iter().any(|n| hint.contains(n)) {
            score *= 0.2;
        }
        match element.value().name() {
            "article" | "main" => score *= 2.0,
            _ => {},
        }

        if score > best_score {
            best_score = score;
            best_html = Some(element.inner_html());
        }
    }

    (title, best_html)
}

/// Run extraction over already-fetched page HTML
fn extract_from_html(url: &str, html: &str) -> ExtractedContent {
    let cleaned = clean_non_article_content(html);
    let (title, article_html) = readability_extract(&cleaned);

    let Some(article_html) = article_html else {
        return ExtractedContent::failure(title, "Could not extract meaningful content");
    };

    let Some(clean_content) = sanitize_html(Some(&article_html), false) else {
        return ExtractedContent::failure(title, "Could not extract meaningful content");
    };

    let text_len = extract_text(Some(&clean_content)).map(|t| t.chars().count()).unwrap_or(0);
    if text_len < MIN_EXTRACTED_CHARS {
        return ExtractedContent::failure(title, "Could not extract meaningful content");
    }

    if is_non_article_content(&clean_content) {
        return ExtractedContent::failure(
            title,
            "Extracted content appears to be non-article (donation appeal, etc)",
        );
    }

    tracing::debug!("Extracted {} chars of article content from {}", text_len, url);
    ExtractedContent { title, content: clean_content, success: true, error: None }
}

/// Locate a TLS-fingerprint-impersonating curl on PATH
fn find_impersonate_binary() -> Option<PathBuf> {
    let names = ["curl-impersonate-chrome", "curl_chrome116", "curl_chrome110", "curl-impersonate"];
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in names {
            let candidate: PathBuf = Path::new(&dir).join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Fetch through curl-impersonate when Cloudflare blocks the plain client
async fn fetch_with_impersonation(url: &str) -> Result<String, String> {
    let binary = find_impersonate_binary().ok_or("curl-impersonate not available on PATH")?;

    tracing::info!("Cloudflare challenge detected, retrying {} via {:?}", url, binary);

    let output = tokio::time::timeout(
        Duration::from_secs(IMPERSONATE_TIMEOUT_SECONDS),
        tokio::process::Command::new(&binary)
            .arg("-s")
            .arg("-L")
            .arg("--max-time")
            .arg("30")
            .arg(url)
            .output(),
    )
    .await
    .map_err(|_| format!("curl-impersonate timeout after {}s", IMPERSONATE_TIMEOUT_SECONDS))?
    .map_err(|e| format!("curl-impersonate failed to run: {}", e))?;

    if !output.status.success() {
        return Err(format!("curl-impersonate exited with {}", output.status));
    }

    let body = String::from_utf8_lossy(&output.stdout).into_owned();
    if looks_like_challenge(&body) {
        return Err("JavaScript challenge persists after impersonation".to_string());
    }
    Ok(body)
}

/// Extract the full article content from a page URL.
pub async fn extract_full_content(url: &str) -> ExtractedContent {
    let response = match HTTP_CLIENT
        .get(url)
        .header(header::USER_AGENT, BROWSER_USER_AGENT)
        .header(
            header::ACCEPT,
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        )
        .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9,pt-BR;q=0.8,pt;q=0.7")
        .header("Upgrade-Insecure-Requests", "1")
        .header("Sec-Fetch-Dest", "document")
        .header("Sec-Fetch-Mode", "navigate")
        .header("Sec-Fetch-Site", "none")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return ExtractedContent::failure("", "Timeout"),
        Err(e) => return ExtractedContent::failure("", e.to_string()),
    };

    let status = response.status().as_u16();

    // Cloudflare fronting: challenge responses use 403/503
    if status == 403 || status == 503 {
        return match fetch_with_impersonation(url).await {
            Ok(body) => extract_from_html(url, &body),
            Err(e) => ExtractedContent::failure("", format!("HTTP {}: {}", status, e)),
        };
    }

    if status != 200 {
        return ExtractedContent::failure("", format!("HTTP {}", status));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
        return ExtractedContent::failure("", format!("Invalid content type: {}", content_type));
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return ExtractedContent::failure("", e.to_string()),
    };

    if body.len() > MAX_CONTENT_SIZE {
        return ExtractedContent::failure("", "Content too large");
    }

    // A 200 can still be a challenge interstitial
    if looks_like_challenge(&body) {
        return match fetch_with_impersonation(url).await {
            Ok(clean_body) => extract_from_html(url, &clean_body),
            Err(e) => ExtractedContent::failure("", e),
        };
    }

    extract_from_html(url, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(article: &str) -> String {
        format!(
            r#"<html><head><title>Test Page</title></head><body>
            <nav class="nav"><p>Home About Contact and a lot of navigation text goes here</p></nav>
            <article class="post-content">{}</article>
            <footer class="footer"><p>Copyright</p></footer>
            </body></html>"#,
            article
        )
    }

    #[test]
    fn picks_article_over_navigation() {
        let body = "<p>".to_string() + &"Real article text. ".repeat(30) + "</p>";
        let result = extract_from_html("https://x.com", &page(&body));
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.title, "Test Page");
        assert!(result.content.contains("Real article text."));
        assert!(!result.content.contains("Copyright"));
    }

    #[test]
    fn rejects_short_content() {
        let result = extract_from_html("https://x.com", &page("<p>too short</p>"));
        assert!(!result.success);
    }

    #[test]
    fn rejects_donation_appeals() {
        let body = format!(
            "<p>{} please donate and also can you chip in right now {}</p>",
            "filler text ".repeat(20),
            "more filler ".repeat(20)
        );
        let result = extract_from_html("https://x.com", &page(&body));
        assert!(!result.success);
    }

    #[test]
    fn strips_known_non_article_blocks() {
        let html = format!(
            r#"<html><head><title>T</title></head><body>
            <div class="newsletter-signup"><p>{}</p></div>
            <article><p>{}</p></article></body></html>"#,
            "subscribe now ".repeat(50),
            "actual story content here. ".repeat(20)
        );
        let result = extract_from_html("https://x.com", &html);
        assert!(result.success);
        assert!(!result.content.contains("subscribe now"));
    }

    #[test]
    fn challenge_detection() {
        assert!(looks_like_challenge("<title>Just a moment...</title>"));
        assert!(looks_like_challenge("Checking your browser before accessing"));
        assert!(!looks_like_challenge("<p>A normal page about moments</p>"));
    }
}
