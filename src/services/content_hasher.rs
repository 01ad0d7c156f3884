//! Content hashing for deduplication and content-addressed summaries.
//!
//! Text is normalized before hashing so cosmetic differences (markup,
//! whitespace, boilerplate) do not produce distinct hashes. Title and URL
//! are folded in so minimal-content posts with distinct titles still hash
//! distinctly.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::html_sanitizer::extract_text;

/// Maximum normalized size fed to the hash; larger inputs keep head + tail
const MAX_HASH_SIZE: usize = 200 * 1024;

/// Boilerplate fragments that vary between fetches of the same article
static BOILERPLATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Timestamps and dates
        r"(?i)\b\d{1,2}[/.-]\d{1,2}[/.-]\d{2,4}\b",
        r"(?i)\b\d{1,2}:\d{2}(:\d{2})?\s*(AM|PM|am|pm)?\b",
        // "Read more", "Continue reading", etc.
        r"(?i)\b(leia|read|continue|ver|see)\s+(mais|more|reading|lendo)\b",
        r"(?i)\b(clique|click)\s+(aqui|here)\b",
        // Sharing
        r"(?i)\b(share|compartilh[ae]|tweet|retweet)\b",
        // Cookie/newsletter banners
        r"(?i)\b(newsletter|subscribe|inscreva-se|cadastre-se)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalize text for a stable hash: lowercase, boilerplate removed,
/// whitespace collapsed.
fn normalize_for_hash(text: &str) -> String {
    let mut text = text.to_lowercase();

    for pattern in BOILERPLATE_PATTERNS.iter() {
        text = pattern.replace_all(&text, "").into_owned();
    }

    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// Truncate to a char boundary at or below `max` bytes
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Compute the SHA-256 content hash over normalized (title + url + text).
///
/// Returns None when nothing remains after normalization.
pub fn compute_content_hash(
    content: Option<&str>,
    title: Option<&str>,
    url: Option<&str>,
) -> Option<String> {
    let text = extract_text(content)?;

    let mut normalized = normalize_for_hash(&text);
    if normalized.is_empty() {
        return None;
    }

    // Head + tail of very large articles captures edits on either end
    if normalized.len() > MAX_HASH_SIZE {
        let half = MAX_HASH_SIZE / 2;
        let head_end = floor_char_boundary(&normalized, half);
        let tail_start = floor_char_boundary(&normalized, normalized.len() - half);
        normalized = format!("{}{}", &normalized[..head_end], &normalized[tail_start..]);
    }

    let mut prefix = String::new();
    if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
        prefix.push_str(&title.to_lowercase());
        prefix.push('\n');
    }
    if let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) {
        prefix.push_str(url);
        prefix.push('\n');
    }

    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(normalized.as_bytes());

    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let a = compute_content_hash(Some("<p>Hello World</p>"), Some("Title"), Some("https://x.com"));
        let b = compute_content_hash(Some("<p>Hello World</p>"), Some("Title"), Some("https://x.com"));
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn markup_and_whitespace_do_not_matter() {
        let a = compute_content_hash(Some("<p>Hello   World</p>"), None, None);
        let b = compute_content_hash(Some("<div>Hello\nWorld</div>"), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn case_does_not_matter() {
        let a = compute_content_hash(Some("HELLO WORLD"), None, None);
        let b = compute_content_hash(Some("hello world"), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_titles_hash_distinctly() {
        let a = compute_content_hash(Some("same body"), Some("First"), None);
        let b = compute_content_hash(Some("same body"), Some("Second"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn boilerplate_is_ignored() {
        let a = compute_content_hash(Some("Story text. Read more. Subscribe"), None, None);
        let b = compute_content_hash(Some("Story text."), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn dates_are_ignored() {
        let a = compute_content_hash(Some("Story 12/01/2026 text"), None, None);
        let b = compute_content_hash(Some("Story 13/02/2025 text"), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_none() {
        assert_eq!(compute_content_hash(None, Some("t"), None), None);
        assert_eq!(compute_content_hash(Some(""), None, None), None);
        assert_eq!(compute_content_hash(Some("<p></p>"), None, None), None);
    }

    #[test]
    fn oversized_content_keeps_head_and_tail() {
        let big = "a".repeat(300 * 1024);
        let hash = compute_content_hash(Some(&big), None, None);
        assert!(hash.is_some());

        // Changing the middle of an oversized document does not change the hash
        let mut other = big.clone();
        other.replace_range(150 * 1024..150 * 1024 + 5, "zzzzz");
        assert_eq!(hash, compute_content_hash(Some(&other), None, None));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = compute_content_hash(Some("body"), None, None).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
