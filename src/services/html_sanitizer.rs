//! HTML sanitization for post content.
//!
//! Allow-list filter over tags and attributes, with per-attribute URL
//! validation. Links are rewritten to open in a new tab without an opener.

use ammonia::Builder;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use std::borrow::Cow;
use std::collections::HashSet;

/// Maximum length of the short (list view) content
pub const MAX_CONTENT_LENGTH: usize = 500;

const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "hr", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "blockquote", "pre",
    "code", "a", "img", "strong", "b", "em", "i", "u", "s", "strike", "del", "ins", "table",
    "thead", "tbody", "tr", "th", "td", "figure", "figcaption", "div", "span", "sub", "sup",
];

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// href: http, https, relative paths, and fragment anchors
fn is_safe_href(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let lower = url.trim().to_ascii_lowercase();

    let dangerous = ["javascript:", "data:", "vbscript:", "file:", "about:"];
    if dangerous.iter().any(|p| lower.starts_with(p)) {
        return false;
    }

    if url.starts_with('/') || url.starts_with('#') {
        return true;
    }

    lower.starts_with("http://") || lower.starts_with("https://") || !lower.contains(':')
}

/// img src: https and data:image only. http is blocked to avoid mixed content.
fn is_safe_img_src(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let lower = url.trim().to_ascii_lowercase();

    if lower.starts_with("http://") {
        return false;
    }
    if lower.starts_with("data:image/") {
        return true;
    }
    if lower.starts_with("data:") {
        return false;
    }

    let dangerous = ["javascript:", "vbscript:", "file:"];
    if dangerous.iter().any(|p| lower.starts_with(p)) {
        return false;
    }

    // https URLs and relative paths
    lower.starts_with("https://") || !lower.contains(':')
}

fn build_cleaner() -> Builder<'static> {
    let mut builder = Builder::default();

    builder
        .tags(HashSet::from_iter(ALLOWED_TAGS.iter().copied()))
        .generic_attributes(HashSet::from_iter(["class", "id"]))
        .add_tag_attributes("a", ["href", "title", "target"])
        .add_tag_attributes("img", ["src", "alt", "title", "width", "height"])
        .add_tag_attributes("td", ["colspan", "rowspan"])
        .add_tag_attributes("th", ["colspan", "rowspan"])
        // The restrictive per-attribute checks live in attribute_filter;
        // "data" must be listed here or data:image sources never survive.
        .url_schemes(HashSet::from_iter(["http", "https", "data"]))
        .link_rel(Some("noopener noreferrer"))
        .set_tag_attribute_value("a", "target", "_blank")
        .attribute_filter(|element, attribute, value| match (element, attribute) {
            ("a", "href") => is_safe_href(value).then(|| Cow::from(value)),
            ("img", "src") => is_safe_img_src(value).then(|| Cow::from(value)),
            _ => Some(Cow::from(value)),
        });

    builder
}

/// Sanitize HTML, removing unsafe content.
///
/// - Drops tags and attributes outside the allow-list (scripts, styles,
///   event handlers, comments included)
/// - Validates href/src URLs per attribute
/// - Forces `rel="noopener noreferrer" target="_blank"` on every link
/// - When `truncate` is set, caps at [`MAX_CONTENT_LENGTH`] chars on a safe
///   boundary (never mid-tag) and appends an ellipsis
pub fn sanitize_html(html: Option<&str>, truncate: bool) -> Option<String> {
    let html = html?;
    if html.trim().is_empty() {
        return None;
    }

    let cleaned = build_cleaner().clean(html).to_string();

    let mut sanitized = WHITESPACE_RE.replace_all(&cleaned, " ").trim().to_string();

    if truncate && sanitized.chars().count() > MAX_CONTENT_LENGTH {
        let cut: usize = sanitized
            .char_indices()
            .nth(MAX_CONTENT_LENGTH)
            .map(|(i, _)| i)
            .unwrap_or(sanitized.len());
        let mut truncated = sanitized[..cut].to_string();

        // Never cut inside a tag: drop a trailing partial "<..."
        if let (Some(last_lt), last_gt) = (truncated.rfind('<'), truncated.rfind('>')) {
            if last_gt.map_or(true, |gt| last_lt > gt) {
                truncated.truncate(last_lt);
            }
        }

        sanitized = format!("{}...", truncated.trim_end());
    }

    if sanitized.is_empty() { None } else { Some(sanitized) }
}

/// Extract plain text from HTML with whitespace collapsed.
pub fn extract_text(html: Option<&str>) -> Option<String> {
    let html = html?;
    if html.trim().is_empty() {
        return None;
    }

    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");

    let collapsed = WHITESPACE_RE.replace_all(&text, " ").trim().to_string();
    if collapsed.is_empty() { None } else { Some(collapsed) }
}
