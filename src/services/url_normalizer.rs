//! URL normalization for deduplication.
//!
//! Applies consistent rules so the same article URL always compares equal:
//! lowercase scheme/host, default port and fragment removed, tracking query
//! parameters stripped, remaining parameters sorted. The result is
//! idempotent: normalize(normalize(u)) == normalize(u).

use once_cell::sync::Lazy;
use std::collections::HashSet;
use url::Url;

/// Tracking parameters removed during normalization (closed set)
static TRACKING_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // UTM
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
        "utm_id",
        "utm_source_platform",
        "utm_creative_format",
        // Facebook
        "fbclid",
        "fb_action_ids",
        "fb_action_types",
        "fb_source",
        "fb_ref",
        // Google
        "gclid",
        "gclsrc",
        "dclid",
        // Twitter
        "twclid",
        // Microsoft/Bing
        "msclkid",
        // Mailchimp
        "mc_cid",
        "mc_eid",
        // HubSpot
        "hsa_acc",
        "hsa_cam",
        "hsa_grp",
        "hsa_ad",
        "hsa_src",
        "hsa_tgt",
        "hsa_kw",
        "hsa_mt",
        "hsa_net",
        "hsa_ver",
        // Other common
        "_ga",
        "_gl",
        "ref",
        "source",
        "via",
    ]
    .into_iter()
    .collect()
});

/// Normalize a URL for consistent comparison.
///
/// Returns None for anything that is not a plain http/https URL with a
/// hostname, or that carries userinfo.
pub fn normalize_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!("Invalid URL: {} - {}", url, e);
            return None;
        },
    };

    // Reject URLs with userinfo (security)
    if !parsed.username().is_empty() || parsed.password().is_some() {
        tracing::warn!("URL with userinfo rejected: {}", url);
        return None;
    }

    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        tracing::warn!("URL with invalid scheme: {}", url);
        return None;
    }

    let hostname = parsed.host_str()?.to_ascii_lowercase();
    if hostname.is_empty() {
        return None;
    }

    // Remove default port
    let default_port = if scheme == "http" { 80 } else { 443 };
    let port = parsed.port().filter(|&p| p != default_port);

    // Remove trailing slash (except for root)
    let mut path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path = path.trim_end_matches('/').to_string();
    }
    if path.is_empty() {
        path = "/".to_string();
    }

    // Drop tracking parameters, then sort the survivors for consistency
    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let query = if params.is_empty() {
        String::new()
    } else {
        let encoded: Vec<String> = params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    urlencoding::encode(k).into_owned()
                } else {
                    format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                }
            })
            .collect();
        encoded.join("&")
    };

    let mut normalized = format!("{}://{}", scheme, hostname);
    if let Some(port) = port {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(&path);
    if !query.is_empty() {
        normalized.push('?');
        normalized.push_str(&query);
    }

    Some(normalized)
}

/// Extract the lowercase hostname from a URL
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_params_and_sorts() {
        assert_eq!(
            normalize_url("https://Example.COM:443/a/?utm_source=x&b=2&a=1#frag").as_deref(),
            Some("https://example.com/a?a=1&b=2")
        );
    }

    #[test]
    fn rejects_userinfo() {
        assert_eq!(normalize_url("http://u:p@host/x"), None);
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(normalize_url("ftp://example.com/file"), None);
        assert_eq!(normalize_url("javascript:alert(1)"), None);
    }

    #[test]
    fn keeps_non_default_port() {
        assert_eq!(
            normalize_url("http://example.com:8080/x").as_deref(),
            Some("http://example.com:8080/x")
        );
        assert_eq!(normalize_url("http://example.com:80/x").as_deref(), Some("http://example.com/x"));
    }

    #[test]
    fn trailing_slash_removed_except_root() {
        assert_eq!(normalize_url("https://example.com/a/").as_deref(), Some("https://example.com/a"));
        assert_eq!(normalize_url("https://example.com/").as_deref(), Some("https://example.com/"));
        assert_eq!(normalize_url("https://example.com").as_deref(), Some("https://example.com/"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            "https://Example.COM:443/a/?utm_source=x&b=2&a=1#frag",
            "http://example.com:8080/path/?ref=rss&id=9",
            "https://example.com/",
            "https://example.com/a?Z=1&a=2",
        ];
        for case in cases {
            let once = normalize_url(case).unwrap();
            let twice = normalize_url(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", case);
        }
    }

    #[test]
    fn blank_query_values_preserved() {
        assert_eq!(
            normalize_url("https://example.com/a?flag&b=1").as_deref(),
            Some("https://example.com/a?b=1&flag")
        );
    }

    #[test]
    fn extract_domain_lowercases() {
        assert_eq!(extract_domain("https://News.Example.com/x").as_deref(), Some("news.example.com"));
        assert_eq!(extract_domain("not a url"), None);
    }
}
