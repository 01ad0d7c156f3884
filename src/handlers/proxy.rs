//! Image proxy: fetches remote images on the client's behalf with URL
//! safety validation, a per-IP rate limit, size and content-type caps.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use url::{Host, Url};
use utoipa::ToSchema;

use crate::AppState;
use crate::utils::{ApiError, ApiResult};

const RATE_LIMIT_PER_MINUTE: u32 = 60;

const ALLOWED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "image/avif",
];

/// Per-IP request counters for the current minute window
static RATE_BUCKETS: Lazy<DashMap<IpAddr, (DateTime<Utc>, u32)>> = Lazy::new(DashMap::new);

static PROXY_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()
        .expect("Failed to create proxy HTTP client")
});

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProxyQuery {
    pub url: String,
}

/// Reject URLs that are not plain public http/https: loopback, private
/// ranges, and link-local targets are refused.
pub fn validate_public_url(url: &str) -> ApiResult<Url> {
    let parsed =
        Url::parse(url).map_err(|e| ApiError::invalid_data(format!("Invalid URL: {}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::invalid_data("URL must be http or https"));
    }

    match parsed.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
            {
                return Err(ApiError::invalid_data("URL resolves to a local host"));
            }
        },
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
                return Err(ApiError::invalid_data("URL targets a private address"));
            }
        },
        Some(Host::Ipv6(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(ApiError::invalid_data("URL targets a private address"));
            }
        },
        None => return Err(ApiError::invalid_data("URL has no host")),
    }

    Ok(parsed)
}

fn check_rate_limit(ip: IpAddr) -> ApiResult<()> {
    let now = Utc::now();
    let mut entry = RATE_BUCKETS.entry(ip).or_insert((now, 0));

    let (window_start, count) = *entry;
    if now - window_start > Duration::seconds(60) {
        *entry = (now, 1);
        return Ok(());
    }
    if count >= RATE_LIMIT_PER_MINUTE {
        return Err(ApiError::rate_limited("Too many proxy requests"));
    }
    *entry = (window_start, count + 1);
    Ok(())
}

/// Proxy a remote image
/// GET /api/proxy/image?url=...
#[utoipa::path(
    get,
    path = "/api/proxy/image",
    params(("url" = String, Query, description = "Image URL")),
    responses(
        (status = 200, description = "Image bytes"),
        (status = 400, description = "Unsafe URL or disallowed content type"),
        (status = 429, description = "Rate limit exceeded")
    ),
    security(("bearer_auth" = [])),
    tag = "Proxy"
)]
pub async fn proxy_image(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Response> {
    check_rate_limit(addr.ip())?;

    let url = validate_public_url(&query.url)?;

    let response = PROXY_CLIENT
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| ApiError::upstream_error(format!("Image fetch failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(ApiError::upstream_error(format!("Image fetch: HTTP {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_IMAGE_TYPES.contains(&content_type.as_str()) {
        return Err(ApiError::invalid_data(format!("Disallowed content type: {}", content_type)));
    }

    if let Some(length) = response.content_length() {
        if length as usize > state.config.proxy.max_size_bytes {
            return Err(ApiError::invalid_data("Image too large"));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::upstream_error(format!("Image read failed: {}", e)))?;
    if bytes.len() > state.config.proxy.max_size_bytes {
        return Err(ApiError::invalid_data("Image too large"));
    }

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_urls_pass() {
        assert!(validate_public_url("https://example.com/a.png").is_ok());
        assert!(validate_public_url("http://cdn.example.org/img?x=1").is_ok());
    }

    #[test]
    fn private_and_loopback_urls_fail() {
        for url in [
            "http://localhost/a.png",
            "http://127.0.0.1/a.png",
            "http://10.0.0.8/a.png",
            "http://192.168.1.1/a.png",
            "http://169.254.1.1/a.png",
            "http://[::1]/a.png",
            "ftp://example.com/a.png",
            "http://printer.local/a.png",
        ] {
            assert!(validate_public_url(url).is_err(), "{} should be rejected", url);
        }
    }

    #[test]
    fn rate_limit_window() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        for _ in 0..RATE_LIMIT_PER_MINUTE {
            assert!(check_rate_limit(ip).is_ok());
        }
        assert!(check_rate_limit(ip).is_err());
    }
}
