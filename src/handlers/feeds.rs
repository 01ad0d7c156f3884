//! Feed management endpoints: CRUD, manual refresh, autodiscovery, OPML.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use url::Url;
use utoipa::ToSchema;
use validator::Validate;

use crate::AppState;
use crate::models::{CreateFeedRequest, DiscoveredFeed, Feed, FeedResponse, UpdateFeedRequest};
use crate::services::feed_parser;
use crate::services::url_normalizer::extract_domain;
use crate::utils::{ApiError, ApiResult};

const MAX_OPML_BYTES: usize = 1024 * 1024;
const MAX_CATEGORY_NAME_CHARS: usize = 100;

/// Paths probed during feed autodiscovery
const COMMON_FEED_PATHS: &[&str] =
    &["/feed", "/rss", "/rss.xml", "/atom.xml", "/feed.xml", "/index.xml"];

#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshResponse {
    pub new_posts: u32,
    pub skipped_duplicates: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DiscoverQuery {
    pub url: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ImportOpmlResponse {
    pub imported: u32,
    pub skipped: u32,
}

/// List feeds with unread counts
/// GET /api/feeds
#[utoipa::path(
    get,
    path = "/api/feeds",
    responses((status = 200, description = "All feeds", body = Vec<FeedResponse>)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn list_feeds(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<FeedResponse>>> {
    let feeds: Vec<Feed> = sqlx::query_as("SELECT * FROM feeds ORDER BY title ASC")
        .fetch_all(&state.db)
        .await?;

    let counts: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT feed_id, COUNT(*) FROM posts WHERE is_read = FALSE GROUP BY feed_id",
    )
    .fetch_all(&state.db)
    .await?;
    let counts: HashMap<i64, i64> = counts.into_iter().collect();

    let response = feeds
        .into_iter()
        .map(|feed| {
            let unread_count = counts.get(&feed.id).copied().unwrap_or(0);
            FeedResponse { feed, unread_count }
        })
        .collect();
    Ok(Json(response))
}

/// Subscribe to a feed
/// POST /api/feeds
#[utoipa::path(
    post,
    path = "/api/feeds",
    request_body = CreateFeedRequest,
    responses(
        (status = 201, description = "Feed created", body = Feed),
        (status = 409, description = "Feed URL already subscribed")
    ),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateFeedRequest>,
) -> ApiResult<(StatusCode, Json<Feed>)> {
    req.validate()?;

    let parsed = Url::parse(&req.url)
        .map_err(|e| ApiError::invalid_data(format!("Invalid feed URL: {}", e)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::invalid_data("Feed URL must be http or https"));
    }

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
        .bind(&req.url)
        .fetch_optional(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::conflict("Feed URL already subscribed"));
    }

    // Until the first fetch replaces it, the hostname stands in for a title
    let title = req
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| extract_domain(&req.url))
        .unwrap_or_else(|| req.url.clone());

    let id = sqlx::query("INSERT INTO feeds (title, url, category_id) VALUES (?, ?, ?)")
        .bind(title.trim())
        .bind(&req.url)
        .bind(req.category_id)
        .execute(&state.db)
        .await?
        .last_insert_rowid();

    let feed: Feed = sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await?;

    tracing::info!("Feed subscribed: {} ({})", feed.title, feed.url);
    Ok((StatusCode::CREATED, Json(feed)))
}

/// Update a feed
/// PUT /api/feeds/:id
#[utoipa::path(
    put,
    path = "/api/feeds/{id}",
    params(("id" = i64, Path, description = "Feed ID")),
    request_body = UpdateFeedRequest,
    responses((status = 200, description = "Feed updated", body = Feed)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn update_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFeedRequest>,
) -> ApiResult<Json<Feed>> {
    load_feed(&state, id).await?;

    if let Some(title) = &req.title {
        sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title.trim())
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if req.category_id.is_some() {
        sqlx::query("UPDATE feeds SET category_id = ? WHERE id = ?")
            .bind(req.category_id)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(site_url) = &req.site_url {
        sqlx::query("UPDATE feeds SET site_url = ? WHERE id = ?")
            .bind(site_url)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(allow) = req.allow_duplicate_urls {
        sqlx::query("UPDATE feeds SET allow_duplicate_urls = ? WHERE id = ?")
            .bind(allow)
            .bind(id)
            .execute(&state.db)
            .await?;
    }

    let feed = load_feed(&state, id).await?;
    Ok(Json(feed))
}

/// Unsubscribe; posts cascade-delete
/// DELETE /api/feeds/:id
#[utoipa::path(
    delete,
    path = "/api/feeds/{id}",
    params(("id" = i64, Path, description = "Feed ID")),
    responses((status = 204, description = "Feed deleted")),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn delete_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let deleted = sqlx::query("DELETE FROM feeds WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found(format!("Feed {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Trigger an immediate ingest
/// POST /api/feeds/:id/refresh
#[utoipa::path(
    post,
    path = "/api/feeds/{id}/refresh",
    params(("id" = i64, Path, description = "Feed ID")),
    responses((status = 200, description = "Ingestion result", body = RefreshResponse)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RefreshResponse>> {
    let result = state.ingestion.ingest_feed(id).await?;
    Ok(Json(RefreshResponse {
        new_posts: result.new_posts,
        skipped_duplicates: result.skipped_duplicates,
        errors: result.errors,
    }))
}

/// Re-enable a disabled feed and reset its error state
/// POST /api/feeds/:id/enable
#[utoipa::path(
    post,
    path = "/api/feeds/{id}/enable",
    params(("id" = i64, Path, description = "Feed ID")),
    responses((status = 200, description = "Feed enabled", body = Feed)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn enable_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Feed>> {
    load_feed(&state, id).await?;

    sqlx::query(
        r#"UPDATE feeds
           SET disabled_at = NULL, disable_reason = NULL, error_count = 0,
               last_error = NULL, last_error_at = NULL, next_retry_at = NULL
           WHERE id = ?"#,
    )
    .bind(id)
    .execute(&state.db)
    .await?;

    let feed = load_feed(&state, id).await?;
    Ok(Json(feed))
}

/// Discover feeds for a site URL
/// POST /api/feeds/discover?url=...
#[utoipa::path(
    post,
    path = "/api/feeds/discover",
    params(("url" = String, Query, description = "Site or feed URL")),
    responses((status = 200, description = "Discovered feeds", body = Vec<DiscoveredFeed>)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn discover_feeds(
    State(_state): State<Arc<AppState>>,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<Json<Vec<DiscoveredFeed>>> {
    let base = Url::parse(&query.url)
        .map_err(|e| ApiError::invalid_data(format!("Invalid URL: {}", e)))?;
    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ApiError::invalid_data("URL must be http or https"));
    }

    // 1. The URL itself may already be a feed
    if let Ok((parsed, _)) = feed_parser::fetch_and_parse(base.as_str()).await {
        return Ok(Json(vec![DiscoveredFeed { url: base.to_string(), title: parsed.title }]));
    }

    let mut discovered: Vec<DiscoveredFeed> = Vec::new();

    // 2. <link rel="alternate"> declarations in the page head
    if let Ok((body, _)) = feed_parser::fetch_feed_content(base.as_str()).await {
        let html = String::from_utf8_lossy(&body);
        let document = Html::parse_document(&html);
        let selector = Selector::parse(
            r#"link[rel="alternate"][type="application/rss+xml"], link[rel="alternate"][type="application/atom+xml"]"#,
        )
        .unwrap();

        for link in document.select(&selector) {
            if let Some(href) = link.value().attr("href") {
                if let Ok(feed_url) = base.join(href) {
                    discovered.push(DiscoveredFeed {
                        url: feed_url.to_string(),
                        title: link.value().attr("title").map(String::from),
                    });
                }
            }
        }
    }

    // 3. Common feed paths, verified by parsing
    if discovered.is_empty() {
        for path in COMMON_FEED_PATHS {
            let Ok(candidate) = base.join(path) else { continue };
            if let Ok((parsed, _)) = feed_parser::fetch_and_parse(candidate.as_str()).await {
                discovered.push(DiscoveredFeed { url: candidate.to_string(), title: parsed.title });
            }
        }
    }

    Ok(Json(discovered))
}

/// Import subscriptions from an OPML document (max 1 MB)
/// POST /api/feeds/import-opml
#[utoipa::path(
    post,
    path = "/api/feeds/import-opml",
    responses((status = 200, description = "Import counts", body = ImportOpmlResponse)),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn import_opml(
    State(state): State<Arc<AppState>>,
    body: String,
) -> ApiResult<Json<ImportOpmlResponse>> {
    if body.len() > MAX_OPML_BYTES {
        return Err(ApiError::invalid_data("OPML document too large (max 1 MB)"));
    }

    let mut reader = quick_xml::Reader::from_str(&body);
    reader.config_mut().trim_text(true);

    let mut imported = 0u32;
    let mut skipped = 0u32;
    // Stack of category ids for nested <outline> containers
    let mut category_stack: Vec<Option<i64>> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ApiError::invalid_data(format!("Invalid OPML: {}", e)))?;

        match event {
            Event::Start(ref e) if e.name().as_ref() == b"outline" => {
                let attrs = outline_attributes(e)?;
                if attrs.contains_key("xmlUrl") {
                    let parent = category_stack.last().copied().flatten();
                    import_outline_feed(&state, &attrs, parent, &mut imported, &mut skipped).await?;
                    // Feed outlines should be empty, but tolerate children
                    category_stack.push(parent);
                } else {
                    let category_id = ensure_category(&state, &attrs).await?;
                    category_stack.push(category_id);
                }
            },
            Event::Empty(ref e) if e.name().as_ref() == b"outline" => {
                let attrs = outline_attributes(e)?;
                if attrs.contains_key("xmlUrl") {
                    let parent = category_stack.last().copied().flatten();
                    import_outline_feed(&state, &attrs, parent, &mut imported, &mut skipped).await?;
                }
            },
            Event::End(ref e) if e.name().as_ref() == b"outline" => {
                category_stack.pop();
            },
            Event::Eof => break,
            _ => {},
        }
    }

    tracing::info!("OPML import: {} feeds imported, {} skipped", imported, skipped);
    Ok(Json(ImportOpmlResponse { imported, skipped }))
}

/// Export subscriptions as OPML
/// GET /api/feeds/export-opml
#[utoipa::path(
    get,
    path = "/api/feeds/export-opml",
    responses((status = 200, description = "OPML document")),
    security(("bearer_auth" = [])),
    tag = "Feeds"
)]
pub async fn export_opml(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let categories: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, name FROM categories ORDER BY position ASC, name ASC")
            .fetch_all(&state.db)
            .await?;
    let feeds: Vec<Feed> = sqlx::query_as("SELECT * FROM feeds ORDER BY title ASC")
        .fetch_all(&state.db)
        .await?;

    let xml = build_opml(&categories, &feeds)
        .map_err(|e| ApiError::internal_error(format!("OPML generation failed: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/x-opml; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"lumen.opml\""),
        ],
        xml,
    ))
}

fn outline_attributes(e: &BytesStart) -> ApiResult<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ApiError::invalid_data(format!("Invalid OPML: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ApiError::invalid_data(format!("Invalid OPML: {}", e)))?
            .to_string();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

async fn ensure_category(
    state: &AppState,
    attrs: &HashMap<String, String>,
) -> ApiResult<Option<i64>> {
    let name = attrs
        .get("title")
        .or_else(|| attrs.get("text"))
        .map(|n| n.chars().take(MAX_CATEGORY_NAME_CHARS).collect::<String>())
        .filter(|n| !n.trim().is_empty());
    let Some(name) = name else { return Ok(None) };

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM categories WHERE name = ?")
        .bind(&name)
        .fetch_optional(&state.db)
        .await?;
    if let Some((id,)) = existing {
        return Ok(Some(id));
    }

    let id = sqlx::query("INSERT INTO categories (name) VALUES (?)")
        .bind(&name)
        .execute(&state.db)
        .await?
        .last_insert_rowid();
    Ok(Some(id))
}

async fn import_outline_feed(
    state: &AppState,
    attrs: &HashMap<String, String>,
    category_id: Option<i64>,
    imported: &mut u32,
    skipped: &mut u32,
) -> ApiResult<()> {
    let Some(xml_url) = attrs.get("xmlUrl").filter(|u| !u.trim().is_empty()) else {
        *skipped += 1;
        return Ok(());
    };

    if Url::parse(xml_url).map(|u| u.scheme() == "http" || u.scheme() == "https") != Ok(true) {
        *skipped += 1;
        return Ok(());
    }

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
        .bind(xml_url)
        .fetch_optional(&state.db)
        .await?;
    if existing.is_some() {
        *skipped += 1;
        return Ok(());
    }

    let title = attrs
        .get("title")
        .or_else(|| attrs.get("text"))
        .cloned()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| extract_domain(xml_url))
        .unwrap_or_else(|| xml_url.clone());

    sqlx::query("INSERT INTO feeds (title, url, site_url, category_id) VALUES (?, ?, ?, ?)")
        .bind(title.trim())
        .bind(xml_url)
        .bind(attrs.get("htmlUrl"))
        .bind(category_id)
        .execute(&state.db)
        .await?;

    *imported += 1;
    Ok(())
}

fn build_opml(categories: &[(i64, String)], feeds: &[Feed]) -> Result<String, quick_xml::Error> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "1.0"));
    writer.write_event(Event::Start(opml))?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(BytesText::new("Lumen subscriptions")))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;
    writer.write_event(Event::End(BytesEnd::new("head")))?;

    writer.write_event(Event::Start(BytesStart::new("body")))?;

    let write_feed = |writer: &mut Writer<Cursor<Vec<u8>>>, feed: &Feed| {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", feed.title.as_str()));
        outline.push_attribute(("title", feed.title.as_str()));
        outline.push_attribute(("xmlUrl", feed.url.as_str()));
        if let Some(site_url) = &feed.site_url {
            outline.push_attribute(("htmlUrl", site_url.as_str()));
        }
        writer.write_event(Event::Empty(outline))
    };

    for (category_id, name) in categories {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("text", name.as_str()));
        outline.push_attribute(("title", name.as_str()));
        writer.write_event(Event::Start(outline))?;

        for feed in feeds.iter().filter(|f| f.category_id == Some(*category_id)) {
            write_feed(&mut writer, feed)?;
        }

        writer.write_event(Event::End(BytesEnd::new("outline")))?;
    }

    for feed in feeds.iter().filter(|f| f.category_id.is_none()) {
        write_feed(&mut writer, feed)?;
    }

    writer.write_event(Event::End(BytesEnd::new("body")))?;
    writer.write_event(Event::End(BytesEnd::new("opml")))?;

    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

async fn load_feed(state: &AppState, id: i64) -> ApiResult<Feed> {
    sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Feed {} not found", id)))
}
