//! User preferences stored in app_settings, overriding env defaults.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::services::app_settings::{KEY_PREF_LANGUAGE, KEY_PREF_MODEL};
use crate::utils::ApiResult;

const KEY_LOCALE: &str = "pref_locale";
const KEY_THEME: &str = "pref_theme";
const KEY_TOAST_TIMEOUT: &str = "pref_toast_timeout_seconds";
const KEY_IDLE_REFRESH: &str = "pref_idle_refresh_seconds";
const KEY_READING_MODE: &str = "pref_reading_mode";
const KEY_SPLIT_RATIO: &str = "pref_split_ratio";
const KEY_MAX_POST_AGE: &str = "pref_max_post_age_days";
const KEY_MAX_UNREAD: &str = "pref_max_unread_days";

const MIN_SPLIT_RATIO: i64 = 20;
const MAX_SPLIT_RATIO: i64 = 80;

#[derive(Debug, Serialize, ToSchema)]
pub struct PreferencesResponse {
    pub locale: String,
    pub theme: String,
    pub summary_language: String,
    pub llm_model: String,
    pub max_post_age_days: i64,
    pub max_unread_days: i64,
    pub toast_timeout_seconds: i64,
    pub idle_refresh_seconds: i64,
    pub reading_mode: String,
    pub split_ratio: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePreferencesRequest {
    pub locale: Option<String>,
    pub theme: Option<String>,
    pub summary_language: Option<String>,
    pub llm_model: Option<String>,
    pub max_post_age_days: Option<i64>,
    pub max_unread_days: Option<i64>,
    pub toast_timeout_seconds: Option<i64>,
    pub idle_refresh_seconds: Option<i64>,
    pub reading_mode: Option<String>,
    pub split_ratio: Option<i64>,
}

async fn build_response(state: &AppState) -> ApiResult<PreferencesResponse> {
    let settings = &state.settings;
    let get_or = |key: &'static str, default: String| async move {
        settings.get(key).await.map(|v| v.unwrap_or(default))
    };

    Ok(PreferencesResponse {
        locale: get_or(KEY_LOCALE, "en".to_string()).await?,
        theme: get_or(KEY_THEME, "auto".to_string()).await?,
        summary_language: settings
            .effective_language(&state.config.llm.summary_language)
            .await?,
        llm_model: settings.effective_model(&state.config.llm.model).await?,
        max_post_age_days: settings
            .get(KEY_MAX_POST_AGE)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(state.config.retention.max_post_age_days),
        max_unread_days: settings
            .get(KEY_MAX_UNREAD)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(state.config.retention.max_unread_days),
        toast_timeout_seconds: settings
            .get(KEY_TOAST_TIMEOUT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(2),
        idle_refresh_seconds: settings
            .get(KEY_IDLE_REFRESH)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(180),
        reading_mode: get_or(KEY_READING_MODE, "list".to_string()).await?,
        split_ratio: settings
            .get(KEY_SPLIT_RATIO)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(50),
    })
}

/// Effective preferences (DB override > env default)
/// GET /api/preferences
#[utoipa::path(
    get,
    path = "/api/preferences",
    responses((status = 200, description = "Effective preferences", body = PreferencesResponse)),
    security(("bearer_auth" = [])),
    tag = "Preferences"
)]
pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PreferencesResponse>> {
    Ok(Json(build_response(&state).await?))
}

/// Update preferences; only the provided fields change
/// PUT /api/preferences
#[utoipa::path(
    put,
    path = "/api/preferences",
    request_body = UpdatePreferencesRequest,
    responses((status = 200, description = "Updated preferences", body = PreferencesResponse)),
    security(("bearer_auth" = [])),
    tag = "Preferences"
)]
pub async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdatePreferencesRequest>,
) -> ApiResult<Json<PreferencesResponse>> {
    let settings = &state.settings;

    if let Some(locale) = &req.locale {
        settings.set(KEY_LOCALE, locale).await?;
    }
    if let Some(theme) = &req.theme {
        settings.set(KEY_THEME, theme).await?;
    }
    if let Some(language) = &req.summary_language {
        settings.set(KEY_PREF_LANGUAGE, language).await?;
    }
    if let Some(model) = &req.llm_model {
        settings.set(KEY_PREF_MODEL, model).await?;
    }
    if let Some(days) = req.max_post_age_days {
        settings.set(KEY_MAX_POST_AGE, &days.to_string()).await?;
    }
    if let Some(days) = req.max_unread_days {
        settings.set(KEY_MAX_UNREAD, &days.to_string()).await?;
    }
    if let Some(secs) = req.toast_timeout_seconds {
        settings.set(KEY_TOAST_TIMEOUT, &secs.to_string()).await?;
    }
    if let Some(secs) = req.idle_refresh_seconds {
        settings.set(KEY_IDLE_REFRESH, &secs.to_string()).await?;
    }
    if let Some(mode) = &req.reading_mode {
        settings.set(KEY_READING_MODE, mode).await?;
    }
    if let Some(ratio) = req.split_ratio {
        let clamped = ratio.clamp(MIN_SPLIT_RATIO, MAX_SPLIT_RATIO);
        settings.set(KEY_SPLIT_RATIO, &clamped.to_string()).await?;
    }

    Ok(Json(build_response(&state).await?))
}
