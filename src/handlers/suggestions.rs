//! Suggestion system endpoints.

use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::services::SuggestionStats;
use crate::utils::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct RegenerateProfileResponse {
    pub generated: bool,
    pub tags_count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessSuggestionsResponse {
    pub suggested: u32,
}

/// Suggestion system state
/// GET /api/suggestions/status
#[utoipa::path(
    get,
    path = "/api/suggestions/status",
    responses((status = 200, description = "Suggestion statistics", body = SuggestionStats)),
    security(("bearer_auth" = [])),
    tag = "Suggestions"
)]
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<SuggestionStats>> {
    Ok(Json(state.suggestion_service.stats().await?))
}

/// Force interest-profile regeneration
/// POST /api/suggestions/admin/regenerate-profile
#[utoipa::path(
    post,
    path = "/api/suggestions/admin/regenerate-profile",
    responses((status = 200, description = "Regeneration result", body = RegenerateProfileResponse)),
    security(("bearer_auth" = [])),
    tag = "Suggestions"
)]
pub async fn regenerate_profile(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<RegenerateProfileResponse>> {
    let profile = state.profile_service.generate().await?;
    Ok(Json(RegenerateProfileResponse {
        generated: profile.is_some(),
        tags_count: profile.map(|p| p.tags.len()).unwrap_or(0),
    }))
}

/// Run the suggestion pipeline immediately
/// POST /api/suggestions/admin/process-suggestions
#[utoipa::path(
    post,
    path = "/api/suggestions/admin/process-suggestions",
    responses((status = 200, description = "Processing result", body = ProcessSuggestionsResponse)),
    security(("bearer_auth" = [])),
    tag = "Suggestions"
)]
pub async fn process_suggestions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ProcessSuggestionsResponse>> {
    let suggested = state.suggestion_service.process_suggestions().await?;
    Ok(Json(ProcessSuggestionsResponse { suggested }))
}
