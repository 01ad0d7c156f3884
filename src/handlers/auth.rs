//! Authentication endpoints: single-password login, token revocation.

use axum::{Extension, Json, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::utils::jwt::Claims;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub authenticated: bool,
}

/// Compare the candidate against the configured password without leaking
/// timing. Hashing both sides gives fixed-length inputs for the fold.
fn verify_password(candidate: &str, expected: &str) -> bool {
    let a = Sha256::digest(candidate.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Login with the application password
/// POST /api/auth/login
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session token", body = LoginResponse),
        (status = 401, description = "Wrong password")
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if !verify_password(&req.password, &state.config.auth.app_password) {
        tracing::warn!("Failed login attempt");
        return Err(ApiError::invalid_credentials());
    }

    let (token, expires_at) = state.jwt_util.generate_token()?;
    tracing::info!("Login successful");
    Ok(Json(LoginResponse { token, expires_at }))
}

/// Revoke the current session token
/// POST /api/auth/logout
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses((status = 204, description = "Token revoked")),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<axum::http::StatusCode> {
    let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);

    sqlx::query("INSERT OR IGNORE INTO token_blacklist (jti, expires_at) VALUES (?, ?)")
        .bind(&claims.jti)
        .bind(expires_at)
        .execute(&state.db)
        .await?;

    // Expired blacklist rows are useless; prune them on the way out
    sqlx::query("DELETE FROM token_blacklist WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(&state.db)
        .await?;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Whether the caller is authenticated
/// GET /api/auth/me
#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses((status = 200, description = "Authentication state", body = MeResponse)),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn me() -> Json<MeResponse> {
    Json(MeResponse { authenticated: true })
}
