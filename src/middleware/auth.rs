use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::utils::{ApiError, JwtUtil};

#[derive(Clone)]
pub struct AuthState {
    pub jwt_util: Arc<JwtUtil>,
    pub db: SqlitePool,
}

/// Authentication middleware.
/// 1. Verify the bearer token signature and expiry
/// 2. Reject tokens whose jti has been blacklisted by logout
/// 3. Store the claims in request extensions for handlers
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let uri = req.uri().path().to_string();
    let method = req.method().to_string();

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing authorization header for {} {}", method, uri);
            ApiError::unauthorized("Missing authorization header")
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::warn!("Invalid authorization header format for {} {}", method, uri);
        ApiError::unauthorized("Invalid authorization header format")
    })?;

    let claims = state.jwt_util.verify_token(token).map_err(|err| {
        tracing::warn!("Token verification failed for {} {}", method, uri);
        err
    })?;

    let blacklisted: Option<(String,)> =
        sqlx::query_as("SELECT jti FROM token_blacklist WHERE jti = ?")
            .bind(&claims.jti)
            .fetch_optional(&state.db)
            .await
            .unwrap_or(None);
    if blacklisted.is_some() {
        tracing::warn!("Blacklisted token used for {} {}", method, uri);
        return Err(ApiError::unauthorized("Token has been revoked"));
    }

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
