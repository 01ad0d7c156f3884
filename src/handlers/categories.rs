//! Category management endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;
use validator::Validate;

use crate::AppState;
use crate::models::{Category, CreateCategoryRequest, ReorderCategoriesRequest, UpdateCategoryRequest};
use crate::utils::{ApiError, ApiResult};

/// List categories ordered by position
/// GET /api/categories
#[utoipa::path(
    get,
    path = "/api/categories",
    responses((status = 200, description = "All categories", body = Vec<Category>)),
    security(("bearer_auth" = [])),
    tag = "Categories"
)]
pub async fn list_categories(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Category>>> {
    let categories: Vec<Category> =
        sqlx::query_as("SELECT * FROM categories ORDER BY position ASC, name ASC")
            .fetch_all(&state.db)
            .await?;
    Ok(Json(categories))
}

/// Create a category
/// POST /api/categories
#[utoipa::path(
    post,
    path = "/api/categories",
    request_body = CreateCategoryRequest,
    responses((status = 201, description = "Category created", body = Category)),
    security(("bearer_auth" = [])),
    tag = "Categories"
)]
pub async fn create_category(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCategoryRequest>,
) -> ApiResult<(StatusCode, Json<Category>)> {
    req.validate()?;

    if let Some(parent_id) = req.parent_id {
        ensure_category_exists(&state, parent_id).await?;
    }

    let id = sqlx::query("INSERT INTO categories (name, parent_id, position) VALUES (?, ?, ?)")
        .bind(req.name.trim())
        .bind(req.parent_id)
        .bind(req.position.unwrap_or(0))
        .execute(&state.db)
        .await?
        .last_insert_rowid();

    let category: Category = sqlx::query_as("SELECT * FROM categories WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

/// Update a category
/// PUT /api/categories/:id
#[utoipa::path(
    put,
    path = "/api/categories/{id}",
    params(("id" = i64, Path, description = "Category ID")),
    request_body = UpdateCategoryRequest,
    responses((status = 200, description = "Category updated", body = Category)),
    security(("bearer_auth" = [])),
    tag = "Categories"
)]
pub async fn update_category(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateCategoryRequest>,
) -> ApiResult<Json<Category>> {
    req.validate()?;
    ensure_category_exists(&state, id).await?;

    if let Some(parent_id) = req.parent_id {
        if parent_id == id {
            return Err(ApiError::invalid_data("A category cannot be its own parent"));
        }
        ensure_category_exists(&state, parent_id).await?;
    }

    if let Some(name) = &req.name {
        sqlx::query("UPDATE categories SET name = ? WHERE id = ?")
            .bind(name.trim())
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if req.parent_id.is_some() {
        sqlx::query("UPDATE categories SET parent_id = ? WHERE id = ?")
            .bind(req.parent_id)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(position) = req.position {
        sqlx::query("UPDATE categories SET position = ? WHERE id = ?")
            .bind(position)
            .bind(id)
            .execute(&state.db)
            .await?;
    }

    let category: Category = sqlx::query_as("SELECT * FROM categories WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(category))
}

/// Delete a category; its feeds fall back to uncategorized
/// DELETE /api/categories/:id
#[utoipa::path(
    delete,
    path = "/api/categories/{id}",
    params(("id" = i64, Path, description = "Category ID")),
    responses((status = 204, description = "Category deleted")),
    security(("bearer_auth" = [])),
    tag = "Categories"
)]
pub async fn delete_category(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let deleted = sqlx::query("DELETE FROM categories WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found(format!("Category {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Reorder categories; positions are assigned from list order
/// PUT /api/categories/reorder
#[utoipa::path(
    put,
    path = "/api/categories/reorder",
    request_body = ReorderCategoriesRequest,
    responses((status = 204, description = "Categories reordered")),
    security(("bearer_auth" = [])),
    tag = "Categories"
)]
pub async fn reorder_categories(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReorderCategoriesRequest>,
) -> ApiResult<StatusCode> {
    let mut tx = state.db.begin().await?;
    for (position, id) in req.ids.iter().enumerate() {
        sqlx::query("UPDATE categories SET position = ? WHERE id = ?")
            .bind(position as i64)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_category_exists(state: &AppState, id: i64) -> ApiResult<()> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM categories WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?;
    if exists.is_none() {
        return Err(ApiError::not_found(format!("Category {} not found", id)));
    }
    Ok(())
}
