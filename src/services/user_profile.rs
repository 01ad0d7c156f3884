//! Interest profile generation for the recommendation system.
//!
//! Analyzes liked posts (with their AI summaries) and asks the model for a
//! free-text profile plus a tag vocabulary. The result lives in
//! app_settings; a "stale" flag set on like changes triggers regeneration.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::config::PromptBundle;
use crate::services::app_settings::{
    AppSettingsService, KEY_INTEREST_PROFILE, KEY_INTEREST_TAGS, KEY_PROFILE_STALE,
    KEY_PROFILE_UPDATED_AT,
};
use crate::services::summarizer::SummarizerClient;
use crate::utils::ApiResult;

/// Minimum liked posts required before a profile is generated
pub const MIN_LIKED_POSTS: usize = 10;
/// Most recent likes considered
const MAX_LIKED_POSTS: i64 = 50;
/// Key cooldown applied when profile generation hits a rate limit
const PROFILE_RATE_LIMIT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserProfile {
    pub profile: String,
    pub tags: Vec<String>,
    pub updated_at: Option<String>,
}

#[derive(Clone)]
pub struct UserProfileService {
    pool: SqlitePool,
    settings: AppSettingsService,
    client: Arc<SummarizerClient>,
    prompts_path: String,
}

impl UserProfileService {
    pub fn new(
        pool: SqlitePool,
        settings: AppSettingsService,
        client: Arc<SummarizerClient>,
        prompts_path: String,
    ) -> Self {
        Self { pool, settings, client, prompts_path }
    }

    /// Current profile, or None when never generated
    pub async fn get_user_profile(&self) -> ApiResult<Option<UserProfile>> {
        let profile = self.settings.get(KEY_INTEREST_PROFILE).await?;
        let tags_json = self.settings.get(KEY_INTEREST_TAGS).await?;

        let (Some(profile), Some(tags_json)) = (profile, tags_json) else {
            return Ok(None);
        };

        let tags = serde_json::from_str(&tags_json).unwrap_or_default();
        let updated_at = self.settings.get(KEY_PROFILE_UPDATED_AT).await?;

        Ok(Some(UserProfile { profile, tags, updated_at }))
    }

    /// Mark the profile stale; called whenever likes change.
    pub async fn invalidate(&self) -> ApiResult<()> {
        self.settings.set(KEY_PROFILE_STALE, "1").await?;
        tracing::debug!("User profile marked as stale");
        Ok(())
    }

    pub async fn is_stale(&self) -> ApiResult<bool> {
        self.settings.get_bool(KEY_PROFILE_STALE).await
    }

    pub async fn liked_posts_count(&self) -> ApiResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_liked = TRUE")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Generate the interest profile from recent liked posts.
    ///
    /// Returns None when there is not enough data or the model declined.
    pub async fn generate(&self) -> ApiResult<Option<UserProfile>> {
        let liked: Vec<(Option<String>, String)> = sqlx::query_as(
            r#"SELECT p.title, s.summary
               FROM posts p
               JOIN ai_summaries s ON s.content_hash = p.content_hash
               WHERE p.is_liked = TRUE
               ORDER BY p.liked_at DESC
               LIMIT ?"#,
        )
        .bind(MAX_LIKED_POSTS)
        .fetch_all(&self.pool)
        .await?;

        if liked.len() < MIN_LIKED_POSTS {
            tracing::info!(
                "Not enough liked posts for profile: {}/{}",
                liked.len(),
                MIN_LIKED_POSTS
            );
            return Ok(None);
        }

        let summaries_text = liked
            .iter()
            .map(|(title, summary)| {
                format!("Title: {}\nSummary: {}", title.as_deref().unwrap_or("Untitled"), summary)
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        let prompts = PromptBundle::load(&self.prompts_path);
        let template = prompts.get("profile_prompt", "").to_string();
        if template.is_empty() {
            tracing::error!("profile_prompt not found in prompt bundle");
            return Ok(None);
        }
        let prompt = template.replace("{summaries}", &summaries_text);

        tracing::info!("Generating user profile from {} liked posts...", liked.len());

        let value: Value = match self
            .client
            .complete_raw(&prompt, 1000, PROFILE_RATE_LIMIT_COOLDOWN_SECS)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Profile generation failed: {}", e);
                return Ok(None);
            },
        };

        let profile_text = value
            .get("profile")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if profile_text.is_empty() {
            tracing::error!("Empty profile generated");
            return Ok(None);
        }

        let tags: Vec<String> = value
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                let mut seen = std::collections::HashSet::new();
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty() && seen.insert(t.clone()))
                    .collect()
            })
            .unwrap_or_default();

        self.settings.set(KEY_INTEREST_PROFILE, &profile_text).await?;
        self.settings
            .set(KEY_INTEREST_TAGS, &serde_json::to_string(&tags)?)
            .await?;
        self.settings
            .set(KEY_PROFILE_UPDATED_AT, &Utc::now().to_rfc3339())
            .await?;
        self.settings.set(KEY_PROFILE_STALE, "0").await?;

        tracing::info!("User profile generated with {} interest tags", tags.len());

        Ok(Some(UserProfile {
            profile: profile_text,
            tags,
            updated_at: self.settings.get(KEY_PROFILE_UPDATED_AT).await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::db;
    use crate::services::summarizer::{ApiKeyRotator, CircuitBreaker};

    async fn service(pool: &SqlitePool) -> UserProfileService {
        let rotator = Arc::new(ApiKeyRotator::new(pool.clone(), vec![]).await);
        let circuit = Arc::new(CircuitBreaker::new(pool.clone(), 5, 300, 3, 60_000).await);
        let client = Arc::new(SummarizerClient::new(
            LlmConfig::default(),
            AppSettingsService::new(pool.clone()),
            rotator,
            circuit,
        ));
        UserProfileService::new(
            pool.clone(),
            AppSettingsService::new(pool.clone()),
            client,
            "prompts.yaml".to_string(),
        )
    }

    #[tokio::test]
    async fn profile_roundtrip_through_settings() {
        let pool = db::test_pool().await;
        let service = service(&pool).await;

        assert!(service.get_user_profile().await.unwrap().is_none());

        let settings = AppSettingsService::new(pool.clone());
        settings.set(KEY_INTEREST_PROFILE, "likes rust").await.unwrap();
        settings.set(KEY_INTEREST_TAGS, r#"["rust","systems"]"#).await.unwrap();

        let profile = service.get_user_profile().await.unwrap().unwrap();
        assert_eq!(profile.profile, "likes rust");
        assert_eq!(profile.tags, vec!["rust", "systems"]);
    }

    #[tokio::test]
    async fn stale_flag_lifecycle() {
        let pool = db::test_pool().await;
        let service = service(&pool).await;

        assert!(!service.is_stale().await.unwrap());
        service.invalidate().await.unwrap();
        assert!(service.is_stale().await.unwrap());
    }

    #[tokio::test]
    async fn generation_requires_minimum_likes() {
        let pool = db::test_pool().await;
        let service = service(&pool).await;

        // No liked posts: short-circuits before any API call
        let result = service.generate().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn liked_posts_count_counts_only_likes() {
        let pool = db::test_pool().await;
        let service = service(&pool).await;

        sqlx::query("INSERT INTO feeds (id, title, url) VALUES (1, 'f', 'https://f.io/rss')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO posts (feed_id, is_liked) VALUES (1, TRUE), (1, FALSE)")
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(service.liked_posts_count().await.unwrap(), 1);
    }
}
