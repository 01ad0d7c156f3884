//! Typed accessor over the app_settings key-value table.
//!
//! Preferences stored here override environment defaults; the resolver
//! functions return the effective value per key.

use sqlx::SqlitePool;

use crate::utils::ApiResult;

/// Keys used by the personalization engine
pub const KEY_INTEREST_PROFILE: &str = "user_interest_profile";
pub const KEY_INTEREST_TAGS: &str = "user_interest_tags";
pub const KEY_PROFILE_UPDATED_AT: &str = "user_profile_updated_at";
pub const KEY_PROFILE_STALE: &str = "user_profile_stale";

/// Keys used by the ops surface
pub const KEY_HEALTH_WARNING: &str = "health_warning";

/// Preference keys (DB override > env default)
pub const KEY_PREF_MODEL: &str = "pref_llm_model";
pub const KEY_PREF_LANGUAGE: &str = "pref_summary_language";

#[derive(Clone)]
pub struct AppSettingsService {
    pool: SqlitePool,
}

impl AppSettingsService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> ApiResult<Option<String>> {
        get_setting(&self.pool, key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> ApiResult<()> {
        set_setting(&self.pool, key, value).await
    }

    pub async fn delete(&self, key: &str) -> ApiResult<()> {
        delete_setting(&self.pool, key).await
    }

    pub async fn get_bool(&self, key: &str) -> ApiResult<bool> {
        Ok(matches!(self.get(key).await?.as_deref(), Some("1") | Some("true")))
    }

    /// Effective model id: preference override, else configured default
    pub async fn effective_model(&self, default: &str) -> ApiResult<String> {
        Ok(self
            .get(KEY_PREF_MODEL)
            .await?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string()))
    }

    /// Effective summary language: preference override, else configured default
    pub async fn effective_language(&self, default: &str) -> ApiResult<String> {
        Ok(self
            .get(KEY_PREF_LANGUAGE)
            .await?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string()))
    }
}

pub async fn get_setting(pool: &SqlitePool, key: &str) -> ApiResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> ApiResult<()> {
    sqlx::query(
        r#"INSERT INTO app_settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP"#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_setting(pool: &SqlitePool, key: &str) -> ApiResult<()> {
    sqlx::query("DELETE FROM app_settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn set_get_roundtrip_and_upsert() {
        let pool = db::test_pool().await;
        let settings = AppSettingsService::new(pool);

        assert_eq!(settings.get("k").await.unwrap(), None);
        settings.set("k", "v1").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap().as_deref(), Some("v1"));
        settings.set("k", "v2").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap().as_deref(), Some("v2"));
        settings.delete("k").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn effective_values_prefer_db_override() {
        let pool = db::test_pool().await;
        let settings = AppSettingsService::new(pool);

        assert_eq!(settings.effective_model("default-model").await.unwrap(), "default-model");
        settings.set(KEY_PREF_MODEL, "custom-model").await.unwrap();
        assert_eq!(settings.effective_model("default-model").await.unwrap(), "custom-model");

        assert_eq!(settings.effective_language("English").await.unwrap(), "English");
        settings.set(KEY_PREF_LANGUAGE, "French").await.unwrap();
        assert_eq!(settings.effective_language("English").await.unwrap(), "French");
    }
}
