//! Round-robin API key rotation with per-key cooldown.
//!
//! The rotation index is persisted in app_settings so restarts continue
//! where the previous instance left off; cooldowns are in-memory only.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::services::app_settings::{get_setting, set_setting};

const INDEX_KEY: &str = "api_key_index";

#[derive(Debug, Serialize, ToSchema)]
pub struct KeyStatus {
    pub index: usize,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RotatorStatus {
    pub total_keys: usize,
    pub current_index: usize,
    pub keys: Vec<KeyStatus>,
}

struct RotatorInner {
    current_index: usize,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

pub struct ApiKeyRotator {
    pool: SqlitePool,
    keys: Vec<String>,
    inner: Mutex<RotatorInner>,
}

impl ApiKeyRotator {
    pub async fn new(pool: SqlitePool, keys: Vec<String>) -> Self {
        let current_index = get_setting(&pool, INDEX_KEY)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Self {
            pool,
            keys,
            inner: Mutex::new(RotatorInner { current_index, cooldowns: HashMap::new() }),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Next available key, round-robin, skipping keys in cooldown.
    /// Returns (key, index) or None when every key is cooling down.
    pub async fn get_next_key(&self) -> Option<(String, usize)> {
        if self.keys.is_empty() {
            return None;
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        for _ in 0..self.keys.len() {
            let key_index = inner.current_index % self.keys.len();
            let key = self.keys[key_index].clone();

            inner.current_index = (inner.current_index + 1) % self.keys.len();

            if let Some(cooldown_until) = inner.cooldowns.get(&key) {
                if now < *cooldown_until {
                    let remaining = (*cooldown_until - now).num_seconds();
                    tracing::debug!(
                        "Key {}/{} in cooldown ({}s)",
                        key_index + 1,
                        self.keys.len(),
                        remaining
                    );
                    continue;
                }
            }

            let index_value = inner.current_index.to_string();
            if let Err(e) = set_setting(&self.pool, INDEX_KEY, &index_value).await {
                tracing::error!("Failed to persist API key index: {}", e);
            }

            if self.keys.len() > 1 {
                tracing::debug!("Using API key {}/{}", key_index + 1, self.keys.len());
            }
            return Some((key, key_index));
        }

        // All keys in cooldown
        None
    }

    /// Whether at least one key is currently usable; does not advance the index
    pub async fn has_available_key(&self) -> bool {
        if self.keys.is_empty() {
            return false;
        }
        let now = Utc::now();
        let inner = self.inner.lock().await;
        self.keys
            .iter()
            .any(|key| inner.cooldowns.get(key).map_or(true, |until| now >= *until))
    }

    /// Put a key in cooldown after a rate-limit response
    pub async fn set_key_cooldown(&self, key: &str, seconds: i64) {
        let mut inner = self.inner.lock().await;
        inner
            .cooldowns
            .insert(key.to_string(), Utc::now() + Duration::seconds(seconds));

        if let Some(index) = self.keys.iter().position(|k| k == key) {
            tracing::warn!(
                "API key {}/{} in cooldown for {}s",
                index + 1,
                self.keys.len(),
                seconds
            );
        }
    }

    pub async fn clear_cooldowns(&self) {
        self.inner.lock().await.cooldowns.clear();
    }

    pub async fn status(&self) -> RotatorStatus {
        let now = Utc::now();
        let inner = self.inner.lock().await;

        let keys = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let cooldown_until = inner.cooldowns.get(key).filter(|until| now < **until);
                KeyStatus {
                    index: i + 1,
                    available: cooldown_until.is_none(),
                    cooldown_remaining: cooldown_until.map(|until| (*until - now).num_seconds()),
                }
            })
            .collect();

        RotatorStatus {
            total_keys: self.keys.len(),
            current_index: if self.keys.is_empty() {
                0
            } else {
                inner.current_index % self.keys.len()
            },
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{}", i)).collect()
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let pool = db::test_pool().await;
        let rotator = ApiKeyRotator::new(pool, keys(3)).await;

        let mut counts = HashMap::new();
        for _ in 0..9 {
            let (key, _) = rotator.get_next_key().await.unwrap();
            *counts.entry(key).or_insert(0u32) += 1;
        }
        for i in 0..3 {
            assert_eq!(counts[&format!("key-{}", i)], 3);
        }
    }

    #[tokio::test]
    async fn cooldown_keys_are_skipped() {
        let pool = db::test_pool().await;
        let rotator = ApiKeyRotator::new(pool, keys(2)).await;

        rotator.set_key_cooldown("key-0", 60).await;
        for _ in 0..4 {
            let (key, index) = rotator.get_next_key().await.unwrap();
            assert_eq!(key, "key-1");
            assert_eq!(index, 1);
        }
    }

    #[tokio::test]
    async fn all_keys_in_cooldown_returns_none() {
        let pool = db::test_pool().await;
        let rotator = ApiKeyRotator::new(pool, keys(2)).await;

        rotator.set_key_cooldown("key-0", 60).await;
        rotator.set_key_cooldown("key-1", 60).await;
        assert!(rotator.get_next_key().await.is_none());
        assert!(!rotator.has_available_key().await);

        rotator.clear_cooldowns().await;
        assert!(rotator.has_available_key().await);
    }

    #[tokio::test]
    async fn expired_cooldown_is_usable_again() {
        let pool = db::test_pool().await;
        let rotator = ApiKeyRotator::new(pool, keys(1)).await;

        rotator.set_key_cooldown("key-0", -1).await;
        assert!(rotator.get_next_key().await.is_some());
    }

    #[tokio::test]
    async fn index_is_persisted_across_instances() {
        let pool = db::test_pool().await;
        {
            let rotator = ApiKeyRotator::new(pool.clone(), keys(3)).await;
            rotator.get_next_key().await.unwrap();
            rotator.get_next_key().await.unwrap();
        }
        let rotator = ApiKeyRotator::new(pool, keys(3)).await;
        let (key, index) = rotator.get_next_key().await.unwrap();
        assert_eq!(index, 2);
        assert_eq!(key, "key-2");
    }

    #[tokio::test]
    async fn no_keys_means_no_key() {
        let pool = db::test_pool().await;
        let rotator = ApiKeyRotator::new(pool, vec![]).await;
        assert!(rotator.get_next_key().await.is_none());
        assert!(!rotator.has_available_key().await);
    }
}
