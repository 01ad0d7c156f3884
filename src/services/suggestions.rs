//! Suggestion pipeline: tag-overlap prefilter plus batched model scoring.
//!
//! Candidates are recent unread posts whose tags overlap the interest
//! profile; the model scores the survivors in one batch call and posts at
//! or above the score threshold are marked suggested.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::config::PromptBundle;
use crate::services::summarizer::SummarizerClient;
use crate::services::user_profile::UserProfileService;
use crate::utils::ApiResult;

/// Minimum tags in common with the profile to shortlist a post
const MIN_TAG_OVERLAP: usize = 3;
/// Batch size cap for a single scoring call
const MAX_CANDIDATES_PER_BATCH: usize = 50;
/// Only posts fetched within this window are considered
const CANDIDATE_WINDOW_HOURS: i64 = 24;
/// Model score required to surface a suggestion
const MIN_SUGGESTION_SCORE: f64 = 80.0;

const SUGGESTION_RATE_LIMIT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug)]
pub struct SuggestionCandidate {
    pub post_id: i64,
    pub title: String,
    pub one_line_summary: String,
    pub overlap: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SuggestionStats {
    pub liked_count: i64,
    pub profile_ready: bool,
    pub profile_stale: bool,
    pub profile_tags_count: usize,
    pub suggested_unread: i64,
    pub suggested_total: i64,
    pub last_profile_update: Option<String>,
}

#[derive(Clone)]
pub struct SuggestionService {
    pool: SqlitePool,
    profile_service: UserProfileService,
    client: Arc<SummarizerClient>,
    prompts_path: String,
}

impl SuggestionService {
    pub fn new(
        pool: SqlitePool,
        profile_service: UserProfileService,
        client: Arc<SummarizerClient>,
        prompts_path: String,
    ) -> Self {
        Self { pool, profile_service, client, prompts_path }
    }

    /// Shortlist posts by tag overlap with the interest profile.
    pub async fn candidates(&self) -> ApiResult<Vec<SuggestionCandidate>> {
        let Some(profile) = self.profile_service.get_user_profile().await? else {
            tracing::debug!("No user profile available for suggestions");
            return Ok(vec![]);
        };
        let profile_tags: HashSet<String> =
            profile.tags.iter().map(|t| t.to_lowercase()).collect();
        if profile_tags.is_empty() {
            return Ok(vec![]);
        }

        let window_start = Utc::now() - Duration::hours(CANDIDATE_WINDOW_HOURS);

        // Recent unread posts with a summary, plus their tags, in one scan
        let rows: Vec<(i64, Option<String>, String, Option<String>)> = sqlx::query_as(
            r#"SELECT p.id, p.title, s.one_line_summary, t.tag
               FROM posts p
               JOIN ai_summaries s ON s.content_hash = p.content_hash
               LEFT JOIN post_tags t ON t.post_id = p.id
               WHERE p.fetched_at > ?
                 AND p.is_suggested = FALSE
                 AND p.is_read = FALSE
                 AND p.is_liked = FALSE"#,
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;

        let mut posts: HashMap<i64, (String, String, HashSet<String>)> = HashMap::new();
        for (id, title, one_line, tag) in rows {
            let entry = posts
                .entry(id)
                .or_insert_with(|| (title.unwrap_or_default(), one_line, HashSet::new()));
            if let Some(tag) = tag {
                entry.2.insert(tag.to_lowercase());
            }
        }

        let mut candidates: Vec<SuggestionCandidate> = posts
            .into_iter()
            .filter_map(|(post_id, (title, one_line_summary, tags))| {
                let overlap = tags.intersection(&profile_tags).count();
                (overlap >= MIN_TAG_OVERLAP).then_some(SuggestionCandidate {
                    post_id,
                    title,
                    one_line_summary,
                    overlap,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.overlap.cmp(&a.overlap).then(a.post_id.cmp(&b.post_id)));
        candidates.truncate(MAX_CANDIDATES_PER_BATCH);

        tracing::info!("Found {} suggestion candidates", candidates.len());
        Ok(candidates)
    }

    /// Score candidates with the model and mark the matches.
    /// Returns the number of posts marked as suggested.
    pub async fn process_suggestions(&self) -> ApiResult<u32> {
        let Some(profile) = self.profile_service.get_user_profile().await? else {
            tracing::info!("No user profile available, skipping suggestion processing");
            return Ok(0);
        };

        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            tracing::info!("No suggestion candidates found");
            return Ok(0);
        }

        let prompts = PromptBundle::load(&self.prompts_path);
        let template = prompts.get("comparison_prompt", "").to_string();
        if template.is_empty() {
            tracing::error!("comparison_prompt not found in prompt bundle");
            return Ok(0);
        }

        let articles_text = candidates
            .iter()
            .map(|c| {
                format!("ID: {}\nTitle: {}\nSummary: {}", c.post_id, c.title, c.one_line_summary)
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        let prompt = template
            .replace("{profile}", &profile.profile)
            .replace("{articles}", &articles_text);

        tracing::info!("Scoring {} suggestion candidates", candidates.len());

        let value: Value = match self
            .client
            .complete_raw(&prompt, 2000, SUGGESTION_RATE_LIMIT_COOLDOWN_SECS)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Suggestion processing failed: {}", e);
                return Ok(0);
            },
        };

        let matches = value
            .get("matches")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let now = Utc::now();
        let mut suggested = 0u32;
        for m in matches {
            let Some(post_id) = m.get("id").and_then(Value::as_i64) else { continue };
            let score = m.get("score").and_then(Value::as_f64).unwrap_or(0.0);
            if score < MIN_SUGGESTION_SCORE {
                continue;
            }

            let updated = sqlx::query(
                r#"UPDATE posts
                   SET is_suggested = TRUE, suggestion_score = ?, suggested_at = ?
                   WHERE id = ? AND is_suggested = FALSE"#,
            )
            .bind(score)
            .bind(now)
            .bind(post_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated > 0 {
                suggested += 1;
                tracing::info!("Suggested post {} (score: {})", post_id, score);
            }
        }

        tracing::info!("Marked {} posts as suggested", suggested);
        Ok(suggested)
    }

    pub async fn stats(&self) -> ApiResult<SuggestionStats> {
        let suggested_unread: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM posts WHERE is_suggested = TRUE AND is_read = FALSE",
        )
        .fetch_one(&self.pool)
        .await?;
        let suggested_total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_suggested = TRUE")
                .fetch_one(&self.pool)
                .await?;

        let profile = self.profile_service.get_user_profile().await?;

        Ok(SuggestionStats {
            liked_count: self.profile_service.liked_posts_count().await?,
            profile_ready: profile.is_some(),
            profile_stale: self.profile_service.is_stale().await?,
            profile_tags_count: profile.as_ref().map(|p| p.tags.len()).unwrap_or(0),
            suggested_unread: suggested_unread.0,
            suggested_total: suggested_total.0,
            last_profile_update: profile.and_then(|p| p.updated_at),
        })
    }
}
