//! HTTP client for the summarization provider (OpenAI-compatible chat API).
//!
//! Every call goes through the circuit breaker and the key rotator. Error
//! classification drives the queue worker's retry policy: temporary errors
//! are retried with bounded attempts, permanent ones are archived.

use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmConfig, PromptBundle};
use crate::services::app_settings::AppSettingsService;
use crate::services::html_sanitizer::extract_text;

use super::circuit::CircuitBreaker;
use super::parse::parse_json_response;
use super::rotator::ApiKeyRotator;
use super::{LlmError, SummaryResult};

/// Content is clipped before prompting (roughly 4000 tokens)
const MAX_CONTENT_CHARS: usize = 12_000;
const MAX_ONE_LINE_CHARS: usize = 150;

/// Phrases that mark a page as fetch debris rather than an article
const GARBAGE_PHRASES: &[&str] = &[
    "reload to refresh your session",
    "403 forbidden",
    "404 not found",
    "access denied",
    "subscribe to continue reading",
    "sign in to continue",
    "enable javascript and cookies",
    "your browser is out of date",
];

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes articles.";
const DEFAULT_USER_PROMPT: &str = "Summarize this article in {language}:\n\n{content}";

pub struct SummarizerClient {
    config: LlmConfig,
    settings: AppSettingsService,
    rotator: Arc<ApiKeyRotator>,
    circuit: Arc<CircuitBreaker>,
    http_client: Client,
}

impl SummarizerClient {
    pub fn new(
        config: LlmConfig,
        settings: AppSettingsService,
        rotator: Arc<ApiKeyRotator>,
        circuit: Arc<CircuitBreaker>,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .expect("Failed to create LLM HTTP client");

        Self { config, settings, rotator, circuit, http_client }
    }

    pub fn rotator(&self) -> &Arc<ApiKeyRotator> {
        &self.rotator
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Pages that are error shells or paywalls produce an empty result
    /// instead of burning an API call.
    fn is_garbage_content(content: &str) -> bool {
        let text = extract_text(Some(content)).unwrap_or_default();
        let lower = text.to_lowercase();

        if text.chars().count() < 40 {
            return true;
        }
        text.chars().count() < 600 && GARBAGE_PHRASES.iter().any(|p| lower.contains(p))
    }

    fn truncate_chars(s: &str, max: usize) -> String {
        if s.chars().count() <= max {
            return s.to_string();
        }
        let clipped: String = s.chars().take(max).collect();
        format!("{}...", clipped)
    }

    /// Generate a summary for the given article content.
    pub async fn generate_summary(
        &self,
        content: &str,
        title: &str,
    ) -> Result<SummaryResult, LlmError> {
        if Self::is_garbage_content(content) {
            tracing::debug!("Content looks like fetch debris, returning empty summary");
            return Ok(SummaryResult::empty());
        }

        self.circuit
            .can_call()
            .await
            .map_err(LlmError::Temporary)?;

        let Some((api_key, key_index)) = self.rotator.get_next_key().await else {
            return Err(LlmError::KeysExhausted);
        };

        let content = Self::truncate_chars(content, MAX_CONTENT_CHARS);

        let model = self
            .settings
            .effective_model(&self.config.model)
            .await
            .map_err(|e| LlmError::Temporary(e.to_string()))?;
        let language = self
            .settings
            .effective_language(&self.config.summary_language)
            .await
            .map_err(|e| LlmError::Temporary(e.to_string()))?;

        let prompts = PromptBundle::load(&self.config.prompts_path);
        let system_prompt = prompts.get("system_prompt", DEFAULT_SYSTEM_PROMPT).to_string();
        let user_prompt = prompts
            .get("user_prompt", DEFAULT_USER_PROMPT)
            .replace("{language}", &language)
            .replace("{content}", &content)
            .replace("{title}", if title.is_empty() { "Untitled" } else { title });

        let payload = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": 0.3,
            "max_tokens": 1000,
        });

        let response = match self
            .http_client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.circuit.record_failure(false).await;
                return Err(LlmError::Temporary(format!(
                    "Timeout after {}s",
                    self.config.timeout_secs
                )));
            },
            Err(e) => {
                self.circuit.record_failure(false).await;
                return Err(LlmError::Temporary(format!("Connection error: {}", e)));
            },
        };

        let status = response.status().as_u16();

        // Rate limit: cool this key down, never trip the breaker
        if status == 429 {
            self.rotator.set_key_cooldown(&api_key, 60).await;
            self.circuit.record_failure(true).await;
            return Err(LlmError::Temporary(format!("Rate limit hit on key {}", key_index + 1)));
        }

        if status >= 500 {
            self.circuit.record_failure(false).await;
            return Err(LlmError::Temporary(format!("Server error: HTTP {}", status)));
        }

        if status >= 400 {
            self.circuit.record_failure(false).await;
            return Err(LlmError::Permanent(format!("Request error: HTTP {}", status)));
        }

        let data: Value = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                self.circuit.record_failure(false).await;
                return Err(LlmError::Permanent(format!("Malformed response body: {}", e)));
            },
        };

        let content_response = match Self::extract_choice_content(&data) {
            Some(content) => content,
            None => {
                self.circuit.record_failure(false).await;
                tracing::error!("Unknown response structure: {}", data);
                return Err(LlmError::Permanent("Empty or unknown API response".to_string()));
            },
        };

        match Self::parse_summary(&content_response) {
            Ok(result) => {
                self.circuit.record_success().await;
                Ok(result)
            },
            Err(e) => {
                self.circuit.record_failure(false).await;
                tracing::error!("Invalid summary response: {} (raw: {:.500})", e, content_response);
                Err(LlmError::Permanent(format!("Invalid response: {}", e)))
            },
        }
    }

    /// Single-prompt completion for the personalization flows. The caller
    /// supplies the key-cooldown applied on 429.
    pub async fn complete_raw(
        &self,
        prompt: &str,
        max_tokens: u32,
        rate_limit_cooldown_secs: i64,
    ) -> Result<Value, LlmError> {
        self.circuit
            .can_call()
            .await
            .map_err(LlmError::Temporary)?;

        let Some((api_key, key_index)) = self.rotator.get_next_key().await else {
            return Err(LlmError::KeysExhausted);
        };

        let model = self
            .settings
            .effective_model(&self.config.model)
            .await
            .map_err(|e| LlmError::Temporary(e.to_string()))?;

        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.3,
            "max_tokens": max_tokens,
        });

        let response = match self
            .http_client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.circuit.record_failure(false).await;
                return Err(LlmError::Temporary("Timeout".to_string()));
            },
            Err(e) => {
                self.circuit.record_failure(false).await;
                return Err(LlmError::Temporary(format!("Connection error: {}", e)));
            },
        };

        let status = response.status().as_u16();

        if status == 429 {
            self.rotator
                .set_key_cooldown(&api_key, rate_limit_cooldown_secs)
                .await;
            self.circuit.record_failure(true).await;
            return Err(LlmError::Temporary(format!("Rate limit hit on key {}", key_index + 1)));
        }

        if status >= 500 {
            self.circuit.record_failure(false).await;
            return Err(LlmError::Temporary(format!("Server error: HTTP {}", status)));
        }

        if status >= 400 {
            self.circuit.record_failure(false).await;
            return Err(LlmError::Permanent(format!("Request error: HTTP {}", status)));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("Malformed response body: {}", e)))?;

        let content = Self::extract_choice_content(&data)
            .ok_or_else(|| LlmError::Permanent("Empty API response".to_string()))?;

        match parse_json_response(&content) {
            Ok(value) => {
                self.circuit.record_success().await;
                Ok(value)
            },
            Err(e) => {
                self.circuit.record_failure(false).await;
                Err(LlmError::Permanent(format!("Invalid response: {}", e)))
            },
        }
    }

    /// Providers disagree on where the text lives: try message.content,
    /// message.reasoning, choice.text, choice.content in that order.
    fn extract_choice_content(data: &Value) -> Option<String> {
        let choice = data.get("choices")?.as_array()?.first()?;

        if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
            tracing::warn!("Response truncated by the API (finish_reason=length)");
        }

        let message = choice.get("message");
        message
            .and_then(|m| m.get("content"))
            .or_else(|| message.and_then(|m| m.get("reasoning")))
            .or_else(|| choice.get("text"))
            .or_else(|| choice.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Decode the summary object. Both summary fields filled or both empty
    /// are accepted; a half-filled result is rejected.
    fn parse_summary(content: &str) -> Result<SummaryResult, String> {
        let value = parse_json_response(content)?;

        let summary = value
            .get("summary_pt")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let mut one_line = value
            .get("one_line_summary")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();

        if summary.is_empty() != one_line.is_empty() {
            return Err("Summary fields must both be filled or both be empty".to_string());
        }

        if one_line.chars().count() > MAX_ONE_LINE_CHARS {
            one_line = format!(
                "{}...",
                one_line.chars().take(MAX_ONE_LINE_CHARS - 3).collect::<String>()
            );
        }

        let translated_title = value
            .get("translated_title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null") && !t.eq_ignore_ascii_case("none"))
            .map(str::to_string);

        let tags = value
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(SummaryResult { summary, one_line_summary: one_line, translated_title, tags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_detection() {
        assert!(SummarizerClient::is_garbage_content("<p>403 Forbidden</p>"));
        assert!(SummarizerClient::is_garbage_content("short"));
        assert!(SummarizerClient::is_garbage_content(
            &format!("<p>{} reload to refresh your session</p>", "word ".repeat(20))
        ));
        let real = format!("<p>{}</p>", "A real article paragraph with substance. ".repeat(30));
        assert!(!SummarizerClient::is_garbage_content(&real));
    }

    #[test]
    fn parse_summary_accepts_full_result() {
        let content = r#"{"summary_pt": "resumo", "one_line_summary": "linha",
            "translated_title": "Titulo", "tags": ["Rust", " ai "]}"#;
        let result = SummarizerClient::parse_summary(content).unwrap();
        assert_eq!(result.summary, "resumo");
        assert_eq!(result.one_line_summary, "linha");
        assert_eq!(result.translated_title.as_deref(), Some("Titulo"));
        assert_eq!(result.tags, vec!["rust", "ai"]);
    }

    #[test]
    fn parse_summary_accepts_both_empty() {
        let result =
            SummarizerClient::parse_summary(r#"{"summary_pt": "", "one_line_summary": ""}"#)
                .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn parse_summary_rejects_half_filled() {
        let result =
            SummarizerClient::parse_summary(r#"{"summary_pt": "only one", "one_line_summary": ""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn parse_summary_truncates_one_liner() {
        let long = "x".repeat(300);
        let content =
            format!(r#"{{"summary_pt": "s", "one_line_summary": "{}"}}"#, long);
        let result = SummarizerClient::parse_summary(&content).unwrap();
        assert_eq!(result.one_line_summary.chars().count(), MAX_ONE_LINE_CHARS);
        assert!(result.one_line_summary.ends_with("..."));
    }

    #[test]
    fn null_translated_title_is_dropped() {
        let content = r#"{"summary_pt": "s", "one_line_summary": "o", "translated_title": "null"}"#;
        let result = SummarizerClient::parse_summary(content).unwrap();
        assert_eq!(result.translated_title, None);
    }

    #[test]
    fn choice_content_variants() {
        let cases = [
            serde_json::json!({"choices": [{"message": {"content": "A"}}]}),
            serde_json::json!({"choices": [{"message": {"reasoning": "A"}}]}),
            serde_json::json!({"choices": [{"text": "A"}]}),
            serde_json::json!({"choices": [{"content": "A"}]}),
        ];
        for case in &cases {
            assert_eq!(SummarizerClient::extract_choice_content(case).as_deref(), Some("A"));
        }
        assert_eq!(
            SummarizerClient::extract_choice_content(&serde_json::json!({"choices": []})),
            None
        );
    }
}
