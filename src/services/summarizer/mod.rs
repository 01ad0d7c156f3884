//! Summarization subsystem.
//!
//! The client talks to an OpenAI-compatible chat endpoint; calls are
//! guarded by a persistent circuit breaker and a round-robin API key
//! rotator with per-key cooldowns.

mod circuit;
mod client;
mod parse;
mod rotator;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use client::SummarizerClient;
pub use parse::parse_json_response;
pub use rotator::{ApiKeyRotator, KeyStatus, RotatorStatus};

/// Error taxonomy driving the worker's retry policy
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Retryable: timeouts, connection failures, 5xx, rate limits
    #[error("Temporary error: {0}")]
    Temporary(String),

    /// Not worth retrying: 4xx, unparseable responses
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Every configured key is in cooldown; retry without counting an attempt
    #[error("All API keys are in cooldown")]
    KeysExhausted,
}

/// Result of a summary generation call
#[derive(Debug, Clone, Default)]
pub struct SummaryResult {
    pub summary: String,
    pub one_line_summary: String,
    pub translated_title: Option<String>,
    pub tags: Vec<String>,
}

impl SummaryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Garbage pages summarize to an empty result; the worker records it
    /// as success so the entry is not retried.
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.one_line_summary.is_empty()
    }
}
