//! Circuit breaker protecting the LLM endpoint.
//!
//! State machine: CLOSED -> OPEN after `failure_threshold` failures,
//! OPEN -> HALF after `recovery_timeout`, HALF -> CLOSED after
//! `half_open_max_requests` consecutive successes, HALF -> OPEN on any
//! failure. A minimum inter-call interval of 60/max_rpm seconds applies in
//! every state. Rate-limit responses (429) never count as breaker
//! failures; they only set a global rate-limited-until window.
//!
//! State is persisted in app_settings so a restart resumes where the
//! previous process stopped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::services::app_settings::{get_setting, set_setting};

const STATE_KEY: &str = "llm_circuit_state";
const FAILURES_KEY: &str = "llm_circuit_failures";
const HALF_SUCCESSES_KEY: &str = "llm_circuit_half_successes";
const LAST_FAILURE_KEY: &str = "llm_circuit_last_failure";
const LAST_CALL_KEY: &str = "llm_circuit_last_call";
const RATE_LIMITED_UNTIL_KEY: &str = "rate_limited_until";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    Half,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Half => "half",
        }
    }

    fn parse_state(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half" => Self::Half,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failures: u32,
    pub half_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<DateTime<Utc>>,
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    half_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    last_call: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    pool: SqlitePool,
    failure_threshold: u32,
    recovery_timeout_secs: i64,
    half_open_max_requests: u32,
    min_interval_secs: f64,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub async fn new(
        pool: SqlitePool,
        failure_threshold: u32,
        recovery_timeout_secs: i64,
        half_open_max_requests: u32,
        max_rpm: u32,
    ) -> Self {
        let load = |key: &'static str| {
            let pool = pool.clone();
            async move { get_setting(&pool, key).await.ok().flatten() }
        };

        let state = load(STATE_KEY)
            .await
            .map(|v| CircuitState::parse_state(&v))
            .unwrap_or(CircuitState::Closed);
        let failures = load(FAILURES_KEY).await.and_then(|v| v.parse().ok()).unwrap_or(0);
        let half_successes =
            load(HALF_SUCCESSES_KEY).await.and_then(|v| v.parse().ok()).unwrap_or(0);
        let last_failure = load(LAST_FAILURE_KEY)
            .await
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc));
        let last_call = load(LAST_CALL_KEY)
            .await
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc));
        let rate_limited_until = load(RATE_LIMITED_UNTIL_KEY)
            .await
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc));

        Self {
            pool,
            failure_threshold,
            recovery_timeout_secs,
            half_open_max_requests,
            min_interval_secs: 60.0 / max_rpm.max(1) as f64,
            inner: Mutex::new(BreakerState {
                state,
                failures,
                half_successes,
                last_failure,
                last_call,
                rate_limited_until,
            }),
        }
    }

    async fn save_state(&self, state: &BreakerState) {
        let writes: Vec<(&str, String)> = vec![
            (STATE_KEY, state.state.as_str().to_string()),
            (FAILURES_KEY, state.failures.to_string()),
            (HALF_SUCCESSES_KEY, state.half_successes.to_string()),
        ];
        for (key, value) in writes {
            if let Err(e) = set_setting(&self.pool, key, &value).await {
                tracing::error!("Failed to persist circuit breaker state: {}", e);
            }
        }
        for (key, value) in [
            (LAST_FAILURE_KEY, state.last_failure),
            (LAST_CALL_KEY, state.last_call),
            (RATE_LIMITED_UNTIL_KEY, state.rate_limited_until),
        ] {
            if let Some(value) = value {
                if let Err(e) = set_setting(&self.pool, key, &value.to_rfc3339()).await {
                    tracing::error!("Failed to persist circuit breaker state: {}", e);
                }
            }
        }
    }

    /// Whether a call may proceed now. Returns the denial reason otherwise.
    pub async fn can_call(&self) -> Result<(), String> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if let Some(until) = inner.rate_limited_until {
            if now < until {
                return Err(format!("Rate limited until {}", until.to_rfc3339()));
            }
        }

        if let Some(last_call) = inner.last_call {
            let elapsed = (now - last_call).num_milliseconds() as f64 / 1000.0;
            if elapsed < self.min_interval_secs {
                return Err(format!(
                    "Waiting minimum interval ({:.1}s remaining)",
                    self.min_interval_secs - elapsed
                ));
            }
        }

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|f| (now - f).num_seconds())
                .unwrap_or(i64::MAX);
            if elapsed >= self.recovery_timeout_secs {
                inner.state = CircuitState::Half;
                inner.half_successes = 0;
                self.save_state(&inner).await;
                tracing::info!("Circuit breaker: OPEN -> HALF");
            } else {
                return Err(format!(
                    "Circuit breaker OPEN (recovery in {}s)",
                    self.recovery_timeout_secs - elapsed
                ));
            }
        }

        Ok(())
    }

    pub async fn record_success(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.last_call = Some(now);

        if inner.state == CircuitState::Half {
            inner.half_successes += 1;
            if inner.half_successes >= self.half_open_max_requests {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                tracing::info!("Circuit breaker: HALF -> CLOSED");
            }
        } else {
            inner.failures = 0;
        }

        self.save_state(&inner).await;
    }

    /// Record a failed call. Rate limits only set the global cooldown
    /// window; they never move the state machine.
    pub async fn record_failure(&self, is_rate_limit: bool) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.last_call = Some(now);
        inner.last_failure = Some(now);

        if is_rate_limit {
            inner.rate_limited_until = Some(now + Duration::seconds(60));
            tracing::warn!("Rate limit hit, 60s cooldown");
        } else if inner.state == CircuitState::Half {
            inner.state = CircuitState::Open;
            tracing::warn!("Circuit breaker: HALF -> OPEN (failure)");
        } else {
            inner.failures += 1;
            if inner.failures >= self.failure_threshold {
                inner.state = CircuitState::Open;
                tracing::warn!("Circuit breaker: CLOSED -> OPEN ({} failures)", inner.failures);
            }
        }

        self.save_state(&inner).await;
    }

    pub async fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock().await;
        CircuitStatus {
            state: inner.state,
            failures: inner.failures,
            half_successes: inner.half_successes,
            last_failure_at: inner.last_failure,
            rate_limited_until: inner.rate_limited_until.filter(|u| *u > Utc::now()),
        }
    }

    #[cfg(test)]
    async fn force_timestamps(
        &self,
        last_call: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.last_call = last_call;
        inner.last_failure = last_failure;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn breaker(pool: &SqlitePool) -> CircuitBreaker {
        // max_rpm high enough that the inter-call interval never interferes
        CircuitBreaker::new(pool.clone(), 5, 300, 3, 60_000).await
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let pool = db::test_pool().await;
        let cb = breaker(&pool).await;

        for _ in 0..4 {
            cb.record_failure(false).await;
            cb.force_timestamps(None, Some(Utc::now())).await;
            assert!(cb.can_call().await.is_ok());
        }
        cb.record_failure(false).await;
        cb.force_timestamps(None, Some(Utc::now())).await;

        let denied = cb.can_call().await;
        assert!(denied.is_err());
        assert!(denied.unwrap_err().contains("OPEN"));
    }

    #[tokio::test]
    async fn open_transitions_to_half_after_recovery() {
        let pool = db::test_pool().await;
        let cb = breaker(&pool).await;

        for _ in 0..5 {
            cb.record_failure(false).await;
        }
        // Pretend the last failure happened past the recovery window
        cb.force_timestamps(None, Some(Utc::now() - Duration::seconds(301))).await;

        assert!(cb.can_call().await.is_ok());
        assert_eq!(cb.status().await.state, CircuitState::Half);
    }

    #[tokio::test]
    async fn half_closes_after_successes_and_reopens_on_failure() {
        let pool = db::test_pool().await;
        let cb = breaker(&pool).await;

        for _ in 0..5 {
            cb.record_failure(false).await;
        }
        cb.force_timestamps(None, Some(Utc::now() - Duration::seconds(301))).await;
        cb.can_call().await.unwrap();

        // A single failure in HALF goes straight back to OPEN
        cb.record_failure(false).await;
        assert_eq!(cb.status().await.state, CircuitState::Open);

        cb.force_timestamps(None, Some(Utc::now() - Duration::seconds(301))).await;
        cb.can_call().await.unwrap();
        for _ in 0..3 {
            cb.record_success().await;
            cb.force_timestamps(None, None).await;
        }
        assert_eq!(cb.status().await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn rate_limit_does_not_trip_breaker() {
        let pool = db::test_pool().await;
        let cb = breaker(&pool).await;

        for _ in 0..10 {
            cb.record_failure(true).await;
        }
        assert_eq!(cb.status().await.state, CircuitState::Closed);

        // But calls are denied while the rate-limit window is active
        assert!(cb.can_call().await.is_err());
    }

    #[tokio::test]
    async fn min_interval_is_enforced() {
        let pool = db::test_pool().await;
        // 1 rpm -> 60s minimum interval
        let cb = CircuitBreaker::new(pool, 5, 300, 3, 1).await;

        cb.record_success().await;
        let denied = cb.can_call().await;
        assert!(denied.is_err());
        assert!(denied.unwrap_err().contains("interval"));
    }

    #[tokio::test]
    async fn state_is_persisted() {
        let pool = db::test_pool().await;
        {
            let cb = breaker(&pool).await;
            for _ in 0..5 {
                cb.record_failure(false).await;
            }
        }
        let cb = breaker(&pool).await;
        assert_eq!(cb.status().await.state, CircuitState::Open);
    }
}
