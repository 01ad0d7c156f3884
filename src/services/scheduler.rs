//! Background job scheduler with single-leader election.
//!
//! Leadership is a single row in scheduler_lock, renewed by heartbeat.
//! Multiple instances may run behind a load balancer; only the leader runs
//! jobs. Losing the heartbeat race demotes the instance, which must then
//! cancel every job it started.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use sqlx::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::models::SchedulerLock;
use crate::services::app_settings::{AppSettingsService, KEY_HEALTH_WARNING};
use crate::services::feed_ingestion::IngestionService;
use crate::services::retention::run_cleanup;
use crate::services::suggestions::SuggestionService;
use crate::services::summary_worker::{SummaryWorker, WorkerTick, backfill_missing_summaries};
use crate::services::user_profile::{MIN_LIKED_POSTS, UserProfileService};
use crate::utils::{ApiResult, ScheduledExecutor, ScheduledTask};

const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// A lock whose heartbeat is older than this is abandoned and may be taken
const LOCK_TIMEOUT_SECS: i64 = 60;

const FEEDS_PER_CYCLE: i64 = 20;
const INTER_FEED_DELAY_SECS: u64 = 1;
const HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
const PROFILE_INTERVAL_SECS: u64 = 6 * 3600;
const SUGGESTIONS_INTERVAL_SECS: u64 = 3600;
const MIN_FREE_DISK_MB: u64 = 100;

/// Adapter running a closure under the scheduled executor, terminating
/// when the instance stops running or loses leadership.
struct LeaderJob<F> {
    run_fn: F,
    running: Arc<AtomicBool>,
    is_leader: Arc<AtomicBool>,
}

impl<F, Fut> ScheduledTask for LeaderJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin((self.run_fn)())
    }

    fn should_terminate(&self) -> bool {
        !self.running.load(Ordering::Relaxed) || !self.is_leader.load(Ordering::Relaxed)
    }
}

pub struct Scheduler {
    pool: SqlitePool,
    config: Config,
    instance_id: String,
    running: Arc<AtomicBool>,
    is_leader: Arc<AtomicBool>,
    ingestion: Arc<IngestionService>,
    worker: Arc<SummaryWorker>,
    settings: AppSettingsService,
    profile_service: UserProfileService,
    suggestion_service: SuggestionService,
    jobs: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        config: Config,
        ingestion: Arc<IngestionService>,
        worker: Arc<SummaryWorker>,
        settings: AppSettingsService,
        profile_service: UserProfileService,
        suggestion_service: SuggestionService,
    ) -> Self {
        Self {
            pool,
            config,
            instance_id: Uuid::new_v4().to_string(),
            running: Arc::new(AtomicBool::new(false)),
            is_leader: Arc::new(AtomicBool::new(false)),
            ingestion,
            worker,
            settings,
            profile_service,
            suggestion_service,
            jobs: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Start the scheduler: attempt election, begin heartbeating, and when
    /// leader, start the job set.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        tracing::info!("Scheduler starting (instance_id: {})", self.instance_id);

        match self.try_acquire_lock().await {
            Ok(true) => {},
            Ok(false) => tracing::info!("Another instance is leader, standing by"),
            Err(e) => tracing::error!("Leader election failed: {}", e),
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.heartbeat_loop().await });

        if self.is_leader() {
            self.start_jobs().await;
        }
    }

    /// Stop the scheduler, cancel jobs, and release the lock when held.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        tracing::info!("Scheduler stopping...");

        self.cancel_jobs().await;

        if self.is_leader() {
            if let Err(e) = self.release_lock().await {
                tracing::error!("Failed to release scheduler lock: {}", e);
            }
            self.is_leader.store(false, Ordering::Relaxed);
        }
    }

    /// Attempt to become leader. Safe to call repeatedly.
    pub async fn try_acquire_lock(&self) -> ApiResult<bool> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(LOCK_TIMEOUT_SECS);

        let existing: Option<SchedulerLock> =
            sqlx::query_as("SELECT * FROM scheduler_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        let acquired = match existing {
            None => {
                // Two instances can race here; the single-row primary key
                // lets exactly one insert win
                let inserted = sqlx::query(
                    "INSERT OR IGNORE INTO scheduler_lock (id, locked_by, locked_at, heartbeat_at) VALUES (1, ?, ?, ?)",
                )
                .bind(&self.instance_id)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
                inserted == 1
            },
            Some(lock) if lock.locked_by == self.instance_id => {
                sqlx::query("UPDATE scheduler_lock SET heartbeat_at = ? WHERE id = 1 AND locked_by = ?")
                    .bind(now)
                    .bind(&self.instance_id)
                    .execute(&self.pool)
                    .await?;
                true
            },
            Some(lock) if lock.heartbeat_at < cutoff => {
                tracing::info!(
                    "Lock expired (last heartbeat: {}). Taking over...",
                    lock.heartbeat_at
                );
                let updated = sqlx::query(
                    "UPDATE scheduler_lock SET locked_by = ?, locked_at = ?, heartbeat_at = ? WHERE id = 1 AND heartbeat_at < ?",
                )
                .bind(&self.instance_id)
                .bind(now)
                .bind(now)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
                updated == 1
            },
            Some(lock) => {
                tracing::debug!("Another instance is leader: {}", lock.locked_by);
                false
            },
        };

        if acquired && !self.is_leader() {
            tracing::info!("Lock acquired. This instance is the leader.");
        }
        self.is_leader.store(acquired, Ordering::Relaxed);
        Ok(acquired)
    }

    async fn release_lock(&self) -> ApiResult<()> {
        sqlx::query("DELETE FROM scheduler_lock WHERE id = 1 AND locked_by = ?")
            .bind(&self.instance_id)
            .execute(&self.pool)
            .await?;
        tracing::info!("Scheduler lock released");
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            if self.is_leader() {
                if let Err(e) = self.update_heartbeat().await {
                    tracing::error!("Heartbeat failed: {}", e);
                }
            } else {
                // Followers keep trying; a dead leader's lock expires
                match self.try_acquire_lock().await {
                    Ok(true) => self.start_jobs().await,
                    Ok(false) => {},
                    Err(e) => tracing::error!("Lock acquisition failed: {}", e),
                }
            }
        }
    }

    /// Renew the heartbeat. Zero affected rows means another instance took
    /// the lock: demote and cancel everything.
    async fn update_heartbeat(&self) -> ApiResult<()> {
        let updated = sqlx::query(
            "UPDATE scheduler_lock SET heartbeat_at = ? WHERE id = 1 AND locked_by = ?",
        )
        .bind(Utc::now())
        .bind(&self.instance_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            tracing::warn!("Lock lost! Another instance took over.");
            self.is_leader.store(false, Ordering::Relaxed);
            self.cancel_jobs().await;
        }
        Ok(())
    }

    async fn cancel_jobs(&self) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.drain(..) {
            job.abort();
        }
    }

    fn spawn_job<F, Fut>(&self, name: &'static str, interval: Duration, run_fn: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let job = LeaderJob {
            run_fn,
            running: Arc::clone(&self.running),
            is_leader: Arc::clone(&self.is_leader),
        };
        let executor = ScheduledExecutor::new(name, interval);
        tokio::spawn(async move { executor.start(job).await })
    }

    async fn start_jobs(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock().await;
        if !jobs.is_empty() {
            return;
        }
        tracing::info!("Starting background jobs...");

        let feed_interval =
            Duration::from_secs(self.config.jobs.feed_update_interval_minutes.max(1) * 60);
        let scheduler = Arc::clone(self);
        jobs.push(self.spawn_job("update_feeds", feed_interval, move || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run_update_feeds().await }
        }));

        let summary_interval =
            Duration::from_secs((60 / self.config.llm.max_rpm.max(1) as u64 + 1).max(5));
        let scheduler = Arc::clone(self);
        jobs.push(self.spawn_job("process_summaries", summary_interval, move || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run_process_summaries().await }
        }));

        let scheduler = Arc::clone(self);
        jobs.push(self.spawn_job(
            "health_check",
            Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.run_health_check().await }
            },
        ));

        let scheduler = Arc::clone(self);
        jobs.push(self.spawn_job(
            "update_user_profile",
            Duration::from_secs(PROFILE_INTERVAL_SECS),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.run_update_user_profile().await }
            },
        ));

        let scheduler = Arc::clone(self);
        jobs.push(self.spawn_job(
            "process_suggestions",
            Duration::from_secs(SUGGESTIONS_INTERVAL_SECS),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.run_process_suggestions().await }
            },
        ));

        // The retention job fires at a configured hour, not on an interval
        let scheduler = Arc::clone(self);
        jobs.push(tokio::spawn(async move { scheduler.cleanup_retention_loop().await }));
    }

    /// Ids of feeds eligible for fetching, least-erroring first.
    pub async fn eligible_feed_ids(&self) -> ApiResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM feeds
               WHERE disabled_at IS NULL
                 AND (next_retry_at IS NULL OR next_retry_at <= ?)
               ORDER BY error_count ASC
               LIMIT ?"#,
        )
        .bind(Utc::now())
        .bind(FEEDS_PER_CYCLE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn run_update_feeds(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let feed_ids = self.eligible_feed_ids().await?;
        tracing::info!("Job update_feeds: {} feeds to update", feed_ids.len());

        for feed_id in feed_ids {
            if !self.running.load(Ordering::Relaxed) || !self.is_leader() {
                break;
            }
            if let Err(e) = self.ingestion.ingest_feed(feed_id).await {
                tracing::error!("Failed to update feed {}: {}", feed_id, e);
            }
            tokio::time::sleep(Duration::from_secs(INTER_FEED_DELAY_SECS)).await;
        }

        backfill_missing_summaries(&self.pool).await?;
        Ok(())
    }

    async fn run_process_summaries(self: Arc<Self>) -> Result<(), anyhow::Error> {
        match self.worker.process_next().await? {
            WorkerTick::Processed => {},
            WorkerTick::Idle => tracing::debug!("Job process_summaries: queue empty"),
            WorkerTick::Denied(reason) => {
                tracing::debug!("Job process_summaries: {}", reason)
            },
        }
        Ok(())
    }

    async fn run_health_check(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let mut warnings: Vec<String> = Vec::new();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let db_path = std::path::Path::new(&self.config.database.path);
        let free_mb = disks
            .iter()
            .filter(|d| db_path.starts_with(d.mount_point()) || d.mount_point() == std::path::Path::new("/"))
            .map(|d| d.available_space() / (1024 * 1024))
            .min();
        if let Some(free_mb) = free_mb {
            if free_mb < MIN_FREE_DISK_MB {
                warnings.push(format!("Low disk space: {}MB", free_mb));
            }
        }

        if let Ok(meta) = std::fs::metadata(&self.config.database.path) {
            let db_size_mb = (meta.len() / (1024 * 1024)) as i64;
            if db_size_mb > self.config.retention.max_db_size_mb {
                warnings.push(format!("Database too large: {}MB", db_size_mb));
            }
        }

        if warnings.is_empty() {
            self.settings.delete(KEY_HEALTH_WARNING).await?;
        } else {
            let text = warnings.join("; ");
            tracing::warn!("Health check warnings: {}", text);
            self.settings.set(KEY_HEALTH_WARNING, &text).await?;
        }
        Ok(())
    }

    async fn run_update_user_profile(self: Arc<Self>) -> Result<(), anyhow::Error> {
        if !self.profile_service.is_stale().await? {
            return Ok(());
        }
        if self.profile_service.liked_posts_count().await? < MIN_LIKED_POSTS as i64 {
            return Ok(());
        }
        self.profile_service.generate().await?;
        Ok(())
    }

    async fn run_process_suggestions(self: Arc<Self>) -> Result<(), anyhow::Error> {
        if self.profile_service.get_user_profile().await?.is_none() {
            return Ok(());
        }
        self.suggestion_service.process_suggestions().await?;
        Ok(())
    }

    async fn cleanup_retention_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) && self.is_leader() {
            let now = Utc::now();
            let target_hour = self.config.retention.cleanup_hour;

            if now.hour() != target_hour {
                let mut next_run = now
                    .date_naive()
                    .and_hms_opt(target_hour, 0, 0)
                    .unwrap()
                    .and_utc();
                if now.hour() >= target_hour {
                    next_run += ChronoDuration::days(1);
                }
                let wait = (next_run - now).num_seconds().max(0) as u64;
                tokio::time::sleep(Duration::from_secs(wait.min(3600))).await;
                continue;
            }

            tracing::info!("Job cleanup_retention: starting...");
            if let Err(e) = run_cleanup(&self.pool, &self.config.retention).await {
                tracing::error!("Cleanup failed: {}", e);
            }

            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::db;
    use crate::services::summarizer::{ApiKeyRotator, CircuitBreaker, SummarizerClient};

    async fn scheduler(pool: &SqlitePool) -> Arc<Scheduler> {
        let mut config = Config::default();
        config.llm = LlmConfig::default();

        let settings = AppSettingsService::new(pool.clone());
        let rotator = Arc::new(ApiKeyRotator::new(pool.clone(), vec![]).await);
        let circuit = Arc::new(CircuitBreaker::new(pool.clone(), 5, 300, 3, 60_000).await);
        let client = Arc::new(SummarizerClient::new(
            LlmConfig::default(),
            settings.clone(),
            rotator,
            circuit,
        ));
        let profile_service = UserProfileService::new(
            pool.clone(),
            settings.clone(),
            Arc::clone(&client),
            "prompts.yaml".to_string(),
        );
        let suggestion_service = SuggestionService::new(
            pool.clone(),
            profile_service.clone(),
            Arc::clone(&client),
            "prompts.yaml".to_string(),
        );

        Arc::new(Scheduler::new(
            pool.clone(),
            config,
            Arc::new(IngestionService::new(pool.clone())),
            Arc::new(SummaryWorker::new(pool.clone(), client, 300)),
            settings,
            profile_service,
            suggestion_service,
        ))
    }

    #[tokio::test]
    async fn first_instance_becomes_leader() {
        let pool = db::test_pool().await;
        let scheduler = scheduler(&pool).await;

        assert!(scheduler.try_acquire_lock().await.unwrap());
        assert!(scheduler.is_leader());

        // Re-acquisition by the same instance stays leader
        assert!(scheduler.try_acquire_lock().await.unwrap());
    }

    #[tokio::test]
    async fn second_instance_is_follower_while_lock_is_fresh() {
        let pool = db::test_pool().await;
        let a = scheduler(&pool).await;
        let b = scheduler(&pool).await;

        assert!(a.try_acquire_lock().await.unwrap());
        assert!(!b.try_acquire_lock().await.unwrap());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let pool = db::test_pool().await;
        let a = scheduler(&pool).await;
        let b = scheduler(&pool).await;

        assert!(a.try_acquire_lock().await.unwrap());

        // Age the heartbeat past the lock timeout
        let stale = Utc::now() - ChronoDuration::seconds(LOCK_TIMEOUT_SECS + 10);
        sqlx::query("UPDATE scheduler_lock SET heartbeat_at = ? WHERE id = 1")
            .bind(stale)
            .execute(&pool)
            .await
            .unwrap();

        assert!(b.try_acquire_lock().await.unwrap());
        assert!(b.is_leader());

        let lock: SchedulerLock = sqlx::query_as("SELECT * FROM scheduler_lock WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(lock.locked_by, b.instance_id());
    }

    #[tokio::test]
    async fn losing_the_lock_demotes_on_heartbeat() {
        let pool = db::test_pool().await;
        let a = scheduler(&pool).await;
        a.running.store(true, Ordering::Relaxed);

        assert!(a.try_acquire_lock().await.unwrap());

        // Another instance steals the row out from under us
        sqlx::query("UPDATE scheduler_lock SET locked_by = 'other' WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        a.update_heartbeat().await.unwrap();
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn stop_releases_the_lock() {
        let pool = db::test_pool().await;
        let a = scheduler(&pool).await;
        a.running.store(true, Ordering::Relaxed);
        assert!(a.try_acquire_lock().await.unwrap());

        a.stop().await;

        let lock: Option<SchedulerLock> =
            sqlx::query_as("SELECT * FROM scheduler_lock WHERE id = 1")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(lock.is_none());
    }

    #[tokio::test]
    async fn eligible_feeds_ordering_and_filters() {
        let pool = db::test_pool().await;
        let scheduler = scheduler(&pool).await;
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO feeds (title, url, error_count) VALUES
               ('errors', 'https://a.com/rss', 5),
               ('clean', 'https://b.com/rss', 0)"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO feeds (title, url, disabled_at) VALUES ('off', 'https://c.com/rss', ?)")
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO feeds (title, url, next_retry_at) VALUES ('later', 'https://d.com/rss', ?)")
            .bind(now + ChronoDuration::hours(1))
            .execute(&pool)
            .await
            .unwrap();

        let ids = scheduler.eligible_feed_ids().await.unwrap();
        assert_eq!(ids.len(), 2);

        let first: (String,) = sqlx::query_as("SELECT title FROM feeds WHERE id = ?")
            .bind(ids[0])
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(first.0, "clean");
    }
}
