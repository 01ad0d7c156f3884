//! SQLite pool setup, schema migration, and startup integrity verification.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// File size above which the cheaper quick-check is used instead of a full scan
const QUICK_CHECK_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Create the shared connection pool.
///
/// WAL journal + busy_timeout mediate concurrency between the request
/// handlers and the background workers; writers serialize on the WAL.
pub async fn create_pool(path: &str) -> Result<SqlitePool, anyhow::Error> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Apply forward-only migrations from the embedded migrations directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Verify database file integrity on startup.
///
/// Above 100 MB a `quick_check` is run; below, a full `integrity_check`.
/// Any result other than "ok" is fatal: a corrupt store must not serve.
pub async fn verify_integrity(pool: &SqlitePool, path: &str) -> Result<(), anyhow::Error> {
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let pragma = if file_size > QUICK_CHECK_THRESHOLD_BYTES {
        "PRAGMA quick_check"
    } else {
        "PRAGMA integrity_check"
    };

    let rows: Vec<(String,)> = sqlx::query_as(pragma).fetch_all(pool).await?;

    let ok = rows.len() == 1 && rows[0].0.eq_ignore_ascii_case("ok");
    if !ok {
        let detail: Vec<String> = rows.into_iter().map(|r| r.0).collect();
        anyhow::bail!("database integrity check failed: {}", detail.join("; "));
    }

    tracing::info!("Database integrity verified ({}, {} bytes)", pragma, file_size);
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}
