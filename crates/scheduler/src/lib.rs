//! Job scheduling core: recurrence, the in-memory job cache, execution with
//! retries, and pluggable persistence for jobs and run history.
//!
//! Schedules use ISO 8601 repeating intervals (`R2/2024-01-01T00:00:00Z/P1D`).
//! Jobs run as local shell commands or as HTTP calls.

pub mod cache;
pub mod duration;
pub mod error;
pub mod executor;
pub mod metric_names;
pub mod runner;
pub mod schedule;
pub mod service;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use error::{Context, Error, Result};

/// Run database migrations for the scheduler.
///
/// This creates the `jobs` and `job_runs` tables. Should be called at
/// application startup when using [`store_sqlite::SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
