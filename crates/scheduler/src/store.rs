//! Persistence traits for jobs and run history.

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeDelta, Utc},
};

use crate::{
    Result,
    types::{Job, JobStat},
};

/// Persistence backend for job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Job>>;
    /// Fails with [`crate::Error::JobNotFound`] when absent.
    async fn get(&self, id: &str) -> Result<Job>;
    /// Insert or replace.
    async fn save(&self, job: &Job) -> Result<()>;
    /// Fails with [`crate::Error::JobNotFound`] when absent.
    async fn delete(&self, id: &str) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Persistence backend for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &JobStat) -> Result<()>;
    /// Insert or replace.
    async fn update_run(&self, run: &JobStat) -> Result<()>;
    async fn get_run(&self, run_id: &str) -> Result<Option<JobStat>>;
    /// All runs of a job, oldest first.
    async fn get_all_runs(&self, job_id: &str) -> Result<Vec<JobStat>>;
    async fn delete_runs(&self, job_id: &str) -> Result<()>;
    /// Drop finished runs older than the configured retention. Returns the
    /// number removed.
    async fn clear_expired_runs(&self) -> Result<u64>;
}

/// Cutoff for run retention, `None` when runs are kept forever.
pub(crate) fn retention_cutoff(retention: Option<TimeDelta>) -> Option<DateTime<Utc>> {
    retention.map(|r| Utc::now() - r)
}

/// Whether a run falls outside the retention window.
pub(crate) fn is_expired(run: &JobStat, cutoff: DateTime<Utc>) -> bool {
    run.finished_at.is_some_and(|at| at < cutoff)
}
