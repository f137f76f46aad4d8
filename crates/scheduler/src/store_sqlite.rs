//! SQLite-backed store using sqlx.

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeDelta, Utc},
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    Context, Error, Result,
    store::{JobStore, RunStore, retention_cutoff},
    types::{Job, JobStat, RunStatus},
};

/// SQLite-backed persistence for jobs and run history.
pub struct SqliteStore {
    pool: SqlitePool,
    retention: Option<TimeDelta>,
}

impl SqliteStore {
    /// Create a new store with its own connection pool and run migrations.
    ///
    /// For a pool shared with other tables use [`SqliteStore::with_pool`]
    /// after calling [`crate::run_migrations`].
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to SQLite")?;

        crate::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            retention: None,
        })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retention: None,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = Some(retention);
        self
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::message(format!("timestamp out of range: {ms}")))
}

fn run_from_row(row: &SqliteRow) -> Result<JobStat> {
    let status: String = row.get("status");
    let finished_at: Option<i64> = row.get("finished_at");
    let duration_ms: Option<i64> = row.get("duration_ms");
    Ok(JobStat {
        id: row.get("id"),
        job_id: row.get("job_id"),
        started_at: from_millis(row.get("started_at"))?,
        finished_at: finished_at.map(from_millis).transpose()?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| Error::message(format!("unknown run status: {status}")))?,
        retries: u32::try_from(row.get::<i64, _>("retries")).unwrap_or(0),
        error: row.get("error"),
        output: row.get("output"),
        duration_ms: duration_ms.and_then(|v| u64::try_from(v).ok()),
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT data FROM jobs ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            jobs.push(serde_json::from_str(&data)?);
        }
        Ok(jobs)
    }

    async fn get(&self, id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::job_not_found(id))?;
        let data: String = row.get("data");
        Ok(serde_json::from_str(&data)?)
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO jobs (id, data, finished, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                finished = excluded.finished,
                updated_at = excluded.updated_at",
        )
        .bind(&job.id)
        .bind(&data)
        .bind(job.state.finished)
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::job_not_found(id));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn save_run(&self, run: &JobStat) -> Result<()> {
        self.update_run(run).await
    }

    async fn update_run(&self, run: &JobStat) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_runs (id, job_id, started_at, finished_at, status, retries, error, output, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                retries = excluded.retries,
                error = excluded.error,
                output = excluded.output,
                duration_ms = excluded.duration_ms",
        )
        .bind(&run.id)
        .bind(&run.job_id)
        .bind(to_millis(run.started_at))
        .bind(run.finished_at.map(to_millis))
        .bind(run.status.as_str())
        .bind(i64::from(run.retries))
        .bind(&run.error)
        .bind(&run.output)
        .bind(run.duration_ms.and_then(|v| i64::try_from(v).ok()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<JobStat>> {
        let row = sqlx::query(
            "SELECT id, job_id, started_at, finished_at, status, retries, error, output, duration_ms
             FROM job_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_all_runs(&self, job_id: &str) -> Result<Vec<JobStat>> {
        let rows = sqlx::query(
            "SELECT id, job_id, started_at, finished_at, status, retries, error, output, duration_ms
             FROM job_runs
             WHERE job_id = ?
             ORDER BY started_at ASC, rowid ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn delete_runs(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_runs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_expired_runs(&self) -> Result<u64> {
        let Some(cutoff) = retention_cutoff(self.retention) else {
            return Ok(0);
        };
        let result =
            sqlx::query("DELETE FROM job_runs WHERE finished_at IS NOT NULL AND finished_at < ?")
                .bind(to_millis(cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
