//! Execution coordinator: turns a due job into a persisted run.

use std::{sync::Arc, time::Duration};

use {
    cadence_config::SchedulerConfig,
    chrono::Utc,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use {
    crate::metric_names,
    metrics::{counter, histogram},
};

use crate::{
    cache::{CacheEntry, JobCache},
    executor::Executor,
    schedule::{NextRun, Repeat, advance},
    store::{JobStore, RunStore},
    types::{Job, JobStat, RunStatus},
};

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
        )
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Why a job is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fired by the job's timer; carries the timer generation.
    Scheduled(u64),
    /// Explicit "run now". Leaves the schedule untouched.
    Manual,
}

pub struct Coordinator {
    cache: Arc<JobCache>,
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(
        cache: Arc<JobCache>,
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            jobs,
            runs,
            executor,
            retry,
        }
    }

    /// Run a job once, with retries, and schedule its next occurrence.
    ///
    /// Returns `None` when the trigger was dropped: a stale timer, a
    /// removed entry, or a scheduled firing of a disabled job.
    pub async fn run(&self, entry: Arc<CacheEntry>, trigger: Trigger) -> Option<JobStat> {
        let _run_guard = entry.lock_run().await;

        if let Trigger::Scheduled(generation) = trigger
            && generation != entry.generation()
        {
            debug!(id = entry.id(), generation, "dropping stale trigger");
            return None;
        }
        if entry.is_removed() {
            debug!(id = entry.id(), "job no longer cached, skipping run");
            return None;
        }
        let job = entry.job();
        if job.disabled && trigger != Trigger::Manual {
            debug!(id = %job.id, "job disabled, skipping run");
            return None;
        }

        info!(id = %job.id, name = %job.name, ?trigger, "executing job");

        #[cfg(feature = "metrics")]
        counter!(metric_names::EXECUTIONS_TOTAL).increment(1);

        let run = self.execute_with_retries(&job).await;

        #[cfg(feature = "metrics")]
        if let Some(ms) = run.duration_ms {
            histogram!(metric_names::EXECUTION_DURATION_SECONDS).record(ms as f64 / 1000.0);
        }

        match run.status {
            RunStatus::Succeeded => {
                info!(id = %job.id, run_id = %run.id, retries = run.retries, "job succeeded");
            },
            _ => {
                #[cfg(feature = "metrics")]
                counter!(metric_names::ERRORS_TOTAL).increment(1);
                error!(
                    id = %job.id,
                    run_id = %run.id,
                    retries = run.retries,
                    error = run.error.as_deref().unwrap_or_default(),
                    "job failed"
                );
            },
        }

        entry.update(|job| {
            job.metadata.record(&run);
            job.updated_at = Utc::now();
        });

        // Entries evicted by a stop mid-run still record the advanced state.
        if matches!(trigger, Trigger::Scheduled(_)) && !entry.is_deleted() {
            let (next, remaining) = next_run(&entry.job());
            entry.update(|job| job.state.remaining_repeats = remaining);
            self.cache.reschedule_entry(&entry, next);
        }

        self.persist_job(&entry).await;
        entry.publish(run.clone());
        Some(run)
    }

    async fn execute_with_retries(&self, job: &Job) -> JobStat {
        let mut run = JobStat::start(&job.id, Utc::now());
        if let Err(e) = self.runs.save_run(&run).await {
            warn!(id = %job.id, error = %e, "failed to save run");
        }

        let outcome = loop {
            match self.executor.execute(job).await {
                Ok(out) => break Ok(out.output),
                Err(e) if run.retries < job.retries => {
                    run.retries += 1;
                    run.error = Some(e.to_string());
                    let delay = self.retry.delay(run.retries);

                    #[cfg(feature = "metrics")]
                    counter!(metric_names::RETRIES_TOTAL).increment(1);

                    warn!(
                        id = %job.id,
                        attempt = run.retries,
                        of = job.retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "job attempt failed, retrying"
                    );
                    if let Err(e) = self.runs.update_run(&run).await {
                        warn!(id = %job.id, error = %e, "failed to update run");
                    }
                    tokio::time::sleep(delay).await;
                },
                Err(e) => break Err(e),
            }
        };

        run.finish(Utc::now(), outcome);
        if let Err(e) = self.runs.update_run(&run).await {
            warn!(id = %job.id, error = %e, "failed to update run");
        }
        run
    }

    /// Save the entry's job unless it was deleted while running.
    async fn persist_job(&self, entry: &CacheEntry) {
        let _persist_guard = entry.lock_persist().await;
        if entry.is_deleted() {
            return;
        }
        let job = entry.job();
        if let Err(e) = self.jobs.save(&job).await {
            warn!(id = %job.id, error = %e, "failed to save job");
        }
    }
}

/// Next occurrence after a run that just finished, with the repeat counter
/// that goes with it.
fn next_run(job: &Job) -> (NextRun, Repeat) {
    let spec = match job.schedule_spec() {
        Ok(Some(spec)) => spec,
        Ok(None) => return (NextRun::Exhausted, Repeat::Times(0)),
        Err(e) => {
            warn!(id = %job.id, error = %e, "unreadable schedule, retiring job");
            return (NextRun::Exhausted, Repeat::Times(0));
        },
    };
    let anchor = job.state.anchor_at.unwrap_or_else(|| spec.start_utc());
    advance(&spec, job.state.remaining_repeats, anchor, Utc::now())
}
