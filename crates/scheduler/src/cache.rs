//! In-memory index of active jobs and their timers.
//!
//! The cache is the single authority over when a job runs next. Each entry
//! owns one timer task that sleeps until the job is due and then posts a
//! [`DueJob`] on the cache's channel. Re-arming aborts the previous task
//! and bumps the entry's generation, so a due notice that raced a
//! reschedule is recognisable as stale.
//!
//! Cache operations are synchronous but spawn timer tasks, so they must be
//! called from within a tokio runtime.

use std::sync::{Arc, Mutex, RwLock};

use {
    chrono::{DateTime, Utc},
    dashmap::{DashMap, mapref::entry::Entry},
    tokio::{
        sync::{MutexGuard, broadcast, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use {crate::metric_names, metrics::gauge};

use crate::{
    Error, Result,
    schedule::{NextRun, Repeat, first_due, next_due},
    types::{Job, JobStat},
};

/// Upper bound for one timer sleep; the wall clock is re-checked after each.
const MAX_SLEEP: std::time::Duration = std::time::Duration::from_secs(60 * 60);

const COMPLETION_CAPACITY: usize = 16;

/// Posted by a timer task when its job is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueJob {
    pub job_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Active,
    /// Repeats exhausted; the job is kept in the store.
    Retired,
    /// Explicitly deleted.
    Deleted,
}

struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
    residency: Residency,
}

/// One job in the cache together with its timer and locks.
pub struct CacheEntry {
    id: String,
    job: RwLock<Job>,
    run_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    timer: Mutex<TimerSlot>,
    completions: broadcast::Sender<JobStat>,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot();
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("generation", &slot.generation)
            .field("residency", &slot.residency)
            .finish_non_exhaustive()
    }
}

impl CacheEntry {
    fn new(job: Job) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        Self {
            id: job.id.clone(),
            job: RwLock::new(job),
            run_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            timer: Mutex::new(TimerSlot {
                handle: None,
                generation: 0,
                residency: Residency::Active,
            }),
            completions,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the job.
    pub fn job(&self) -> Job {
        self.job.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate the job under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut job = self.job.write().unwrap_or_else(|e| e.into_inner());
        f(&mut job)
    }

    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    /// No longer in the cache, either retired or deleted.
    pub fn is_removed(&self) -> bool {
        self.slot().residency != Residency::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.slot().residency == Residency::Deleted
    }

    /// Whether a timer task is currently pending.
    pub fn is_armed(&self) -> bool {
        self.slot()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Held for the whole of a run; at most one run per job at a time.
    pub async fn lock_run(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// Held while writing the job to the store, so a delete can never be
    /// overtaken by a late save.
    pub async fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStat> {
        self.completions.subscribe()
    }

    /// Send a terminal run to subscribers. A no-op without receivers.
    pub fn publish(&self, run: JobStat) {
        let _ = self.completions.send(run);
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, TimerSlot> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, at: DateTime<Utc>, due_tx: &mpsc::UnboundedSender<DueJob>) {
        let mut slot = self.slot();
        if slot.residency != Residency::Active {
            return;
        }
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;

        let due = DueJob {
            job_id: self.id.clone(),
            generation: slot.generation,
        };
        let tx = due_tx.clone();
        slot.handle = Some(tokio::spawn(async move {
            sleep_until(at).await;
            let _ = tx.send(due);
        }));
    }

    fn disarm(&self) {
        let mut slot = self.slot();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
    }

    fn evict(&self, residency: Residency) {
        let mut slot = self.slot();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
        slot.residency = residency;
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    loop {
        let remaining = at - Utc::now();
        let Ok(wait) = remaining.to_std() else {
            return;
        };
        if wait.is_zero() {
            return;
        }
        tokio::time::sleep(wait.min(MAX_SLEEP)).await;
    }
}

/// Compute the instant a loaded or re-enabled job should next run.
///
/// A job that never ran keeps its planned instant (or runs immediately if
/// that has passed). A job that already ran skips forward to the first
/// occurrence strictly after `now`; skipped occurrences do not consume
/// repeats.
fn resume_at(job: &mut Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let spec = job.schedule_spec()?;
    let Some(planned) = job.state.next_run_at else {
        let at = first_due(spec.as_ref(), now);
        job.state.next_run_at = Some(at);
        if job.state.anchor_at.is_none() {
            job.state.anchor_at = spec.as_ref().map(|s| s.start_utc());
            job.state.remaining_repeats = spec.as_ref().map_or(Repeat::Times(0), |s| s.repeat);
        }
        return Ok(Some(at));
    };
    if planned > now || job.metadata.last_attempted_run.is_none() {
        return Ok(Some(planned.max(now)));
    }
    let Some(spec) = spec else {
        return Ok(None);
    };
    let anchor = job.state.anchor_at.unwrap_or(planned);
    let Some(next) = next_due(&spec.interval, *spec.start.offset(), anchor, now) else {
        return Ok(None);
    };
    job.state.next_run_at = Some(next);
    job.state.anchor_at = Some(next);
    Ok(Some(next))
}

/// Process-wide index of active jobs.
pub struct JobCache {
    jobs: DashMap<String, Arc<CacheEntry>>,
    due_tx: mpsc::UnboundedSender<DueJob>,
}

impl JobCache {
    /// Create an empty cache and the receiver its timers post to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DueJob>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: DashMap::new(),
                due_tx,
            },
            due_rx,
        )
    }

    /// Insert a new job and arm it for its first due instant.
    pub fn add(&self, job: Job) -> Result<Job> {
        let entry = self.insert(job)?;
        self.arm_entry(&entry);
        Ok(entry.job())
    }

    /// Insert a new job without starting its timer; [`JobCache::arm_entry`]
    /// starts it. Lets a caller persist the job before it can fire.
    pub fn insert(&self, mut job: Job) -> Result<Arc<CacheEntry>> {
        let spec = job.schedule_spec()?;
        let now = Utc::now();
        job.state.next_run_at = Some(first_due(spec.as_ref(), now));
        job.state.anchor_at = spec.as_ref().map(|s| s.start_utc());
        job.state.remaining_repeats = spec.as_ref().map_or(Repeat::Times(0), |s| s.repeat);
        job.state.finished = false;

        let entry = match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => return Err(Error::duplicate_job(&job.id)),
            Entry::Vacant(vacant) => vacant.insert(Arc::new(CacheEntry::new(job.clone()))).clone(),
        };
        self.record_scheduled();
        debug!(id = %job.id, next_run_at = ?job.state.next_run_at, "job added to cache");
        Ok(entry)
    }

    /// Insert a persisted job, resuming its schedule. Returns `None` for a
    /// job with nothing left to run.
    pub fn load(&self, mut job: Job) -> Result<Option<Job>> {
        if job.state.finished {
            return Ok(None);
        }
        if resume_at(&mut job, Utc::now())?.is_none() {
            debug!(id = %job.id, "nothing left to run, not loading");
            return Ok(None);
        }

        let entry = match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => return Err(Error::duplicate_job(&job.id)),
            Entry::Vacant(vacant) => vacant.insert(Arc::new(CacheEntry::new(job.clone()))).clone(),
        };
        self.arm_entry(&entry);
        self.record_scheduled();
        Ok(Some(job))
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.entry(id)
            .map(|e| e.job())
            .ok_or_else(|| Error::job_not_found(id))
    }

    /// Snapshot of every cached job, in no particular order.
    pub fn get_all(&self) -> Vec<Job> {
        let entries: Vec<Arc<CacheEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        entries.iter().map(|e| e.job()).collect()
    }

    pub fn entry(&self, id: &str) -> Option<Arc<CacheEntry>> {
        self.jobs.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Remove a job. A run already in flight completes but is not re-armed.
    pub fn delete(&self, id: &str) -> Result<Arc<CacheEntry>> {
        let (_, entry) = self
            .jobs
            .remove(id)
            .ok_or_else(|| Error::job_not_found(id))?;
        entry.evict(Residency::Deleted);
        self.record_scheduled();
        info!(id, "job deleted from cache");
        Ok(entry)
    }

    /// Re-arm a job at `next`, or retire it when its repeats are exhausted.
    pub fn reschedule(&self, id: &str, next: NextRun) -> Result<Job> {
        let entry = self.entry(id).ok_or_else(|| Error::job_not_found(id))?;
        Ok(self.reschedule_entry(&entry, next))
    }

    pub(crate) fn reschedule_entry(&self, entry: &Arc<CacheEntry>, next: NextRun) -> Job {
        match next {
            NextRun::At(at) => {
                let job = entry.update(|job| {
                    job.state.next_run_at = Some(at);
                    job.state.anchor_at = Some(at);
                    job.clone()
                });
                self.arm_entry(entry);
                debug!(id = %entry.id, next_run_at = %at, "job rescheduled");
                job
            },
            NextRun::Exhausted => {
                let job = entry.update(|job| {
                    job.state.next_run_at = None;
                    job.state.finished = true;
                    job.clone()
                });
                self.jobs.remove_if(&entry.id, |_, v| Arc::ptr_eq(v, entry));
                entry.evict(Residency::Retired);
                self.record_scheduled();
                info!(id = %entry.id, "job finished, removed from cache");
                job
            },
        }
    }

    /// Re-arm a disabled job at its next due instant.
    pub fn enable(&self, id: &str) -> Result<Job> {
        let entry = self.entry(id).ok_or_else(|| Error::job_not_found(id))?;
        let now = Utc::now();
        let job = entry.update(|job| {
            job.disabled = false;
            job.updated_at = now;
            resume_at(job, now).map(|_| job.clone())
        })?;
        self.arm_entry(&entry);
        Ok(job)
    }

    /// Keep a job in the cache but stop its timer.
    pub fn disable(&self, id: &str) -> Result<Job> {
        let entry = self.entry(id).ok_or_else(|| Error::job_not_found(id))?;
        let now = Utc::now();
        let job = entry.update(|job| {
            job.disabled = true;
            job.updated_at = now;
            job.clone()
        });
        entry.disarm();
        Ok(job)
    }

    /// Receiver for the terminal run of every future run of the job.
    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<JobStat>> {
        self.entry(id)
            .map(|e| e.subscribe())
            .ok_or_else(|| Error::job_not_found(id))
    }

    /// Stop every timer; entries stay cached.
    pub fn disarm_all(&self) {
        for entry in self.jobs.iter() {
            entry.value().disarm();
        }
    }

    /// Drop every entry and stop its timer.
    pub fn clear(&self) {
        let entries: Vec<Arc<CacheEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        self.jobs.clear();
        for entry in entries {
            entry.evict(Residency::Retired);
        }
        self.record_scheduled();
    }

    /// Start (or restart) the entry's timer at its next due instant. A
    /// disabled job is disarmed instead; a removed entry is left alone.
    pub fn arm_entry(&self, entry: &CacheEntry) {
        let job = entry.job();
        match job.state.next_run_at {
            Some(at) if !job.disabled => entry.arm(at, &self.due_tx),
            _ => entry.disarm(),
        }
    }

    fn record_scheduled(&self) {
        #[cfg(feature = "metrics")]
        gauge!(metric_names::JOBS_SCHEDULED).set(self.jobs.len() as f64);
    }
}
