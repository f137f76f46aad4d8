//! The scheduler service: wires the cache, coordinator, stores and executor.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    cadence_config::SchedulerConfig,
    chrono::{DateTime, Utc},
    tokio::{
        sync::{Mutex, broadcast, mpsc, watch},
        task::{JoinHandle, JoinSet},
    },
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    cache::{DueJob, JobCache},
    executor::Executor,
    runner::{Coordinator, RetryPolicy, Trigger},
    store::{JobStore, RunStore},
    types::{Job, JobCreate, JobStat, SchedulerStats},
};

/// The job scheduler.
pub struct Scheduler {
    cache: Arc<JobCache>,
    coordinator: Arc<Coordinator>,
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
    due_rx: Mutex<Option<mpsc::UnboundedReceiver<DueJob>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    /// Set by `stop`, which closes the job store for good.
    closed: AtomicBool,
    maintenance_interval: Duration,
    created_at: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        let (cache, due_rx) = JobCache::new();
        let cache = Arc::new(cache);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&cache),
            Arc::clone(&jobs),
            Arc::clone(&runs),
            executor,
            RetryPolicy::from_config(config),
        ));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cache,
            coordinator,
            jobs,
            runs,
            due_rx: Mutex::new(Some(due_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            maintenance_interval: Duration::from_secs(config.maintenance_interval_secs.max(1)),
            created_at: Utc::now(),
        })
    }

    /// Load jobs from the store and start the dispatch and maintenance loops.
    ///
    /// A scheduler starts at most once: `stop` closes the job store.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::message("scheduler was stopped, its job store is closed"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::message("scheduler already running"));
        }
        let Some(due_rx) = self.due_rx.lock().await.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::message("scheduler already started"));
        };

        let stored = match self.jobs.get_all().await {
            Ok(stored) => stored,
            Err(e) => {
                *self.due_rx.lock().await = Some(due_rx);
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            },
        };
        let total = stored.len();
        let mut loaded = 0;
        for job in stored {
            let id = job.id.clone();
            match self.cache.load(job) {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {},
                Err(Error::DuplicateJob { .. }) => {},
                Err(e) => warn!(id = %id, error = %e, "failed to load job"),
            }
        }
        info!(total, loaded, "loaded jobs");

        self.shutdown.send_replace(false);
        let dispatch = tokio::spawn(
            Arc::clone(self).dispatch_loop(due_rx, self.shutdown.subscribe()),
        );
        let maintenance =
            tokio::spawn(Arc::clone(self).maintenance_loop(self.shutdown.subscribe()));
        self.tasks.lock().await.extend([dispatch, maintenance]);
        Ok(())
    }

    /// Disarm every timer, wait for scheduled runs in flight, stop the loops
    /// and close the job store.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        self.cache.clear();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "scheduler task failed");
            }
        }
        self.jobs.close().await?;
        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate, cache and persist a new job, then arm it.
    ///
    /// The job is saved before its timer starts, so the first run's save
    /// always lands after this one.
    pub async fn add(&self, create: JobCreate) -> Result<Job> {
        let job = Job::from_create(create, Utc::now())?;
        let entry = self.cache.insert(job)?;
        let job = entry.job();
        {
            let _persist_guard = entry.lock_persist().await;
            if let Err(e) = self.jobs.save(&job).await {
                warn!(id = %job.id, error = %e, "failed to persist new job, rolling back");
                let _ = self.cache.delete(&job.id);
                return Err(match e {
                    Error::Persistence { .. } => e,
                    other => Error::persistence(format!("saving job {}", job.id), other),
                });
            }
        }
        self.cache.arm_entry(&entry);
        info!(id = %job.id, name = %job.name, next_run_at = ?job.state.next_run_at, "job added");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.cache.get(id)
    }

    /// Cached jobs, soonest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs = self.cache.get_all();
        jobs.sort_by(|a, b| {
            a.state
                .next_run_at
                .cmp(&b.state.next_run_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    /// Remove a job from the cache and the store. Its runs are kept.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let entry = self.cache.delete(id)?;
        let _persist_guard = entry.lock_persist().await;
        match self.jobs.delete(id).await {
            Ok(()) | Err(Error::JobNotFound { .. }) => {},
            Err(e) => return Err(e),
        }
        info!(id, "job deleted");
        Ok(())
    }

    pub async fn enable(&self, id: &str) -> Result<Job> {
        let job = self.cache.enable(id)?;
        self.persist(&job).await?;
        Ok(job)
    }

    pub async fn disable(&self, id: &str) -> Result<Job> {
        let job = self.cache.disable(id)?;
        self.persist(&job).await?;
        Ok(job)
    }

    /// Run a job now and wait for its terminal run.
    ///
    /// Waits for any run already in progress to finish first.
    pub async fn trigger(&self, id: &str) -> Result<JobStat> {
        let entry = self
            .cache
            .entry(id)
            .ok_or_else(|| Error::job_not_found(id))?;
        self.coordinator
            .run(entry, Trigger::Manual)
            .await
            .ok_or_else(|| Error::job_not_found(id))
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<JobStat>> {
        self.cache.subscribe(id)
    }

    pub async fn runs(&self, job_id: &str) -> Result<Vec<JobStat>> {
        self.runs.get_all_runs(job_id).await
    }

    pub async fn run(&self, run_id: &str) -> Result<Option<JobStat>> {
        self.runs.get_run(run_id).await
    }

    pub async fn delete_runs(&self, job_id: &str) -> Result<()> {
        self.runs.delete_runs(job_id).await
    }

    pub async fn purge_expired_runs(&self) -> Result<u64> {
        let removed = self.runs.clear_expired_runs().await?;
        if removed > 0 {
            info!(removed, "purged expired runs");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats::from_jobs(&self.cache.get_all(), self.created_at)
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        let Some(entry) = self.cache.entry(&job.id) else {
            return Ok(());
        };
        let _persist_guard = entry.lock_persist().await;
        self.jobs.save(job).await
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut due_rx: mpsc::UnboundedReceiver<DueJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {},
                due = due_rx.recv() => {
                    let Some(due) = due else { break };
                    let Some(entry) = self.cache.entry(&due.job_id) else {
                        debug!(id = %due.job_id, "due job no longer cached");
                        continue;
                    };
                    let coordinator = Arc::clone(&self.coordinator);
                    in_flight.spawn(async move {
                        coordinator
                            .run(entry, Trigger::Scheduled(due.generation))
                            .await;
                    });
                },
            }
        }

        if !in_flight.is_empty() {
            info!(runs = in_flight.len(), "waiting for runs in flight");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "run task failed");
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.purge_expired_runs().await {
                        warn!(error = %e, "run maintenance failed");
                    }
                },
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            executor::{ExecutionOutput, LocalExecutor},
            schedule::Repeat,
            store_memory::InMemoryStore,
            store_sqlite::SqliteStore,
            types::{JobKind, RunStatus},
        },
        async_trait::async_trait,
        chrono::TimeDelta,
        tokio::time::timeout,
    };

    /// Runs local jobs through the real shell executor.
    struct ShellExecutor;

    #[async_trait]
    impl Executor for ShellExecutor {
        async fn execute(&self, job: &Job) -> Result<ExecutionOutput> {
            match &job.kind {
                JobKind::Local { command } => LocalExecutor.run(command).await,
                JobKind::Remote(_) => Err(Error::execution("remote disabled")),
            }
        }
    }

    /// Store whose job writes always fail.
    struct BrokenJobStore;

    #[async_trait]
    impl JobStore for BrokenJobStore {
        async fn get_all(&self) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }

        async fn get(&self, id: &str) -> Result<Job> {
            Err(Error::job_not_found(id))
        }

        async fn save(&self, _job: &Job) -> Result<()> {
            Err(Error::from(std::io::Error::other("disk full")))
        }

        async fn delete(&self, id: &str) -> Result<()> {
            Err(Error::job_not_found(id))
        }
    }

    /// Delays its first job save by 300ms.
    struct SlowFirstSave {
        inner: Arc<InMemoryStore>,
        delayed: AtomicBool,
    }

    #[async_trait]
    impl JobStore for SlowFirstSave {
        async fn get_all(&self) -> Result<Vec<Job>> {
            self.inner.get_all().await
        }

        async fn get(&self, id: &str) -> Result<Job> {
            self.inner.get(id).await
        }

        async fn save(&self, job: &Job) -> Result<()> {
            if !self.delayed.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.inner.save(job).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(store: &Arc<InMemoryStore>) -> Arc<Scheduler> {
        Scheduler::new(store.clone(), store.clone(), Arc::new(ShellExecutor), &config())
    }

    fn future_schedule(repeat: &str, interval: &str) -> String {
        let start = (Utc::now() + TimeDelta::days(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        format!("{repeat}/{start}/{interval}")
    }

    #[tokio::test]
    async fn test_add_persists_and_caches() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let job = svc
            .add(JobCreate::local("a", "true").with_schedule(future_schedule("R2", "P1D")))
            .await
            .unwrap();
        assert_eq!(svc.get(&job.id).unwrap().id, job.id);
        assert_eq!(
            store.get(&job.id).await.unwrap().state.remaining_repeats,
            Repeat::Times(2)
        );
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_input() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let err = svc
            .add(JobCreate::local("a", "true").with_schedule("R2/garbage/P1D"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedSchedule { .. }));
        assert!(svc.list().is_empty());
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_duplicate_id() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let create = JobCreate::local("a", "true")
            .with_id("same")
            .with_schedule(future_schedule("R", "PT1H"));
        svc.add(create.clone()).await.unwrap();
        assert!(matches!(
            svc.add(create).await.unwrap_err(),
            Error::DuplicateJob { .. }
        ));
    }

    #[tokio::test]
    async fn test_add_rolls_back_on_store_failure() {
        let runs = Arc::new(InMemoryStore::new());
        let svc = Scheduler::new(
            Arc::new(BrokenJobStore),
            runs,
            Arc::new(ShellExecutor),
            &config(),
        );
        let err = svc
            .add(JobCreate::local("a", "true").with_id("a"))
            .await
            .unwrap_err();
        assert!(err.is_persistence());
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(svc.get("a").is_err());
    }

    #[tokio::test]
    async fn test_one_shot_job_runs_and_retires() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        svc.start().await.unwrap();

        let job = svc
            .add(JobCreate::local("once", "echo done"))
            .await
            .unwrap();
        let mut sub = svc.subscribe(&job.id).unwrap();
        let run = timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output.as_deref(), Some("done"));

        assert!(svc.get(&job.id).is_err());
        assert!(store.get(&job.id).await.unwrap().state.finished);
        assert_eq!(svc.runs(&job.id).await.unwrap().len(), 1);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_runs_now_and_keeps_schedule() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let job = svc
            .add(JobCreate::local("a", "echo hi").with_schedule(future_schedule("R1", "P1D")))
            .await
            .unwrap();

        let run = svc.trigger(&job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        let after = svc.get(&job.id).unwrap();
        assert_eq!(after.state.next_run_at, job.state.next_run_at);
        assert_eq!(after.metadata.success_count, 1);
        assert_eq!(svc.run(&run.id).await.unwrap().unwrap().id, run.id);

        assert!(matches!(
            svc.trigger("missing").await.unwrap_err(),
            Error::JobNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_command_with_retries() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let job = svc
            .add(
                JobCreate::local("fails", "exit 1")
                    .with_retries(2)
                    .with_schedule(future_schedule("R", "PT1H")),
            )
            .await
            .unwrap();
        let run = svc.trigger(&job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.retries, 2);
        assert_eq!(svc.runs(&job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_runs() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let job = svc
            .add(JobCreate::local("a", "true").with_schedule(future_schedule("R", "PT1H")))
            .await
            .unwrap();
        svc.trigger(&job.id).await.unwrap();
        svc.delete(&job.id).await.unwrap();

        assert!(svc.get(&job.id).is_err());
        assert!(store.get(&job.id).await.is_err());
        assert_eq!(svc.runs(&job.id).await.unwrap().len(), 1);

        svc.delete_runs(&job.id).await.unwrap();
        assert!(svc.runs(&job.id).await.unwrap().is_empty());
        assert!(matches!(
            svc.delete(&job.id).await.unwrap_err(),
            Error::JobNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_enable_disable_persist() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        let job = svc
            .add(JobCreate::local("a", "true").with_schedule(future_schedule("R", "PT1H")))
            .await
            .unwrap();

        svc.disable(&job.id).await.unwrap();
        assert!(store.get(&job.id).await.unwrap().disabled);
        assert_eq!(svc.stats().disabled_jobs, 1);

        svc.enable(&job.id).await.unwrap();
        assert!(!store.get(&job.id).await.unwrap().disabled);
        assert_eq!(svc.stats().active_jobs, 1);
    }

    #[tokio::test]
    async fn test_start_loads_stored_jobs() {
        let store = Arc::new(InMemoryStore::new());
        {
            let svc = scheduler(&store);
            svc.add(
                JobCreate::local("kept", "true")
                    .with_id("kept")
                    .with_schedule(future_schedule("R", "PT1H")),
            )
            .await
            .unwrap();
        }
        let mut finished =
            Job::from_create(JobCreate::local("done", "true").with_id("done"), Utc::now())
                .unwrap();
        finished.state.finished = true;
        store.save(&finished).await.unwrap();

        let svc = scheduler(&store);
        svc.start().await.unwrap();
        assert!(svc.is_running());
        assert!(svc.get("kept").is_ok());
        assert!(svc.get("done").is_err());
        assert!(svc.start().await.is_err());

        svc.stop().await.unwrap();
        assert!(!svc.is_running());
        assert!(svc.list().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_stop_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", tmp.path().join("jobs.db").display());
        let store = Arc::new(SqliteStore::new(&url).await.unwrap());
        let svc = Scheduler::new(store.clone(), store, Arc::new(ShellExecutor), &config());

        svc.start().await.unwrap();
        svc.stop().await.unwrap();
        let err = svc.start().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        assert!(!svc.is_running());
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_run_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        svc.start().await.unwrap();

        let job = svc
            .add(JobCreate::local("slow", "sleep 0.3; echo late"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        svc.stop().await.unwrap();

        let runs = store.get_all_runs(&job.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].output.as_deref(), Some("late"));
        assert!(store.get(&job.id).await.unwrap().state.finished);
    }

    #[tokio::test]
    async fn test_slow_first_save_cannot_overwrite_finished_job() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = Arc::new(SlowFirstSave {
            inner: store.clone(),
            delayed: AtomicBool::new(false),
        });
        let svc = Scheduler::new(jobs, store.clone(), Arc::new(ShellExecutor), &config());
        svc.start().await.unwrap();

        let job = svc.add(JobCreate::local("once", "true")).await.unwrap();
        let stored = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(stored) = store.get(&job.id).await
                    && stored.state.finished
                {
                    break stored;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stored.metadata.success_count, 1);
        assert!(stored.metadata.last_attempted_run.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get(&job.id).await.unwrap().state.finished);
        assert_eq!(store.get_all_runs(&job.id).await.unwrap().len(), 1);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_runs() {
        let store = Arc::new(InMemoryStore::new().with_retention(TimeDelta::days(1)));
        let svc = scheduler(&store);
        let mut old = JobStat::start("j", Utc::now() - TimeDelta::days(2));
        old.finish(Utc::now() - TimeDelta::days(2), Ok(None));
        store.save_run(&old).await.unwrap();
        assert_eq!(svc.purge_expired_runs().await.unwrap(), 1);
        assert!(svc.run(&old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_by_next_run() {
        let store = Arc::new(InMemoryStore::new());
        let svc = scheduler(&store);
        for (id, days) in [("later", 3), ("sooner", 1)] {
            let start = (Utc::now() + TimeDelta::days(days))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            svc.add(
                JobCreate::local(id, "true")
                    .with_id(id)
                    .with_schedule(format!("R/{start}/P1D")),
            )
            .await
            .unwrap();
        }
        let ids: Vec<_> = svc.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, ["sooner", "later"]);
    }
}
