//! In-memory store, used by tests and the `memory` backend.

use std::{collections::HashMap, sync::Mutex};

use {async_trait::async_trait, chrono::TimeDelta};

use crate::{
    Error, Result,
    store::{JobStore, RunStore, is_expired, retention_cutoff},
    types::{Job, JobStat},
};

/// In-memory store backed by `HashMap`. Nothing survives a restart.
pub struct InMemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
    /// Runs per job id, in insertion order.
    runs: Mutex<HashMap<String, Vec<JobStat>>>,
    retention: Option<TimeDelta>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            retention: None,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = Some(retention);
        self
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_all(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Job> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).cloned().ok_or_else(|| Error::job_not_found(id))
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.remove(id).is_none() {
            return Err(Error::job_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn save_run(&self, run: &JobStat) -> Result<()> {
        self.update_run(run).await
    }

    async fn update_run(&self, run: &JobStat) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let records = runs.entry(run.job_id.clone()).or_default();
        match records.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => records.push(run.clone()),
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<JobStat>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runs.values().flatten().find(|r| r.id == run_id).cloned())
    }

    async fn get_all_runs(&self, job_id: &str) -> Result<Vec<JobStat>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = runs.get(job_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn delete_runs(&self, job_id: &str) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.remove(job_id);
        Ok(())
    }

    async fn clear_expired_runs(&self) -> Result<u64> {
        let Some(cutoff) = retention_cutoff(self.retention) else {
            return Ok(0);
        };
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for records in runs.values_mut() {
            let before = records.len();
            records.retain(|r| !is_expired(r, cutoff));
            removed += (before - records.len()) as u64;
        }
        runs.retain(|_, records| !records.is_empty());
        Ok(removed)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{JobCreate, RunStatus},
        chrono::Utc,
    };

    fn make_job(id: &str) -> Job {
        Job::from_create(JobCreate::local(format!("job-{id}"), "true").with_id(id), Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_jobs() {
        let store = InMemoryStore::new();
        store.save(&make_job("1")).await.unwrap();
        store.save(&make_job("2")).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 2);

        let mut job = make_job("1");
        job.name = "renamed".into();
        store.save(&job).await.unwrap();
        assert_eq!(store.get("1").await.unwrap().name, "renamed");

        store.delete("1").await.unwrap();
        assert!(matches!(
            store.get("1").await.unwrap_err(),
            Error::JobNotFound { .. }
        ));
        assert!(store.delete("1").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_runs_update_in_place() {
        let store = InMemoryStore::new();
        let mut run = JobStat::start("j1", Utc::now());
        store.save_run(&run).await.unwrap();
        run.finish(Utc::now(), Ok(Some("done".into())));
        store.update_run(&run).await.unwrap();

        let runs = store.get_all_runs("j1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(store.get_run(&run.id).await.unwrap(), Some(run));
        assert!(store.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_runs_oldest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for offset in [3, 1, 2] {
            let run = JobStat::start("j1", now - TimeDelta::minutes(offset));
            store.save_run(&run).await.unwrap();
        }
        let runs = store.get_all_runs("j1").await.unwrap();
        assert!(runs.windows(2).all(|w| w[0].started_at <= w[1].started_at));
    }

    #[tokio::test]
    async fn test_memory_delete_runs() {
        let store = InMemoryStore::new();
        store.save_run(&JobStat::start("j1", Utc::now())).await.unwrap();
        store.save_run(&JobStat::start("j2", Utc::now())).await.unwrap();
        store.delete_runs("j1").await.unwrap();
        assert!(store.get_all_runs("j1").await.unwrap().is_empty());
        assert_eq!(store.get_all_runs("j2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_retention() {
        let store = InMemoryStore::new().with_retention(TimeDelta::days(1));
        let now = Utc::now();

        let mut old = JobStat::start("j1", now - TimeDelta::days(3));
        old.finish(now - TimeDelta::days(3), Ok(None));
        let mut recent = JobStat::start("j1", now);
        recent.finish(now, Ok(None));
        let running = JobStat::start("j1", now - TimeDelta::days(5));
        for run in [&old, &recent, &running] {
            store.save_run(run).await.unwrap();
        }

        assert_eq!(store.clear_expired_runs().await.unwrap(), 1);
        let ids: Vec<_> = store
            .get_all_runs("j1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert!(!ids.contains(&old.id));
        assert!(ids.contains(&recent.id));
        assert!(ids.contains(&running.id));
    }

    #[tokio::test]
    async fn test_memory_no_retention_keeps_everything() {
        let store = InMemoryStore::new();
        let mut run = JobStat::start("j1", Utc::now() - TimeDelta::days(400));
        run.finish(Utc::now() - TimeDelta::days(400), Ok(None));
        store.save_run(&run).await.unwrap();
        assert_eq!(store.clear_expired_runs().await.unwrap(), 0);
        assert_eq!(store.get_all_runs("j1").await.unwrap().len(), 1);
    }
}
