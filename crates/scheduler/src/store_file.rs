//! JSON file-backed store with atomic writes.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    chrono::TimeDelta,
    tokio::{fs, io::AsyncWriteExt, sync::Mutex},
};

use crate::{
    Context, Error, Result,
    store::{JobStore, RunStore, is_expired, retention_cutoff},
    types::{Job, JobStat},
};

/// File-backed store. Jobs in a single JSON file, runs as JSONL per job.
pub struct FileStore {
    jobs_path: PathBuf,
    runs_dir: PathBuf,
    retention: Option<TimeDelta>,
    /// Serialises read-modify-write cycles on `jobs.json`.
    jobs_lock: Mutex<()>,
    runs_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(jobs_path: PathBuf, runs_dir: PathBuf) -> Self {
        Self {
            jobs_path,
            runs_dir,
            retention: None,
            jobs_lock: Mutex::new(()),
            runs_lock: Mutex::new(()),
        }
    }

    /// `<dir>/jobs.json` and `<dir>/runs/`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("jobs.json"), dir.join("runs"))
    }

    #[must_use]
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = Some(retention);
        self
    }

    async fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.jobs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir_all(&self.runs_dir).await?;
        Ok(())
    }

    async fn read_jobs(&self) -> Result<Vec<Job>> {
        if !fs::try_exists(&self.jobs_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.jobs_path).await?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", self.jobs_path.display()))
    }

    /// Atomic write: write to temp, rename over target, keep `.bak`.
    async fn atomic_write_jobs(&self, jobs: &[Job]) -> Result<()> {
        self.ensure_dirs().await?;
        let json = serde_json::to_string_pretty(jobs)?;
        let tmp = self.jobs_path.with_extension("json.tmp");

        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(&self.jobs_path).await.unwrap_or(false) {
            let bak = self.jobs_path.with_extension("json.bak");
            fs::copy(&self.jobs_path, &bak).await?;
        }

        fs::rename(&tmp, &self.jobs_path).await?;
        Ok(())
    }

    /// Percent-encoded, so distinct ids never share a file.
    fn runs_path(&self, job_id: &str) -> PathBuf {
        self.runs_dir
            .join(format!("{}.jsonl", urlencoding::encode(job_id)))
    }

    async fn read_runs(path: &Path) -> Result<Vec<JobStat>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path).await?;
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(run) => Some(run),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt run record");
                    None
                },
            })
            .collect())
    }

    async fn write_runs(path: &Path, runs: &[JobStat]) -> Result<()> {
        if runs.is_empty() {
            if fs::try_exists(path).await.unwrap_or(false) {
                fs::remove_file(path).await?;
            }
            return Ok(());
        }
        let mut out = String::new();
        for run in runs {
            out.push_str(&serde_json::to_string(run)?);
            out.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, out.as_bytes()).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn run_files(&self) -> Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.runs_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn get_all(&self) -> Result<Vec<Job>> {
        let _guard = self.jobs_lock.lock().await;
        self.read_jobs().await
    }

    async fn get(&self, id: &str) -> Result<Job> {
        let _guard = self.jobs_lock.lock().await;
        self.read_jobs()
            .await?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::job_not_found(id))
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let _guard = self.jobs_lock.lock().await;
        let mut jobs = self.read_jobs().await?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.atomic_write_jobs(&jobs).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.jobs_lock.lock().await;
        let mut jobs = self.read_jobs().await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(Error::job_not_found(id));
        }
        self.atomic_write_jobs(&jobs).await
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn save_run(&self, run: &JobStat) -> Result<()> {
        let _guard = self.runs_lock.lock().await;
        self.ensure_dirs().await?;
        let mut line = serde_json::to_string(run)?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.runs_path(&run.job_id))
            .await?
            .write_all(line.as_bytes())
            .await?;
        Ok(())
    }

    async fn update_run(&self, run: &JobStat) -> Result<()> {
        let _guard = self.runs_lock.lock().await;
        self.ensure_dirs().await?;
        let path = self.runs_path(&run.job_id);
        let mut runs = Self::read_runs(&path).await?;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Self::write_runs(&path, &runs).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<JobStat>> {
        let _guard = self.runs_lock.lock().await;
        for path in self.run_files().await? {
            if let Some(run) = Self::read_runs(&path)
                .await?
                .into_iter()
                .find(|r| r.id == run_id)
            {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    async fn get_all_runs(&self, job_id: &str) -> Result<Vec<JobStat>> {
        let _guard = self.runs_lock.lock().await;
        let mut runs = Self::read_runs(&self.runs_path(job_id)).await?;
        runs.retain(|r| r.job_id == job_id);
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn delete_runs(&self, job_id: &str) -> Result<()> {
        let _guard = self.runs_lock.lock().await;
        let path = self.runs_path(job_id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn clear_expired_runs(&self) -> Result<u64> {
        let Some(cutoff) = retention_cutoff(self.retention) else {
            return Ok(0);
        };
        let _guard = self.runs_lock.lock().await;
        let mut removed = 0;
        for path in self.run_files().await? {
            let mut runs = Self::read_runs(&path).await?;
            let before = runs.len();
            runs.retain(|r| !is_expired(r, cutoff));
            if runs.len() != before {
                removed += (before - runs.len()) as u64;
                Self::write_runs(&path, &runs).await?;
            }
        }
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

    fn make_store(dir: &Path) -> FileStore {
        FileStore::in_dir(dir)
    }

    fn make_job(id: &str) -> Job {
        Job::from_create(JobCreate::local(format!("job-{id}"), "true").with_id(id), Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store.save(&make_job("1")).await.unwrap();
        store.save(&make_job("2")).await.unwrap();

        let jobs = store.get_all().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(store.get("1").await.unwrap().name, "job-1");
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store.save(&make_job("1")).await.unwrap();
        store.delete("1").await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(matches!(
            store.delete("1").await.unwrap_err(),
            Error::JobNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_file_store_backup_created() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store.save(&make_job("1")).await.unwrap();
        store.save(&make_job("2")).await.unwrap();

        assert!(tmp.path().join("jobs.json.bak").exists());
        assert!(!tmp.path().join("jobs.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(store.get_all_runs("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_save_replaces_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store.save(&make_job("1")).await.unwrap();
        let mut job = make_job("1");
        job.name = "replaced".into();
        store.save(&job).await.unwrap();

        let jobs = store.get_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "replaced");
    }

    #[tokio::test]
    async fn test_file_store_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        let mut run = JobStat::start("j1", Utc::now());
        store.save_run(&run).await.unwrap();
        store
            .save_run(&JobStat::start("j1", Utc::now()))
            .await
            .unwrap();
        run.finish(Utc::now(), Err(Error::execution("exit status 2")));
        store.update_run(&run).await.unwrap();

        let runs = store.get_all_runs("j1").await.unwrap();
        assert_eq!(runs.len(), 2);
        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
        assert!(store.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_unsafe_job_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store
            .save_run(&JobStat::start("../escape", Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.get_all_runs("../escape").await.unwrap().len(), 1);
        assert!(tmp.path().join("runs").join("..%2Fescape.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_store_similar_ids_keep_separate_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store
            .save_run(&JobStat::start("team/a", Utc::now()))
            .await
            .unwrap();
        store
            .save_run(&JobStat::start("team_a", Utc::now()))
            .await
            .unwrap();

        store.delete_runs("team_a").await.unwrap();
        assert!(store.get_all_runs("team_a").await.unwrap().is_empty());
        assert_eq!(store.get_all_runs("team/a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_delete_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        store.save(&make_job("j1")).await.unwrap();
        store.save_run(&JobStat::start("j1", Utc::now())).await.unwrap();
        store.delete("j1").await.unwrap();
        assert_eq!(store.get_all_runs("j1").await.unwrap().len(), 1);

        store.delete_runs("j1").await.unwrap();
        assert!(store.get_all_runs("j1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).with_retention(TimeDelta::hours(1));
        let now = Utc::now();

        let mut old = JobStat::start("j1", now - TimeDelta::hours(5));
        old.finish(now - TimeDelta::hours(5), Ok(None));
        let mut fresh = JobStat::start("j2", now);
        fresh.finish(now, Ok(None));
        store.save_run(&old).await.unwrap();
        store.save_run(&fresh).await.unwrap();

        assert_eq!(store.clear_expired_runs().await.unwrap(), 1);
        assert!(store.get_all_runs("j1").await.unwrap().is_empty());
        assert_eq!(store.get_all_runs("j2").await.unwrap().len(), 1);
    }
}
