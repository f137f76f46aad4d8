//! Core data types for jobs and their runs.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{
    Error, Result,
    schedule::{Repeat, ScheduleSpec},
};

/// Parameters for a job executed as an HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProperties {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Status codes counted as success. Empty means any 2xx.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_response_codes: Vec<u16>,
}

fn default_method() -> String {
    "GET".into()
}

impl RemoteProperties {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            timeout_secs: None,
            expected_response_codes: Vec::new(),
        }
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobKind {
    /// Shell command line, run with `sh -c`.
    Local { command: String },
    /// HTTP call.
    Remote(RemoteProperties),
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Scheduling state derived from the schedule specification.
///
/// Only the job cache writes this, through the recurrence functions in
/// [`crate::schedule`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Grid instant the next occurrence is computed from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_at: Option<DateTime<Utc>>,
    pub remaining_repeats: Repeat,
    /// Repeats are used up; the job no longer belongs in the cache.
    #[serde(default)]
    pub finished: bool,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            next_run_at: None,
            anchor_at: None,
            remaining_repeats: Repeat::Times(0),
            finished: false,
        }
    }
}

/// Counters and timestamps updated after every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub success_count: u64,
    pub error_count: u64,
    pub number_of_finished_runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_run: Option<DateTime<Utc>>,
}

impl JobMetadata {
    /// Fold a finished run into the counters.
    pub fn record(&mut self, run: &JobStat) {
        let at = run.finished_at.unwrap_or(run.started_at);
        self.last_attempted_run = Some(run.started_at);
        self.number_of_finished_runs += 1;
        match run.status {
            RunStatus::Succeeded => {
                self.success_count += 1;
                self.last_success = Some(at);
            },
            RunStatus::Failed => {
                self.error_count += 1;
                self.last_error = Some(at);
            },
            RunStatus::Running => {},
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub kind: JobKind,
    /// `R<n>/<start>/<interval>`; `None` runs once, immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Extra attempts after a failed one.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a job from creation input. Validates everything that can be
    /// checked without scheduling it.
    pub fn from_create(create: JobCreate, now: DateTime<Utc>) -> Result<Self> {
        let job = Self {
            id: create
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: create.name,
            owner: create.owner,
            kind: create.kind,
            schedule: create.schedule.filter(|s| !s.trim().is_empty()),
            retries: create.retries,
            disabled: create.disabled,
            state: JobState::default(),
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
        };
        job.validate()?;
        Ok(job)
    }

    /// Parse the schedule specification, if any.
    pub fn schedule_spec(&self) -> Result<Option<ScheduleSpec>> {
        self.schedule.as_deref().map(str::parse).transpose()
    }

    /// Check the invariants a job must satisfy before it is scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_job("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::invalid_job("name must not be empty"));
        }
        match &self.kind {
            JobKind::Local { command } if command.trim().is_empty() => {
                return Err(Error::invalid_job("command must not be empty"));
            },
            JobKind::Remote(props) => {
                let url = url::Url::parse(&props.url)
                    .map_err(|e| Error::invalid_job(format!("invalid url '{}': {e}", props.url)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::invalid_job(format!(
                        "unsupported url scheme: {}",
                        url.scheme()
                    )));
                }
                if reqwest::Method::from_bytes(props.method.to_ascii_uppercase().as_bytes())
                    .is_err()
                {
                    return Err(Error::invalid_job(format!(
                        "invalid http method: {}",
                        props.method
                    )));
                }
            },
            JobKind::Local { .. } => {},
        }
        self.schedule_spec()?;
        Ok(())
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.kind, JobKind::Remote(_))
    }
}

/// Record of one run of a job, covering all of its retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStat {
    pub id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Retry attempts consumed (attempts minus one).
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl JobStat {
    /// A new run in the `Running` state.
    #[must_use]
    pub fn start(job_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            retries: 0,
            error: None,
            output: None,
            duration_ms: None,
        }
    }

    /// Move to a terminal state. The end time is never earlier than the
    /// start time.
    pub fn finish(&mut self, at: DateTime<Utc>, outcome: Result<Option<String>>) {
        let at = at.max(self.started_at);
        self.finished_at = Some(at);
        self.duration_ms = Some(u64::try_from((at - self.started_at).num_milliseconds()).unwrap_or(0));
        match outcome {
            Ok(output) => {
                self.status = RunStatus::Succeeded;
                self.output = output;
                self.error = None;
            },
            Err(e) => {
                self.status = RunStatus::Failed;
                self.error = Some(e.to_string());
            },
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Input for creating a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreate {
    /// Caller-chosen id. A UUID is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub disabled: bool,
}

impl JobCreate {
    /// A local command job with no schedule.
    #[must_use]
    pub fn local(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            owner: String::new(),
            kind: JobKind::Local {
                command: command.into(),
            },
            schedule: None,
            retries: 0,
            disabled: false,
        }
    }

    /// A remote job with no schedule.
    #[must_use]
    pub fn remote(name: impl Into<String>, props: RemoteProperties) -> Self {
        Self {
            id: None,
            name: name.into(),
            owner: String::new(),
            kind: JobKind::Remote(props),
            schedule: None,
            retries: 0,
            disabled: false,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Aggregate view over the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub jobs: usize,
    pub active_jobs: usize,
    pub disabled_jobs: usize,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SchedulerStats {
    /// Summarise a snapshot of jobs.
    #[must_use]
    pub fn from_jobs(jobs: &[Job], created_at: DateTime<Utc>) -> Self {
        let mut stats = Self {
            jobs: jobs.len(),
            created_at,
            ..Self::default()
        };
        for job in jobs {
            if job.disabled {
                stats.disabled_jobs += 1;
            } else {
                stats.active_jobs += 1;
                stats.next_run_at = match (stats.next_run_at, job.state.next_run_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            stats.success_count += job.metadata.success_count;
            stats.error_count += job.metadata.error_count;
            stats.last_attempted_run = stats
                .last_attempted_run
                .max(job.metadata.last_attempted_run);
        }
        stats
    }
}
