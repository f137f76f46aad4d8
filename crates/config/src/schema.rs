/// Config schema types (scheduler, storage, run retention, remote calls).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub runs: RunsConfig,
    pub remote: RemoteConfig,
}

/// Retry and maintenance knobs for the scheduler core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay before the first retry of a failed run. Doubles on every
    /// further attempt. Defaults to 1000.
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay. Defaults to 60000.
    pub retry_backoff_max_ms: u64,
    /// How often expired runs are purged from the run store. Defaults to 3600.
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            maintenance_interval_secs: 3_600,
        }
    }
}

/// Which persistence backend holds jobs and run history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, process-local. Useful for tests and dry runs.
    Memory,
    /// SQLite database via sqlx.
    #[default]
    Sqlite,
    /// JSON files on disk.
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "file" => Ok(Self::File),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the file backend, or the database file for SQLite.
    /// Defaults to the platform data dir.
    pub path: Option<PathBuf>,
    /// Full sqlx connection string. Takes precedence over `path` for SQLite.
    pub database_url: Option<String>,
}

/// Run history retention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Finished runs older than this are purged. `None` keeps everything.
    pub retention_days: Option<u64>,
}

/// Defaults for remote (HTTP) jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Request timeout when the job does not set one. Defaults to 30.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("cadence/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
