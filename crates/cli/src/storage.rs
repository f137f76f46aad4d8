//! Builds the configured job and run stores.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    cadence_config::{CadenceConfig, StorageBackend},
    cadence_scheduler::{
        store::{JobStore, RunStore},
        store_file::FileStore,
        store_memory::InMemoryStore,
        store_sqlite::SqliteStore,
    },
    chrono::TimeDelta,
    tracing::debug,
};

pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub runs: Arc<dyn RunStore>,
}

fn retention(config: &CadenceConfig) -> Option<TimeDelta> {
    config
        .runs
        .retention_days
        .and_then(|days| i64::try_from(days).ok())
        .and_then(TimeDelta::try_days)
}

/// SQLite connection string for the configured storage.
pub fn sqlite_url(config: &CadenceConfig) -> String {
    if let Some(url) = &config.storage.database_url {
        return url.clone();
    }
    let path = config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| cadence_config::data_dir().join("cadence.db"));
    format!("sqlite://{}?mode=rwc", path.display())
}

fn file_dir(config: &CadenceConfig) -> PathBuf {
    config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| cadence_config::data_dir().join("jobs"))
}

pub async fn open(config: &CadenceConfig) -> anyhow::Result<Stores> {
    let retention = retention(config);
    match config.storage.backend {
        StorageBackend::Memory => {
            let mut store = InMemoryStore::new();
            if let Some(r) = retention {
                store = store.with_retention(r);
            }
            let store = Arc::new(store);
            Ok(Stores {
                jobs: store.clone(),
                runs: store,
            })
        },
        StorageBackend::Sqlite => {
            if config.storage.database_url.is_none() {
                let parent = config
                    .storage
                    .path
                    .as_ref()
                    .and_then(|p| p.parent().map(PathBuf::from))
                    .unwrap_or_else(cadence_config::data_dir);
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(&parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
            }
            let url = sqlite_url(config);
            debug!(url = %url, "opening sqlite store");
            let mut store = SqliteStore::new(&url)
                .await
                .with_context(|| format!("failed to open {url}"))?;
            if let Some(r) = retention {
                store = store.with_retention(r);
            }
            let store = Arc::new(store);
            Ok(Stores {
                jobs: store.clone(),
                runs: store,
            })
        },
        StorageBackend::File => {
            let dir = file_dir(config);
            debug!(dir = %dir.display(), "opening file store");
            let mut store = FileStore::in_dir(&dir);
            if let Some(r) = retention {
                store = store.with_retention(r);
            }
            let store = Arc::new(store);
            Ok(Stores {
                jobs: store.clone(),
                runs: store,
            })
        },
    }
}
