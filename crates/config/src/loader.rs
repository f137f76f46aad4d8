use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CadenceConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "cadence.toml",
    "cadence.yaml",
    "cadence.yml",
    "cadence.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CadenceConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./cadence.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/cadence/cadence.{toml,yaml,yml,json}` (user-global)
///
/// Returns `CadenceConfig::default()` if no config file is found.
pub fn discover_and_load() -> CadenceConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    CadenceConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/cadence/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cadence").map(|d| d.config_dir().to_path_buf())
}

/// Returns the platform data directory used for the default job database.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "cadence")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cadence"))
}

/// Apply `CADENCE_*` environment overrides on top of a loaded config.
///
/// Recognised: `CADENCE_STORAGE_BACKEND`, `CADENCE_STORAGE_PATH`,
/// `CADENCE_DATABASE_URL`, `CADENCE_RUN_RETENTION_DAYS`.
pub fn apply_env_overrides(config: CadenceConfig) -> CadenceConfig {
    apply_env_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides_with(
    mut config: CadenceConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> CadenceConfig {
    if let Some(raw) = lookup("CADENCE_STORAGE_BACKEND") {
        match raw.parse() {
            Ok(backend) => config.storage.backend = backend,
            Err(e) => warn!(error = %e, "ignoring CADENCE_STORAGE_BACKEND"),
        }
    }
    if let Some(path) = lookup("CADENCE_STORAGE_PATH") {
        config.storage.path = Some(PathBuf::from(path));
    }
    if let Some(url) = lookup("CADENCE_DATABASE_URL") {
        config.storage.database_url = Some(url);
    }
    if let Some(raw) = lookup("CADENCE_RUN_RETENTION_DAYS") {
        match raw.trim().parse::<u64>() {
            Ok(days) => config.runs.retention_days = Some(days),
            Err(e) => warn!(error = %e, "ignoring CADENCE_RUN_RETENTION_DAYS"),
        }
    }
    config
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CadenceConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
