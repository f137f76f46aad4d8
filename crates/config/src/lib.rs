//! Configuration loading, validation, and env substitution.
//!
//! Config files: `cadence.toml`, `cadence.yaml`, or `cadence.json`
//! Searched in `./` then `~/.config/cadence/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        CadenceConfig, RemoteConfig, RunsConfig, SchedulerConfig, StorageBackend, StorageConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
