//! Configuration validation.
//!
//! Checks a TOML document for syntax errors and unknown keys, then checks
//! the parsed [`CadenceConfig`] for values the scheduler cannot work with.

use std::{collections::HashMap, path::Path};

use crate::schema::{CadenceConfig, StorageBackend};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "value"
    pub category: &'static str,
    /// Dotted path, e.g. "scheduler.retry_backoff_ms"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, category: &'static str, path: &str, message: String) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.to_string(),
            message,
        });
    }
}

/// Known keys per section, mirroring `schema.rs`.
fn known_sections() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        (
            "scheduler",
            &[
                "retry_backoff_ms",
                "retry_backoff_max_ms",
                "maintenance_interval_secs",
            ][..],
        ),
        ("storage", &["backend", "path", "database_url"][..]),
        ("runs", &["retention_days"][..]),
        ("remote", &["timeout_secs", "user_agent"][..]),
    ])
}

/// Validate a TOML file on disk.
pub fn validate_file(path: &Path) -> ValidationResult {
    match std::fs::read_to_string(path) {
        Ok(content) => validate_toml_str(&content),
        Err(e) => {
            let mut result = ValidationResult::default();
            result.push(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read {}: {e}", path.display()),
            );
            result
        },
    }
}

/// Validate a TOML string: syntax, unknown keys, then semantic checks.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut result = ValidationResult::default();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            result.push(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            );
            return result;
        },
    };

    let sections = known_sections();
    if let Some(table) = value.as_table() {
        for (section, body) in table {
            let Some(keys) = sections.get(section.as_str()) else {
                result.push(
                    Severity::Warning,
                    "unknown-field",
                    section,
                    format!("unknown section `{section}`"),
                );
                continue;
            };
            let Some(body) = body.as_table() else {
                continue;
            };
            for key in body.keys() {
                if !keys.contains(&key.as_str()) {
                    result.push(
                        Severity::Warning,
                        "unknown-field",
                        &format!("{section}.{key}"),
                        format!("unknown key `{key}` in [{section}]"),
                    );
                }
            }
        }
    }

    match toml::from_str::<CadenceConfig>(toml_str) {
        Ok(config) => result.diagnostics.extend(validate(&config).diagnostics),
        Err(e) => result.push(Severity::Error, "value", "", format!("invalid config: {e}")),
    }
    result
}

/// Semantic checks on an already-parsed config.
#[must_use]
pub fn validate(config: &CadenceConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let sched = &config.scheduler;

    if sched.retry_backoff_ms == 0 {
        result.push(
            Severity::Warning,
            "value",
            "scheduler.retry_backoff_ms",
            "a zero backoff is raised to 1ms to avoid a tight retry loop".into(),
        );
    }
    if sched.retry_backoff_max_ms < sched.retry_backoff_ms {
        result.push(
            Severity::Error,
            "value",
            "scheduler.retry_backoff_max_ms",
            format!(
                "max backoff ({}ms) is below the initial backoff ({}ms)",
                sched.retry_backoff_max_ms, sched.retry_backoff_ms
            ),
        );
    }
    if sched.maintenance_interval_secs == 0 {
        result.push(
            Severity::Error,
            "value",
            "scheduler.maintenance_interval_secs",
            "must be greater than zero".into(),
        );
    }
    if config.remote.timeout_secs == 0 {
        result.push(
            Severity::Error,
            "value",
            "remote.timeout_secs",
            "must be greater than zero".into(),
        );
    }
    if config.runs.retention_days == Some(0) {
        result.push(
            Severity::Warning,
            "value",
            "runs.retention_days",
            "0 purges every finished run on each maintenance pass".into(),
        );
    }
    if config.storage.backend == StorageBackend::Memory {
        result.push(
            Severity::Info,
            "value",
            "storage.backend",
            "memory backend: jobs and runs are lost on restart".into(),
        );
    }
    if config.storage.backend != StorageBackend::Sqlite && config.storage.database_url.is_some() {
        result.push(
            Severity::Warning,
            "value",
            "storage.database_url",
            "ignored unless storage.backend = \"sqlite\"".into(),
        );
    }
    result
}
