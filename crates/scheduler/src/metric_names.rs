//! Metric names recorded when the `metrics` feature is enabled.

/// Jobs currently held in the cache.
pub const JOBS_SCHEDULED: &str = "cadence_jobs_scheduled";
/// Runs started, one per firing regardless of retries.
pub const EXECUTIONS_TOTAL: &str = "cadence_executions_total";
/// Runs that ended in `Failed`.
pub const ERRORS_TOTAL: &str = "cadence_errors_total";
/// Retry attempts after a failed execution.
pub const RETRIES_TOTAL: &str = "cadence_retries_total";
/// Wall time of a run including retries, in seconds.
pub const EXECUTION_DURATION_SECONDS: &str = "cadence_execution_duration_seconds";
