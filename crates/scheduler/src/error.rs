use {cadence_common::FromMessage, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed schedule '{schedule}': {reason}")]
    MalformedSchedule { schedule: String, reason: String },

    #[error("job already exists: {job_id}")]
    DuplicateJob { job_id: String },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("invalid job: {message}")]
    InvalidJob { message: String },

    #[error("execution failed: {message}")]
    Execution { message: String },

    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn malformed_schedule(schedule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedSchedule {
            schedule: schedule.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn duplicate_job(job_id: impl Into<String>) -> Self {
        Self::DuplicateJob {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn invalid_job(message: impl Into<String>) -> Self {
        Self::InvalidJob {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn persistence(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error came from the storage layer.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. }
                | Self::Io(_)
                | Self::Json(_)
                | Self::Sqlx(_)
                | Self::Migrate(_)
        )
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

cadence_common::impl_context!();
