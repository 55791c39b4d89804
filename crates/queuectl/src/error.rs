//! Error types for the job store and settings.

use crate::jobs::model::JobState;

/// Errors surfaced to callers of the store and settings repos.
///
/// Execution failures never appear here: they are converted into state
/// transitions inside the worker loop (see [`crate::jobs::executor::ExecError`]).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job id already exists: {0}")]
    DuplicateId(String),

    #[error("job {id} cannot move from {from} to {to}")]
    TransitionConflict {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("job {id} is not leased by {worker_id}")]
    LeaseNotHeld { id: String, worker_id: String },

    #[error("invalid value for setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    /// True for errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, QueueError::Database(_) | QueueError::Migrate(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
