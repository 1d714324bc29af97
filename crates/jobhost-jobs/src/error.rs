use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the job engine.
#[derive(Debug, Error)]
pub enum JobError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Log file or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job arguments could not be encoded for persistence.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job was marked stopped (or finished) by someone else; the work
    /// function must unwind at this safe point.
    #[error("Job {task_id} cancelled")]
    Cancelled { task_id: String },

    /// The persisted row for a job the engine is tracking has disappeared.
    /// Fatal for the job that hits it, never for the worker running it.
    #[error("Job record missing: {task_id}")]
    RecordMissing { task_id: String },

    /// Illegal lifecycle transition, e.g. restarting a finished job.
    #[error("Job {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A job kind received arguments it cannot work with.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Failure raised by a job's own logic.
    #[error("Work failed: {0}")]
    Work(String),
}

impl JobError {
    /// True for the errors that end a run without marking it done.
    pub fn is_fatal_to_job(&self) -> bool {
        matches!(
            self,
            JobError::Cancelled { .. } | JobError::RecordMissing { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
