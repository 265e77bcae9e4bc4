use crate::jobs::JobType;
use thiserror::Error;

/// Errors surfaced by the job queue, processor and scheduler.
///
/// Store failures arrive as `anyhow::Error` and are wrapped in `Store`;
/// the other variants are conditions callers are expected to match on.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid priority {0}, must be between 1 and 10")]
    InvalidPriority(i64),

    #[error("No handler registered for job type: {0}")]
    NoHandler(JobType),

    #[error("Handler error: {0}")]
    Handler(anyhow::Error),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type JobsResult<T> = std::result::Result<T, JobsError>;
