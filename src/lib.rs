//! Pezzottify background jobs
//!
//! Durable SQLite job queue, bounded-concurrency processor and cron scheduler.
//! The library is used by the `jobs-server` binary and by embedding services
//! that register their own job handlers.

pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use error::{JobsError, JobsResult};
pub use jobs::{
    handler_fn, Job, JobHandler, JobPriority, JobQueue, JobStatus, JobType, JobsDatabase,
    JobsSystem, NewJob, SqliteJobQueue,
};
