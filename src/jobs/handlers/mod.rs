//! Handlers shipped with the jobs system.
//!
//! Channel sync, news fetch and the other content job types are provided by
//! the embedding application and registered through `JobsSystem::register_handler`.

mod job_retention;

pub use job_retention::JobRetentionHandler;

use super::models::JobType;
use super::processor::JobProcessor;
use std::sync::Arc;

pub fn register_builtin_handlers(processor: &JobProcessor, job_retention_days: u32) {
    processor.register_handler(
        JobType::CacheCleanup,
        Arc::new(JobRetentionHandler::new(job_retention_days)),
    );
}
