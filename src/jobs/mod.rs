//! Background job system.
//!
//! A durable priority queue of jobs in SQLite, a polling processor that runs
//! them with bounded concurrency, and a cron scheduler that enqueues recurring
//! work. [`JobsSystem`] ties the three together.

mod cron_expr;
mod database;
mod defaults;
mod handler;
pub mod handlers;
mod models;
mod processor;
mod queue;
mod retry_policy;
mod schedule_store;
mod scheduler;
mod schema;
mod system;

pub use cron_expr::{validate as validate_cron_expression, CronExpr};
pub use database::JobsDatabase;
pub use defaults::default_schedules;
pub use handler::{handler_fn, FnHandler, JobContext, JobHandler};
pub use models::{
    CronSchedule, Job, JobFilter, JobPriority, JobStatus, JobType, JobUpdate, JsonMap,
    NewJob, NewSchedule, ScheduleUpdate, StatusCounts, DEFAULT_MAX_ATTEMPTS,
};
pub use processor::{JobProcessor, ProcessorConfig};
pub use queue::{default_success_result, JobQueue, SqliteJobQueue};
pub use retry_policy::RetryPolicy;
pub use schedule_store::ScheduleStore;
pub use scheduler::CronScheduler;
pub use system::{JobsStatus, JobsSystem};
