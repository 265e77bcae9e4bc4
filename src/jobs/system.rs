//! Wiring of queue, processor and scheduler into one unit with a single
//! start/stop lifecycle.

use super::database::JobsDatabase;
use super::handler::JobHandler;
use super::handlers::register_builtin_handlers;
use super::models::{JobType, StatusCounts};
use super::processor::{JobProcessor, ProcessorConfig};
use super::queue::{JobQueue, SqliteJobQueue};
use super::retry_policy::RetryPolicy;
use super::schedule_store::ScheduleStore;
use super::scheduler::CronScheduler;
use crate::config::JobsSettings;
use crate::error::JobsResult;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Snapshot of the jobs subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct JobsStatus {
    pub enabled: bool,
    pub initialized: bool,
    pub processor_running: bool,
    pub scheduler_initialized: bool,
    pub active_jobs: usize,
    pub active_schedules: usize,
    pub registered_handlers: Vec<JobType>,
    pub counts: StatusCounts,
}

pub struct JobsSystem {
    settings: JobsSettings,
    queue: Arc<dyn JobQueue>,
    processor: JobProcessor,
    scheduler: CronScheduler,
    initialized: AtomicBool,
}

impl JobsSystem {
    pub fn new(db: JobsDatabase, settings: JobsSettings) -> Self {
        let mut retry_policy = RetryPolicy::default();
        if let Some(cap) = settings.max_backoff_secs {
            retry_policy = retry_policy.with_max_backoff_secs(cap);
        }
        let queue: Arc<dyn JobQueue> =
            Arc::new(SqliteJobQueue::new(db.clone()).with_retry_policy(retry_policy));

        let processor = JobProcessor::new(
            queue.clone(),
            ProcessorConfig {
                max_concurrency: settings.concurrency,
                poll_interval: settings.poll_interval,
            },
        );
        let scheduler = CronScheduler::new(ScheduleStore::new(db), queue.clone());

        Self {
            settings,
            queue,
            processor,
            scheduler,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Register an application handler. Takes precedence over a built-in
    /// handler for the same type.
    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.processor.register_handler(job_type, handler);
    }

    /// Start scheduling and processing.
    ///
    /// When the subsystem is disabled nothing is started and the returned
    /// status says so. A scheduler that fails to come up is logged and the
    /// processor is started anyway. Must be called from within a Tokio runtime.
    pub fn initialize(&self) -> JobsResult<JobsStatus> {
        if !self.settings.enabled {
            info!("Background jobs are disabled");
            return self.status();
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return self.status();
        }

        info!(
            "Initializing background jobs (concurrency {}, poll interval {:?})",
            self.settings.concurrency, self.settings.poll_interval
        );

        // Application handlers registered earlier win over the built-in ones
        let registered = self.processor.registered_types();
        if !registered.contains(&JobType::CacheCleanup) {
            register_builtin_handlers(&self.processor, self.settings.job_retention_days);
        }

        if let Err(e) = self.scheduler.initialize() {
            error!("Failed to initialize cron scheduler: {}", e);
        }
        self.processor.start();

        self.status()
    }

    /// Stop the scheduler, then drain the processor.
    pub async fn shutdown(&self) -> JobsResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down background jobs...");
        self.scheduler.stop().await;
        let result = self.processor.stop().await;
        info!("Background jobs shut down");
        result
    }

    pub fn status(&self) -> JobsResult<JobsStatus> {
        Ok(JobsStatus {
            enabled: self.settings.enabled,
            initialized: self.initialized.load(Ordering::SeqCst),
            processor_running: self.processor.is_running(),
            scheduler_initialized: self.scheduler.is_initialized(),
            active_jobs: self.processor.active_job_count(),
            active_schedules: self.scheduler.active_count(),
            registered_handlers: self.processor.registered_types(),
            counts: self.queue.get_status_counts()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::models::{JobStatus, JsonMap, NewJob};
    use serde_json::json;
    use std::time::Duration;

    fn settings(enabled: bool) -> JobsSettings {
        JobsSettings {
            enabled,
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_system_starts_nothing() {
        let system = JobsSystem::new(JobsDatabase::in_memory().unwrap(), settings(false));
        let status = system.initialize().unwrap();

        assert!(!status.enabled);
        assert!(!status.initialized);
        assert!(!status.processor_running);
        assert!(!status.scheduler_initialized);
        assert!(status.registered_handlers.is_empty());
        assert_eq!(status.active_schedules, 0);

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let system = JobsSystem::new(JobsDatabase::in_memory().unwrap(), settings(true));
        let status = system.initialize().unwrap();

        assert!(status.enabled);
        assert!(status.initialized);
        assert!(status.processor_running);
        assert!(status.scheduler_initialized);
        assert_eq!(status.active_schedules, 3);
        assert_eq!(status.registered_handlers, vec![JobType::CacheCleanup]);

        // Idempotent
        let again = system.initialize().unwrap();
        assert_eq!(again.active_schedules, 3);

        system.shutdown().await.unwrap();
        let status = system.status().unwrap();
        assert!(!status.initialized);
        assert!(!status.processor_running);
        assert!(!status.scheduler_initialized);
        assert_eq!(status.active_schedules, 0);
    }

    #[tokio::test]
    async fn test_application_handler_runs_jobs() {
        let system = JobsSystem::new(JobsDatabase::in_memory().unwrap(), settings(true));
        system.register_handler(
            JobType::RagSyncNews,
            Arc::new(handler_fn(|job, _ctx| async move {
                let mut result = JsonMap::new();
                result.insert("echo".to_string(), job.payload["topic"].clone());
                Ok::<_, anyhow::Error>(Some(result))
            })),
        );
        system.initialize().unwrap();

        let mut payload = JsonMap::new();
        payload.insert("topic".to_string(), json!("rust"));
        let id = system
            .queue()
            .enqueue(NewJob::new(JobType::RagSyncNews, payload))
            .unwrap();

        let job = wait_terminal(&system, &id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["echo"], "rust");
        assert_eq!(system.status().unwrap().counts.completed, 1);

        system.shutdown().await.unwrap();
    }

    async fn wait_terminal(system: &JobsSystem, id: &str) -> crate::jobs::models::Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = system.queue().get_job(id).unwrap().unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_application_cleanup_handler_not_replaced() {
        let system = JobsSystem::new(JobsDatabase::in_memory().unwrap(), settings(true));
        system.register_handler(
            JobType::CacheCleanup,
            Arc::new(handler_fn(|_job, _ctx| async move {
                let mut result = JsonMap::new();
                result.insert("custom".to_string(), json!(true));
                Ok::<_, anyhow::Error>(Some(result))
            })),
        );
        system.initialize().unwrap();

        let id = system
            .queue()
            .enqueue(NewJob::new(JobType::CacheCleanup, JsonMap::new()))
            .unwrap();
        let job = wait_terminal(&system, &id).await;
        system.shutdown().await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["custom"], true);
    }
}
