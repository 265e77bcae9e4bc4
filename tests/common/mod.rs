//! Shared helpers for the integration tests.

#![allow(dead_code)]

use pezzottify_jobs::config::JobsSettings;
use pezzottify_jobs::jobs::{Job, JobQueue, JobsDatabase, JobsSystem};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A jobs system over a database file in a temporary directory.
pub struct TestJobs {
    pub system: JobsSystem,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestJobs {
    pub fn new(settings: JobsSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("jobs.db");
        let db = JobsDatabase::open(&db_path).expect("Failed to open jobs database");
        Self {
            system: JobsSystem::new(db, settings),
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn enabled() -> Self {
        Self::new(fast_settings())
    }

    pub fn queue(&self) -> &dyn JobQueue {
        self.system.queue().as_ref()
    }
}

/// Enabled settings with a short poll interval and immediate retries.
pub fn fast_settings() -> JobsSettings {
    JobsSettings {
        enabled: true,
        concurrency: 2,
        poll_interval: Duration::from_millis(20),
        max_backoff_secs: Some(0),
        ..Default::default()
    }
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(queue: &dyn JobQueue, id: &str) -> Job {
    wait_for_job(queue, id, |job| job.status.is_terminal()).await
}

pub async fn wait_for_job(queue: &dyn JobQueue, id: &str, predicate: impl Fn(&Job) -> bool) -> Job {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let job = queue
                .get_job(id)
                .expect("Failed to read job")
                .expect("Job disappeared");
            if predicate(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for job")
}
