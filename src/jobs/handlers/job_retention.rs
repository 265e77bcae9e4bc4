//! Built-in handler for `cache_cleanup` jobs.
//!
//! Removes finished jobs older than `maxAgeDays` (payload) from the queue.

use crate::jobs::handler::{JobContext, JobHandler};
use crate::jobs::models::{Job, JsonMap};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

pub struct JobRetentionHandler {
    default_max_age_days: u32,
}

impl JobRetentionHandler {
    /// `default_max_age_days` applies when the payload carries no `maxAgeDays`.
    pub fn new(default_max_age_days: u32) -> Self {
        Self {
            default_max_age_days,
        }
    }

    fn max_age_days(&self, payload: &JsonMap) -> u32 {
        payload
            .get("maxAgeDays")
            .and_then(|v| v.as_u64())
            .map(|days| days.min(u32::MAX as u64) as u32)
            .unwrap_or(self.default_max_age_days)
    }
}

#[async_trait]
impl JobHandler for JobRetentionHandler {
    async fn run(&self, job: Job, ctx: JobContext) -> Result<Option<JsonMap>> {
        let max_age_days = self.max_age_days(&job.payload);
        ctx.update_progress(10.0)?;

        let deleted = ctx.queue().cleanup(max_age_days)?;
        info!(
            job_id = %job.id,
            "Job retention removed {} jobs older than {} days",
            deleted, max_age_days
        );

        let mut result = JsonMap::new();
        result.insert("deletedJobs".to_string(), json!(deleted));
        result.insert("maxAgeDays".to_string(), json!(max_age_days));
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{JobStatus, JobType, JobUpdate, NewJob};
    use crate::jobs::queue::{JobQueue, SqliteJobQueue};
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;

    #[test]
    fn test_max_age_from_payload() {
        let handler = JobRetentionHandler::new(30);
        let mut payload = JsonMap::new();
        assert_eq!(handler.max_age_days(&payload), 30);

        payload.insert("maxAgeDays".to_string(), json!(7));
        assert_eq!(handler.max_age_days(&payload), 7);

        payload.insert("maxAgeDays".to_string(), json!("soon"));
        assert_eq!(handler.max_age_days(&payload), 30);
    }

    #[tokio::test]
    async fn test_removes_old_finished_jobs() {
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let old = queue
            .enqueue(NewJob::new(JobType::RagSyncNews, JsonMap::new()))
            .unwrap();
        queue
            .update(
                &old,
                &JobUpdate {
                    status: Some(JobStatus::Failed),
                    completed_at: Some(Utc::now() - TimeDelta::days(10)),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut payload = JsonMap::new();
        payload.insert("maxAgeDays".to_string(), json!(5));
        let id = queue
            .enqueue(NewJob::new(JobType::CacheCleanup, payload))
            .unwrap();
        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.id, id);

        let result = JobRetentionHandler::new(30)
            .run(job, JobContext::new(id.clone(), queue.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["deletedJobs"], 1);
        assert_eq!(result["maxAgeDays"], 5);
        assert!(queue.get_job(&old).unwrap().is_none());
        assert!(queue.get_job(&id).unwrap().is_some());
    }
}
