use super::models::{Job, JsonMap};
use super::queue::JobQueue;
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Context handed to a handler for the job it is running.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    queue: Arc<dyn JobQueue>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            job_id: job_id.into(),
            queue,
        }
    }

    /// Report progress for the running job. Values are clamped to 0..=100.
    pub fn update_progress(&self, progress: f64) -> Result<()> {
        self.queue.update_progress(&self.job_id, progress)?;
        Ok(())
    }

    /// The queue the job came from.
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }
}

/// Business logic for one job type.
///
/// Returning `Ok(None)` completes the job with `{"success": true}`. Returning
/// an error fails the current attempt; the queue decides whether it retries.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job, ctx: JobContext) -> Result<Option<JsonMap>>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonMap>>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonMap>>> + Send + 'static,
{
    async fn run(&self, job: Job, ctx: JobContext) -> Result<Option<JsonMap>> {
        (self.f)(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{JobType, NewJob};
    use crate::jobs::queue::SqliteJobQueue;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_reports_progress() {
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let id = queue
            .enqueue(NewJob::new(JobType::RagSyncTrends, JsonMap::new()))
            .unwrap();
        let job = queue.get_job(&id).unwrap().unwrap();

        let handler = handler_fn(|job: Job, ctx: JobContext| async move {
            ctx.update_progress(50.0)?;
            let mut out = JsonMap::new();
            out.insert("type".to_string(), json!(job.job_type.as_str()));
            Ok::<_, anyhow::Error>(Some(out))
        });

        let result = handler
            .run(job, JobContext::new(id.clone(), queue.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["type"], "rag_sync_trends");
        assert_eq!(queue.get_job(&id).unwrap().unwrap().progress, 50);
    }
}
