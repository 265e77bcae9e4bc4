//! Polling worker pool over the job queue.
//!
//! A single loop ticks at a fixed interval. Each tick claims jobs while there
//! are free slots and spawns one task per claimed job. Handlers run in their
//! own task, so a panicking handler fails its job instead of the pool.

use super::handler::{JobContext, JobHandler};
use super::models::{Job, JobStatus, JobType, JsonMap};
use super::queue::{default_success_result, JobQueue};
use crate::error::{JobsError, JobsResult};
use crate::metrics;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of jobs executing at once.
    pub max_concurrency: usize,
    /// Fixed delay between polls, whether or not a job was found.
    pub poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

struct PollLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    queue: Arc<dyn JobQueue>,
    config: ProcessorConfig,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    active: AtomicUsize,
    in_flight: tokio::sync::Mutex<JoinSet<JobsResult<()>>>,
    poll_loop: Mutex<Option<PollLoop>>,
}

/// Decrements the active job count when the execution task ends, however it ends.
struct ActiveSlot(Arc<Inner>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let remaining = self.0.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_jobs(remaining);
    }
}

/// Bounded-concurrency job executor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobProcessor {
    inner: Arc<Inner>,
}

impl JobProcessor {
    pub fn new(queue: Arc<dyn JobQueue>, config: ProcessorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                config: ProcessorConfig {
                    max_concurrency: config.max_concurrency.max(1),
                    ..config
                },
                handlers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                in_flight: tokio::sync::Mutex::new(JoinSet::new()),
                poll_loop: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.inner.queue
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Map a job type to its handler, replacing any previous mapping.
    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(job_type, handler).is_some() {
            debug!(job_type = %job_type, "Replaced job handler");
        } else {
            debug!(job_type = %job_type, "Registered job handler");
        }
    }

    pub fn unregister_handler(&self, job_type: JobType) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_type)
            .is_some()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn active_job_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn handler_for(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_type)
            .cloned()
    }

    /// Start the poll loop. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut poll_loop = self
            .inner
            .poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if poll_loop.is_some() {
            warn!("Job processor already running");
            return;
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let processor = self.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { processor.run(token).await });
        *poll_loop = Some(PollLoop { shutdown, handle });

        info!(
            "Job processor started (max_concurrency={}, poll_interval={:?})",
            self.inner.config.max_concurrency, self.inner.config.poll_interval
        );
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Job processor poll loop exiting");
                    break;
                }
            }
        }
    }

    /// Run one poll cycle: reap finished executions, then claim and dispatch
    /// jobs until every slot is busy or the queue has nothing eligible.
    ///
    /// Returns the number of jobs dispatched. Store errors are logged and end
    /// the cycle early. Nothing is claimed once `stop` has been called.
    pub async fn tick(&self) -> usize {
        let mut in_flight = self.inner.in_flight.lock().await;
        while let Some(finished) = in_flight.try_join_next() {
            log_execution_result(finished);
        }

        let mut dispatched = 0;
        while !self.inner.stop_requested.load(Ordering::SeqCst)
            && self.active_job_count() < self.inner.config.max_concurrency
        {
            let job = match self.inner.queue.dequeue() {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to dequeue job: {:#}", e);
                    break;
                }
            };

            let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_active_jobs(active);
            let slot = ActiveSlot(self.inner.clone());
            let processor = self.clone();
            in_flight.spawn(async move {
                let _slot = slot;
                processor.execute(job).await
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Run a claimed job to completion and record its outcome on the queue.
    async fn execute(&self, job: Job) -> JobsResult<()> {
        let job_id = job.id.clone();
        let job_type = job.job_type;
        info!(
            job_id = %job_id,
            job_type = %job_type,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let started = Instant::now();
        let outcome = self.run_handler(job).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.inner
                    .queue
                    .complete(&job_id, Some(result.unwrap_or_else(default_success_result)))?;
                metrics::record_job_execution(job_type.as_str(), "completed", elapsed);
                info!(job_id = %job_id, job_type = %job_type, "Job completed in {:?}", elapsed);
            }
            Err(e) => {
                let will_retry = self.inner.queue.fail(&job_id, &e)?;
                let label = if will_retry { "retry" } else { "failed" };
                metrics::record_job_execution(job_type.as_str(), label, elapsed);
                if will_retry {
                    warn!(job_id = %job_id, job_type = %job_type, "Job failed, will retry: {:#}", e);
                } else {
                    error!(job_id = %job_id, job_type = %job_type, "Job failed permanently: {:#}", e);
                }
            }
        }
        Ok(())
    }

    /// Look up and invoke the handler. Missing handlers and panics become errors.
    async fn run_handler(&self, job: Job) -> anyhow::Result<Option<JsonMap>> {
        let handler = self
            .handler_for(job.job_type)
            .ok_or_else(|| anyhow!(JobsError::NoHandler(job.job_type)))?;
        let ctx = JobContext::new(job.id.clone(), self.inner.queue.clone());

        #[cfg(feature = "slowdown")]
        tokio::time::sleep(Duration::from_millis(rand::random_range(100..1000))).await;

        match tokio::spawn(async move { handler.run(job, ctx).await }).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(anyhow!("Job handler panicked")),
            Err(join_error) => Err(anyhow!("Job handler task failed: {}", join_error)),
        }
    }

    /// Execute one specific pending job right now, outside the poll loop.
    ///
    /// The job is marked running without touching its attempt count, then
    /// completed or failed exactly as the pool would. Handler errors are
    /// recorded on the job and returned as `JobsError::Handler`.
    pub async fn process_job_immediate(&self, job_id: &str) -> JobsResult<JsonMap> {
        let job = self
            .inner
            .queue
            .get_job(job_id)?
            .ok_or_else(|| JobsError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Pending {
            return Err(JobsError::InvalidState {
                expected: JobStatus::Pending.to_string(),
                actual: job.status.to_string(),
            });
        }
        if self.handler_for(job.job_type).is_none() {
            return Err(JobsError::NoHandler(job.job_type));
        }

        // The poll loop may have taken the job since the read above
        let job = self.inner.queue.claim(job_id)?;

        let job_type = job.job_type;
        let started = Instant::now();
        match self.run_handler(job).await {
            Ok(result) => {
                let result = result.unwrap_or_else(default_success_result);
                self.inner.queue.complete(job_id, Some(result.clone()))?;
                metrics::record_job_execution(job_type.as_str(), "completed", started.elapsed());
                info!(job_id = %job_id, job_type = %job_type, "Immediate job completed");
                Ok(result)
            }
            Err(e) => {
                let will_retry = self.inner.queue.fail(job_id, &e)?;
                let label = if will_retry { "retry" } else { "failed" };
                metrics::record_job_execution(job_type.as_str(), label, started.elapsed());
                error!(job_id = %job_id, job_type = %job_type, "Immediate job failed: {:#}", e);
                Err(JobsError::Handler(e))
            }
        }
    }

    /// Stop claiming new jobs and wait for every in-flight execution to settle.
    ///
    /// Returns the first error raised while recording an outcome, after all
    /// executions have finished.
    pub async fn stop(&self) -> JobsResult<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
        let poll_loop = self
            .inner
            .poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poll_loop) = poll_loop {
            poll_loop.shutdown.cancel();
            if let Err(e) = poll_loop.handle.await {
                error!("Job processor poll loop ended abnormally: {}", e);
            }
        }

        let active = self.active_job_count();
        if active > 0 {
            info!("Waiting for {} active jobs to finish...", active);
        }

        let mut first_error = None;
        let mut in_flight = self.inner.in_flight.lock().await;
        while let Some(finished) = in_flight.join_next().await {
            let error = match finished {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => JobsError::Store(anyhow!("Job task failed: {}", join_error)),
            };
            error!("Error while draining jobs: {}", error);
            first_error.get_or_insert(error);
        }

        info!("Job processor stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn log_execution_result(finished: Result<JobsResult<()>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to record job outcome: {}", e),
        Err(e) => error!("Job task failed: {}", e),
    }
}
