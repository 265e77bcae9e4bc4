//! Cron scheduler.
//!
//! Each enabled schedule owns one task that sleeps until the next cron
//! occurrence and then enqueues a job through the regular queue. The map of
//! live tasks is process-local and can always be rebuilt from the store.

use super::cron_expr::{self, CronExpr};
use super::defaults::default_schedules;
use super::models::*;
use super::queue::JobQueue;
use super::schedule_store::ScheduleStore;
use crate::error::{JobsError, JobsResult};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ScheduleTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CronScheduler {
    store: ScheduleStore,
    queue: Arc<dyn JobQueue>,
    defaults: Vec<NewSchedule>,
    tasks: Mutex<HashMap<String, ScheduleTask>>,
    initialized: AtomicBool,
}

impl CronScheduler {
    pub fn new(store: ScheduleStore, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            defaults: default_schedules(),
            tasks: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Replace the schedules seeded by `initialize`.
    pub fn with_default_schedules(mut self, defaults: Vec<NewSchedule>) -> Self {
        self.defaults = defaults;
        self
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed default schedules and start a task for every enabled one.
    /// Calling it again is a no-op.
    pub fn initialize(&self) -> JobsResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            debug!("Cron scheduler already initialized");
            return Ok(());
        }

        for schedule in &self.defaults {
            if self.store.insert_if_absent(schedule)? {
                info!("Seeded default schedule '{}'", schedule.name);
            }
        }

        let enabled = self.store.list_enabled()?;
        for schedule in &enabled {
            if let Err(e) = self.start_schedule(schedule) {
                error!("Failed to start schedule '{}': {}", schedule.name, e);
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "Cron scheduler initialized with {} active schedules",
            self.active_count()
        );
        Ok(())
    }

    /// Start the recurring task for a schedule.
    ///
    /// Returns false without doing anything if a task for this schedule is
    /// already live. Must be called from within a Tokio runtime.
    pub fn start_schedule(&self, schedule: &CronSchedule) -> JobsResult<bool> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&schedule.id) {
            debug!("Schedule '{}' already running", schedule.name);
            return Ok(false);
        }

        let expr = CronExpr::parse(&schedule.cron_expression)?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_schedule(
            schedule.clone(),
            expr,
            self.store.clone(),
            self.queue.clone(),
            shutdown.clone(),
        ));
        tasks.insert(schedule.id.clone(), ScheduleTask { shutdown, handle });

        info!(
            schedule = %schedule.name,
            job_type = %schedule.job_type,
            "Started schedule ({})",
            schedule.cron_expression
        );
        Ok(true)
    }

    /// Stop and discard the live task for a schedule. Returns false if none was running.
    pub async fn stop_schedule_task(&self, id: &str) -> bool {
        let task = self.tasks().remove(id);
        match task {
            Some(task) => {
                task.shutdown.cancel();
                if let Err(e) = task.handle.await {
                    error!("Schedule task {} ended abnormally: {}", id, e);
                }
                debug!("Stopped schedule task {}", id);
                true
            }
            None => false,
        }
    }

    pub fn create_schedule(&self, schedule: NewSchedule) -> JobsResult<CronSchedule> {
        cron_expr::validate(&schedule.cron_expression)?;
        let created = self.store.insert(&schedule)?;
        info!("Created schedule '{}'", created.name);
        if created.enabled {
            self.start_schedule(&created)?;
        }
        Ok(created)
    }

    /// Persist the patch, then restart the task so it picks up the new row.
    pub async fn update_schedule(
        &self,
        id: &str,
        update: ScheduleUpdate,
    ) -> JobsResult<CronSchedule> {
        if let Some(expression) = &update.cron_expression {
            cron_expr::validate(expression)?;
        }
        if !self.store.update(id, &update)? {
            return Err(JobsError::ScheduleNotFound(id.to_string()));
        }

        self.stop_schedule_task(id).await;
        let schedule = self.require_schedule(id)?;
        if schedule.enabled {
            self.start_schedule(&schedule)?;
        } else {
            self.store.set_next_run(id, None)?;
        }
        info!("Updated schedule '{}'", schedule.name);
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: &str) -> JobsResult<bool> {
        self.stop_schedule_task(id).await;
        let deleted = self.store.delete(id)?;
        if deleted {
            info!("Deleted schedule {}", id);
        }
        Ok(deleted)
    }

    pub fn enable_schedule(&self, id: &str) -> JobsResult<CronSchedule> {
        if !self.store.set_enabled(id, true)? {
            return Err(JobsError::ScheduleNotFound(id.to_string()));
        }
        let schedule = self.require_schedule(id)?;
        self.start_schedule(&schedule)?;
        Ok(schedule)
    }

    pub async fn disable_schedule(&self, id: &str) -> JobsResult<CronSchedule> {
        self.stop_schedule_task(id).await;
        if !self.store.set_enabled(id, false)? {
            return Err(JobsError::ScheduleNotFound(id.to_string()));
        }
        self.store.set_next_run(id, None)?;
        self.require_schedule(id)
    }

    /// Enqueue a job for the schedule right away, regardless of its timer.
    pub fn trigger_now(&self, id: &str) -> JobsResult<String> {
        let schedule = self.require_schedule(id)?;
        fire_schedule(&self.store, self.queue.as_ref(), &schedule)
    }

    /// Stop every live task and mark the scheduler uninitialized.
    pub async fn stop(&self) {
        let tasks: Vec<(String, ScheduleTask)> = self.tasks().drain().collect();
        for (_, task) in &tasks {
            task.shutdown.cancel();
        }
        for (id, task) in tasks {
            if let Err(e) = task.handle.await {
                error!("Schedule task {} ended abnormally: {}", id, e);
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!("Cron scheduler stopped");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.tasks().len()
    }

    pub fn get_all_schedules(&self) -> JobsResult<Vec<CronSchedule>> {
        Ok(self.store.list_all()?)
    }

    pub fn get_enabled_schedules(&self) -> JobsResult<Vec<CronSchedule>> {
        Ok(self.store.list_enabled()?)
    }

    pub fn get_schedule(&self, id: &str) -> JobsResult<Option<CronSchedule>> {
        Ok(self.store.get(id)?)
    }

    fn require_schedule(&self, id: &str) -> JobsResult<CronSchedule> {
        self.store
            .get(id)?
            .ok_or_else(|| JobsError::ScheduleNotFound(id.to_string()))
    }
}

/// Enqueue one job from a schedule's template and record the run.
pub(crate) fn fire_schedule(
    store: &ScheduleStore,
    queue: &dyn JobQueue,
    schedule: &CronSchedule,
) -> JobsResult<String> {
    let job_id = queue.enqueue(
        NewJob::new(schedule.job_type, schedule.payload.clone())
            .with_priority(JobPriority::SCHEDULED),
    )?;
    store.set_last_run(&schedule.id, Utc::now())?;
    metrics::record_schedule_fire(&schedule.name, "enqueued");
    info!(
        schedule = %schedule.name,
        job_id = %job_id,
        job_type = %schedule.job_type,
        "Schedule fired"
    );
    Ok(job_id)
}

async fn run_schedule(
    schedule: CronSchedule,
    expr: CronExpr,
    store: ScheduleStore,
    queue: Arc<dyn JobQueue>,
    shutdown: CancellationToken,
) {
    let mut after: DateTime<Utc> = Utc::now();
    loop {
        let Some(next) = expr.next_after(after) else {
            warn!("Schedule '{}' has no upcoming occurrence", schedule.name);
            break;
        };
        if let Err(e) = store.set_next_run(&schedule.id, Some(next)) {
            error!("Failed to record next run for '{}': {:#}", schedule.name, e);
        }

        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = fire_schedule(&store, queue.as_ref(), &schedule) {
                    metrics::record_schedule_fire(&schedule.name, "error");
                    error!("Failed to enqueue job for schedule '{}': {}", schedule.name, e);
                }
            }
            _ = shutdown.cancelled() => {
                break;
            }
        }
        // Never fire the same occurrence twice, even if the wakeup was early.
        after = next.max(Utc::now());
    }
}
