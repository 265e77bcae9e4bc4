//! Job queue storage.
//!
//! The queue is the only component that mutates `background_jobs` rows. Every
//! transition is a single statement (or a single transaction) on the shared
//! connection, so a job can never be claimed twice.

use super::database::JobsDatabase;
use super::models::*;
use super::retry_policy::RetryPolicy;
use crate::error::{JobsError, JobsResult};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::json;
use tracing::{debug, error, info};

/// Result stored on completion when the handler produced nothing.
pub fn default_success_result() -> JsonMap {
    let mut result = JsonMap::new();
    result.insert("success".to_string(), json!(true));
    result
}

/// Storage operations over persisted jobs.
pub trait JobQueue: Send + Sync {
    /// Insert a new `pending` job with `attempt = 0`. Returns its id.
    fn enqueue(&self, job: NewJob) -> Result<String>;

    /// Claim the next eligible job.
    ///
    /// Picks the pending job with the lowest priority value whose
    /// `scheduled_for` is unset or in the past, oldest first within a
    /// priority. The job is moved to `running`, `started_at` is set and
    /// `attempt` is incremented, all in one statement.
    fn dequeue(&self) -> Result<Option<Job>>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Move one specific `pending` job to `running` without touching its
    /// attempt count. Fails with `InvalidState` if the job is no longer
    /// pending, so a job is never claimed twice.
    fn claim(&self, id: &str) -> JobsResult<Job>;

    /// List jobs ordered by priority ascending, then newest first.
    fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Mark a job completed with progress 100.
    fn complete(&self, id: &str, result: Option<JsonMap>) -> JobsResult<()>;

    /// Record a failed run.
    ///
    /// Returns true when the job went back to `pending` with a backoff,
    /// false when it is now permanently `failed`.
    fn fail(&self, id: &str, error: &anyhow::Error) -> JobsResult<bool>;

    /// Clamp to 0..=100, round, store. Returns false if the job does not exist.
    fn update_progress(&self, id: &str, progress: f64) -> Result<bool>;

    /// Cancel a pending job. Any other status is left alone and false is returned.
    fn cancel(&self, id: &str) -> Result<bool>;

    /// Patch fields directly, bypassing the claim path.
    fn update(&self, id: &str, update: &JobUpdate) -> Result<bool>;

    fn get_status_counts(&self) -> Result<StatusCounts>;

    /// Delete terminal jobs that completed more than `max_age_days` ago.
    fn cleanup(&self, max_age_days: u32) -> Result<usize>;
}

const TERMINAL_STATUSES_SQL: &str = "('completed', 'failed', 'cancelled')";

/// SQLite-backed job queue.
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: JobsDatabase,
    retry_policy: RetryPolicy,
}

impl SqliteJobQueue {
    pub fn new(db: JobsDatabase) -> Self {
        Self {
            db,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Queue over a fresh in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(JobsDatabase::in_memory()?))
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn database(&self) -> &JobsDatabase {
        &self.db
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let type_idx = row.as_ref().column_index("type")?;
        let job_type_str: String = row.get(type_idx)?;
        let job_type = JobType::from_str(&job_type_str).ok_or_else(|| {
            conversion_error(type_idx, format!("unknown job type: {}", job_type_str))
        })?;

        let status_idx = row.as_ref().column_index("status")?;
        let status_str: String = row.get(status_idx)?;
        let status = JobStatus::from_str(&status_str).ok_or_else(|| {
            conversion_error(status_idx, format!("unknown job status: {}", status_str))
        })?;

        let priority_idx = row.as_ref().column_index("priority")?;
        let priority = JobPriority::new(row.get(priority_idx)?)
            .map_err(|e| conversion_error(priority_idx, e.to_string()))?;

        let payload_idx = row.as_ref().column_index("payload")?;
        let payload = parse_json_map(payload_idx, &row.get::<_, String>(payload_idx)?)?;

        let result_idx = row.as_ref().column_index("result")?;
        let result = row
            .get::<_, Option<String>>(result_idx)?
            .map(|s| parse_json_map(result_idx, &s))
            .transpose()?;

        Ok(Job {
            id: row.get("id")?,
            job_type,
            status,
            priority,
            payload,
            result,
            progress: row.get::<_, i64>("progress")? as u8,
            attempt: row.get::<_, i64>("attempt")? as u32,
            max_attempts: row.get::<_, i64>("max_attempts")? as u32,
            project_id: row.get("project_id")?,
            scheduled_for: from_millis_opt(0, row.get("scheduled_for")?)?,
            started_at: from_millis_opt(0, row.get("started_at")?)?,
            completed_at: from_millis_opt(0, row.get("completed_at")?)?,
            created_at: from_millis(0, row.get("created_at")?)?,
            updated_at: from_millis(0, row.get("updated_at")?)?,
        })
    }

    fn failure_result(error: &anyhow::Error) -> JobsResult<String> {
        let result = json!({
            "error": error.to_string(),
            "stack": format!("{:?}", error),
        });
        Ok(serde_json::to_string(&result).context("Failed to serialize job error")?)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn parse_json_map(idx: usize, s: &str) -> rusqlite::Result<JsonMap> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn to_json(map: &JsonMap) -> Result<String> {
    serde_json::to_string(map).context("Failed to serialize JSON map")
}

fn clamp_progress(progress: f64) -> u8 {
    // NaN casts to 0
    progress.clamp(0.0, 100.0).round() as u8
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = to_millis(Utc::now());
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO background_jobs (
                id, type, status, priority, payload, progress, attempt, max_attempts,
                project_id, scheduled_for, created_at, updated_at
            ) VALUES (?1, ?2, 'pending', ?3, ?4, 0, 0, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                job.job_type.as_str(),
                job.priority.value() as i64,
                to_json(&job.payload)?,
                job.max_attempts as i64,
                job.project_id,
                job.scheduled_for.map(to_millis),
                now,
            ],
        )
        .context("Failed to insert job")?;

        debug!(
            job_id = %id,
            job_type = %job.job_type,
            priority = job.priority.value(),
            "Enqueued job"
        );
        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<Job>> {
        let now = to_millis(Utc::now());
        let mut conn = self.db.lock()?;
        let tx = conn.transaction().context("Failed to start transaction")?;
        let claimed: Option<String> = tx
            .query_row(
                "UPDATE background_jobs
                 SET status = 'running', started_at = ?1, attempt = attempt + 1, updated_at = ?1
                 WHERE id = (
                     SELECT id FROM background_jobs
                     WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                     ORDER BY priority ASC, created_at ASC, rowid ASC
                     LIMIT 1
                 )
                 RETURNING id",
                params![now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim next job")?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        let decoded = tx.query_row(
            "SELECT * FROM background_jobs WHERE id = ?1",
            params![id],
            Self::row_to_job,
        );
        match decoded {
            Ok(job) => {
                tx.commit().context("Failed to commit job claim")?;
                Ok(Some(job))
            }
            Err(e) => {
                // An unreadable row must not stay stuck in `running`
                let result = json!({ "error": format!("Unreadable job record: {}", e) });
                tx.execute(
                    "UPDATE background_jobs
                     SET status = 'failed', result = ?1, completed_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![result.to_string(), now, id],
                )
                .context("Failed to mark unreadable job failed")?;
                tx.commit().context("Failed to commit job claim")?;
                error!(job_id = %id, "Claimed job could not be decoded, marked failed: {}", e);
                Err(anyhow!("Claimed job {} could not be decoded: {}", id, e))
            }
        }
    }

    fn claim(&self, id: &str) -> JobsResult<Job> {
        let now = to_millis(Utc::now());
        let conn = self.db.lock()?;
        let claimed = conn
            .query_row(
                "UPDATE background_jobs
                 SET status = 'running', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'
                 RETURNING *",
                params![now, id],
                Self::row_to_job,
            )
            .optional()
            .context("Failed to claim job")?;
        if let Some(job) = claimed {
            return Ok(job);
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM background_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read job status")?;
        match status {
            Some(actual) => Err(JobsError::InvalidState {
                expected: JobStatus::Pending.to_string(),
                actual,
            }),
            None => Err(JobsError::JobNotFound(id.to_string())),
        }
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.db.lock()?;
        let job = conn
            .query_row(
                "SELECT * FROM background_jobs WHERE id = ?1",
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({})", placeholders));
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if !filter.types.is_empty() {
            let placeholders = vec!["?"; filter.types.len()].join(", ");
            conditions.push(format!("type IN ({})", placeholders));
            values.extend(
                filter
                    .types
                    .iter()
                    .map(|t| Value::Text(t.as_str().to_string())),
            );
        }
        if let Some(project_id) = &filter.project_id {
            conditions.push("project_id = ?".to_string());
            values.push(Value::Text(project_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        // SQLite needs a LIMIT for OFFSET; -1 means unbounded
        values.push(Value::Integer(filter.limit.map_or(-1, |l| l as i64)));
        values.push(Value::Integer(filter.offset.unwrap_or(0) as i64));

        let sql = format!(
            "SELECT * FROM background_jobs {} ORDER BY priority ASC, created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            where_clause
        );

        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params_from_iter(values), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn complete(&self, id: &str, result: Option<JsonMap>) -> JobsResult<()> {
        let now = to_millis(Utc::now());
        let result = result.as_ref().map(to_json).transpose()?;
        let conn = self.db.lock()?;
        let updated = conn
            .execute(
                "UPDATE background_jobs
                 SET status = 'completed', progress = 100, result = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![result, now, id],
            )
            .context("Failed to complete job")?;
        if updated == 0 {
            return Err(JobsError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    fn fail(&self, id: &str, error: &anyhow::Error) -> JobsResult<bool> {
        let now = Utc::now();
        let result = Self::failure_result(error)?;

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().context("Failed to start transaction")?;

        let attempts: Option<(i64, i64)> = tx
            .query_row(
                "SELECT attempt, max_attempts FROM background_jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read job attempts")?;
        let Some((attempt, max_attempts)) = attempts else {
            return Err(JobsError::JobNotFound(id.to_string()));
        };
        let attempt = attempt as u32;

        let will_retry = self.retry_policy.should_retry(attempt, max_attempts as u32);
        if will_retry {
            let retry_at = self.retry_policy.next_retry_at(now, attempt);
            tx.execute(
                "UPDATE background_jobs
                 SET status = 'pending', scheduled_for = ?1, result = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![to_millis(retry_at), result, to_millis(now), id],
            )
            .context("Failed to schedule job retry")?;
            info!(
                job_id = %id,
                attempt,
                max_attempts,
                retry_at = %retry_at,
                "Job failed, retry scheduled"
            );
        } else {
            tx.execute(
                "UPDATE background_jobs
                 SET status = 'failed', result = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![result, to_millis(now), id],
            )
            .context("Failed to mark job failed")?;
            info!(job_id = %id, attempt, max_attempts, "Job permanently failed");
        }

        tx.commit().context("Failed to commit job failure")?;
        Ok(will_retry)
    }

    fn update_progress(&self, id: &str, progress: f64) -> Result<bool> {
        let now = to_millis(Utc::now());
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE background_jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3",
            params![clamp_progress(progress) as i64, now, id],
        )?;
        Ok(updated > 0)
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        let now = to_millis(Utc::now());
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE background_jobs
             SET status = 'cancelled', completed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        if updated > 0 {
            info!(job_id = %id, "Cancelled job");
        }
        Ok(updated > 0)
    }

    fn update(&self, id: &str, update: &JobUpdate) -> Result<bool> {
        let mut assignments: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = update.status {
            assignments.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(progress) = update.progress {
            assignments.push("progress = ?");
            values.push(Value::Integer(progress.min(100) as i64));
        }
        if let Some(result) = &update.result {
            assignments.push("result = ?");
            values.push(Value::Text(to_json(result)?));
        }
        if let Some(started_at) = update.started_at {
            assignments.push("started_at = ?");
            values.push(Value::Integer(to_millis(started_at)));
        }
        if let Some(completed_at) = update.completed_at {
            assignments.push("completed_at = ?");
            values.push(Value::Integer(to_millis(completed_at)));
        }
        assignments.push("updated_at = ?");
        values.push(Value::Integer(to_millis(Utc::now())));
        values.push(Value::Text(id.to_string()));

        let sql = format!(
            "UPDATE background_jobs SET {} WHERE id = ?",
            assignments.join(", ")
        );
        let conn = self.db.lock()?;
        let updated = conn
            .execute(&sql, params_from_iter(values))
            .context("Failed to update job")?;
        Ok(updated > 0)
    }

    fn get_status_counts(&self) -> Result<StatusCounts> {
        let conn = self.db.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM background_jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            if let Some(status) = JobStatus::from_str(&status) {
                counts.set(status, count as u64);
            }
        }
        Ok(counts)
    }

    fn cleanup(&self, max_age_days: u32) -> Result<usize> {
        let cutoff: DateTime<Utc> = TimeDelta::try_days(max_age_days as i64)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let conn = self.db.lock()?;
        let deleted = conn
            .execute(
                &format!(
                    "DELETE FROM background_jobs
                     WHERE status IN {} AND completed_at IS NOT NULL AND completed_at < ?1",
                    TERMINAL_STATUSES_SQL
                ),
                params![to_millis(cutoff)],
            )
            .context("Failed to clean up old jobs")?;
        if deleted > 0 {
            info!("Cleaned up {} jobs older than {} days", deleted, max_age_days);
        }
        Ok(deleted)
    }
}
