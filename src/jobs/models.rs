//! Data models for background jobs and cron schedules.

use crate::error::JobsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque structured payload/result map. Only handlers interpret its contents.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Kind of work a job performs. Determines which handler runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    RagSyncChannel,
    RagSyncNews,
    RagSyncTrends,
    EmbeddingGeneration,
    VideoAssembly,
    CvBatchAnalysis,
    CacheCleanup,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::RagSyncChannel,
        JobType::RagSyncNews,
        JobType::RagSyncTrends,
        JobType::EmbeddingGeneration,
        JobType::VideoAssembly,
        JobType::CvBatchAnalysis,
        JobType::CacheCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RagSyncChannel => "rag_sync_channel",
            JobType::RagSyncNews => "rag_sync_news",
            JobType::RagSyncTrends => "rag_sync_trends",
            JobType::EmbeddingGeneration => "embedding_generation",
            JobType::VideoAssembly => "video_assembly",
            JobType::CvBatchAnalysis => "cv_batch_analysis",
            JobType::CacheCleanup => "cache_cleanup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Pending -> Running -> {Completed | Pending (retry) | Failed}` and
/// `Pending -> Cancelled`. Completed, failed and cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job priority, 1 (highest) to 10 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct JobPriority(u8);

impl JobPriority {
    pub const HIGHEST: JobPriority = JobPriority(1);
    /// Used for every job enqueued by the cron scheduler.
    pub const SCHEDULED: JobPriority = JobPriority(3);
    pub const DEFAULT: JobPriority = JobPriority(5);
    pub const LOWEST: JobPriority = JobPriority(10);

    pub fn new(value: i64) -> Result<Self, JobsError> {
        if (1..=10).contains(&value) {
            Ok(JobPriority(value as u8))
        } else {
            Err(JobsError::InvalidPriority(value))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::DEFAULT
    }
}

impl TryFrom<i64> for JobPriority {
    type Error = JobsError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        JobPriority::new(value)
    }
}

impl From<JobPriority> for i64 {
    fn from(priority: JobPriority) -> Self {
        priority.0 as i64
    }
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: JsonMap,
    pub result: Option<JsonMap>,
    pub progress: u8,
    /// Number of times the job has been claimed, including the current run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub project_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A job back in `pending` after at least one claim is waiting for a retry.
    pub fn is_retrying(&self) -> bool {
        self.status == JobStatus::Pending && self.attempt > 0
    }
}

/// Parameters for enqueuing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: JsonMap,
    pub priority: JobPriority,
    pub project_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: JsonMap) -> Self {
        Self {
            job_type,
            payload,
            priority: JobPriority::DEFAULT,
            project_id: None,
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Partial field patch for `JobQueue::update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub result: Option<JsonMap>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.result.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }
}

/// Filters for listing jobs. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub types: Vec<JobType>,
    pub project_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.types.push(job_type);
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn paginate(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

/// Number of jobs per status. Statuses with no rows are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn set(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending = count,
            JobStatus::Running => self.running = count,
            JobStatus::Completed => self.completed = count,
            JobStatus::Failed => self.failed = count,
            JobStatus::Cancelled => self.cancelled = count,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// A persisted recurring job template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub id: String,
    pub name: String,
    pub job_type: JobType,
    pub cron_expression: String,
    /// Copied verbatim into every job this schedule enqueues.
    pub payload: JsonMap,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub job_type: JobType,
    pub cron_expression: String,
    pub payload: JsonMap,
    pub enabled: bool,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            job_type,
            cron_expression: cron_expression.into(),
            payload: JsonMap::new(),
            enabled: true,
        }
    }

    pub fn with_payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial patch for a schedule. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    pub cron_expression: Option<String>,
    pub payload: Option<JsonMap>,
    pub enabled: Option<bool>,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })
}

pub(crate) fn from_millis_opt(
    idx: usize,
    millis: Option<i64>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    millis.map(|m| from_millis(idx, m)).transpose()
}
