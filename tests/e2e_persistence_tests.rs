//! Queue and schedule state surviving a reopen of the database file.

mod common;

use chrono::{TimeDelta, Utc};
use common::{fast_settings, wait_for_terminal, TestJobs};
use pezzottify_jobs::jobs::{
    handler_fn, JobFilter, JobQueue, JobStatus, JobType, JobUpdate, JobsDatabase, JobsSystem,
    JsonMap, NewJob, SqliteJobQueue,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_pending_jobs_survive_restart() {
    let jobs = TestJobs::new(fast_settings());
    let mut payload = JsonMap::new();
    payload.insert("channelId".to_string(), json!("UC123"));
    let id = jobs
        .queue()
        .enqueue(
            NewJob::new(JobType::RagSyncChannel, payload.clone()).with_project("project-1"),
        )
        .unwrap();

    // A second system over the same file sees the job and runs it
    let reopened = JobsSystem::new(JobsDatabase::open(&jobs.db_path).unwrap(), fast_settings());
    reopened.register_handler(
        JobType::RagSyncChannel,
        Arc::new(handler_fn(|job, _ctx| async move {
            let mut result = JsonMap::new();
            result.insert("channel".to_string(), job.payload["channelId"].clone());
            Ok::<_, anyhow::Error>(Some(result))
        })),
    );
    let job = reopened.queue().get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.payload, payload);
    assert_eq!(job.project_id.as_deref(), Some("project-1"));

    reopened.initialize().unwrap();
    let job = wait_for_terminal(reopened.queue().as_ref(), &id).await;
    reopened.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["channel"], "UC123");
}

#[tokio::test]
async fn test_default_schedules_seeded_only_once_across_restarts() {
    let jobs = TestJobs::new(fast_settings());
    jobs.system.initialize().unwrap();
    let first = jobs.system.scheduler().get_all_schedules().unwrap();
    jobs.system.shutdown().await.unwrap();

    let reopened = JobsSystem::new(JobsDatabase::open(&jobs.db_path).unwrap(), fast_settings());
    reopened.initialize().unwrap();
    let second = reopened.scheduler().get_all_schedules().unwrap();
    reopened.shutdown().await.unwrap();

    assert_eq!(first.len(), 3);
    let first_ids: Vec<&str> = first.iter().map(|s| s.id.as_str()).collect();
    let second_ids: Vec<&str> = second.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn test_cache_cleanup_removes_old_finished_jobs() {
    let jobs = TestJobs::new(fast_settings());
    let queue = SqliteJobQueue::new(JobsDatabase::open(&jobs.db_path).unwrap());

    let old = queue
        .enqueue(NewJob::new(JobType::RagSyncNews, JsonMap::new()))
        .unwrap();
    queue
        .update(
            &old,
            &JobUpdate {
                status: Some(JobStatus::Completed),
                completed_at: Some(Utc::now() - TimeDelta::days(45)),
                ..Default::default()
            },
        )
        .unwrap();
    let recent = queue
        .enqueue(NewJob::new(JobType::RagSyncNews, JsonMap::new()))
        .unwrap();
    queue
        .update(
            &recent,
            &JobUpdate {
                status: Some(JobStatus::Failed),
                completed_at: Some(Utc::now() - TimeDelta::days(2)),
                ..Default::default()
            },
        )
        .unwrap();

    jobs.system.initialize().unwrap();
    let mut payload = JsonMap::new();
    payload.insert("maxAgeDays".to_string(), json!(30));
    let cleanup = jobs
        .queue()
        .enqueue(NewJob::new(JobType::CacheCleanup, payload))
        .unwrap();
    let job = wait_for_terminal(jobs.queue(), &cleanup).await;
    jobs.system.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["deletedJobs"], 1);
    assert!(queue.get_job(&old).unwrap().is_none());
    assert!(queue.get_job(&recent).unwrap().is_some());

    let remaining = queue
        .get_jobs(&JobFilter::default().with_type(JobType::RagSyncNews))
        .unwrap();
    assert_eq!(remaining.len(), 1);
}
