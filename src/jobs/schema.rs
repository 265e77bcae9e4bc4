//! Database schema for the jobs database.
//!
//! Holds the `background_jobs` queue table and the `cron_schedules` table.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 0
// =============================================================================

const BACKGROUND_JOBS_TABLE_V0: Table = Table {
    name: "background_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "type",
            &SqlType::Text,
            non_null = true,
            check = Some(
                "type IN ('rag_sync_channel', 'rag_sync_news', 'rag_sync_trends', 'embedding_generation', 'video_assembly', 'cv_batch_analysis', 'cache_cleanup')"
            )
        ),
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'pending'"),
            check = Some(
                "status IN ('pending', 'running', 'completed', 'failed', 'cancelled')"
            )
        ),
        sqlite_column!(
            "priority",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("5"),
            check = Some("priority BETWEEN 1 AND 10")
        ),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("result", &SqlType::Text),
        sqlite_column!(
            "progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0"),
            check = Some("progress BETWEEN 0 AND 100")
        ),
        sqlite_column!(
            "attempt",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "max_attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("3")
        ),
        sqlite_column!("project_id", &SqlType::Text),
        // Timestamps are Unix milliseconds
        sqlite_column!("scheduled_for", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_jobs_status", "status"),
        ("idx_jobs_type", "type"),
        ("idx_jobs_scheduled", "scheduled_for"),
        ("idx_jobs_project", "project_id"),
        ("idx_jobs_claim", "status, priority, created_at"),
    ],
};

const CRON_SCHEDULES_TABLE_V0: Table = Table {
    name: "cron_schedules",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "job_type",
            &SqlType::Text,
            non_null = true,
            check = Some(
                "job_type IN ('rag_sync_channel', 'rag_sync_news', 'rag_sync_trends', 'embedding_generation', 'video_assembly', 'cv_batch_analysis', 'cache_cleanup')"
            )
        ),
        sqlite_column!("cron_expression", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!(
            "enabled",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("last_run", &SqlType::Integer),
        sqlite_column!("next_run", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[BACKGROUND_JOBS_TABLE_V0, CRON_SCHEDULES_TABLE_V0],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = JOBS_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).expect("Schema should create successfully");
        schema.validate(&conn).expect("Schema should validate successfully");
    }

    #[test]
    fn test_column_defaults_applied() {
        let conn = Connection::open_in_memory().unwrap();
        JOBS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        conn.execute(
            "INSERT INTO background_jobs (id, type, payload, created_at, updated_at) VALUES ('j1', 'cache_cleanup', '{}', 1, 1)",
            [],
        )
        .unwrap();

        let (status, priority, progress, attempt, max_attempts): (String, i64, i64, i64, i64) =
            conn.query_row(
                "SELECT status, priority, progress, attempt, max_attempts FROM background_jobs WHERE id = 'j1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(priority, 5);
        assert_eq!(progress, 0);
        assert_eq!(attempt, 0);
        assert_eq!(max_attempts, 3);
    }

    #[test]
    fn test_check_constraints_reject_bad_rows() {
        let conn = Connection::open_in_memory().unwrap();
        JOBS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let bad_status = conn.execute(
            "INSERT INTO background_jobs (id, type, status, payload, created_at, updated_at) VALUES ('a', 'cache_cleanup', 'paused', '{}', 1, 1)",
            [],
        );
        assert!(bad_status.is_err());

        let bad_priority = conn.execute(
            "INSERT INTO background_jobs (id, type, priority, payload, created_at, updated_at) VALUES ('b', 'cache_cleanup', 0, '{}', 1, 1)",
            [],
        );
        assert!(bad_priority.is_err());

        let bad_progress = conn.execute(
            "INSERT INTO background_jobs (id, type, progress, payload, created_at, updated_at) VALUES ('c', 'cache_cleanup', 101, '{}', 1, 1)",
            [],
        );
        assert!(bad_progress.is_err());

        let bad_type = conn.execute(
            "INSERT INTO background_jobs (id, type, payload, created_at, updated_at) VALUES ('d', 'legacy_type', '{}', 1, 1)",
            [],
        );
        assert!(bad_type.is_err());

        let bad_schedule_type = conn.execute(
            "INSERT INTO cron_schedules (id, name, job_type, cron_expression, payload, created_at) VALUES ('s', 'Legacy', 'legacy_type', '0 * * * *', '{}', 1)",
            [],
        );
        assert!(bad_schedule_type.is_err());
    }

    #[test]
    fn test_every_job_type_accepted() {
        let conn = Connection::open_in_memory().unwrap();
        JOBS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        for (i, job_type) in JobType::ALL.iter().enumerate() {
            conn.execute(
                "INSERT INTO background_jobs (id, type, payload, created_at, updated_at) VALUES (?1, ?2, '{}', 1, 1)",
                rusqlite::params![format!("job-{}", i), job_type.as_str()],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO cron_schedules (id, name, job_type, cron_expression, payload, created_at) VALUES (?1, ?1, ?2, '0 * * * *', '{}', 1)",
                rusqlite::params![format!("schedule-{}", i), job_type.as_str()],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_schedule_name_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        JOBS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let insert = "INSERT INTO cron_schedules (id, name, job_type, cron_expression, payload, created_at) VALUES (?1, 'News Fetch', 'rag_sync_news', '0 */4 * * *', '{}', 1)";
        conn.execute(insert, ["s1"]).unwrap();
        assert!(conn.execute(insert, ["s2"]).is_err());
    }
}
