//! Persistence for `cron_schedules` rows.

use super::database::JobsDatabase;
use super::models::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

#[derive(Clone)]
pub struct ScheduleStore {
    db: JobsDatabase,
}

impl ScheduleStore {
    pub fn new(db: JobsDatabase) -> Self {
        Self { db }
    }

    fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<CronSchedule> {
        let job_type_idx = row.as_ref().column_index("job_type")?;
        let job_type_str: String = row.get(job_type_idx)?;
        let job_type = JobType::from_str(&job_type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                job_type_idx,
                rusqlite::types::Type::Text,
                format!("unknown job type: {}", job_type_str).into(),
            )
        })?;

        let payload_idx = row.as_ref().column_index("payload")?;
        let payload: JsonMap =
            serde_json::from_str(&row.get::<_, String>(payload_idx)?).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload_idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(CronSchedule {
            id: row.get("id")?,
            name: row.get("name")?,
            job_type,
            cron_expression: row.get("cron_expression")?,
            payload,
            enabled: row.get::<_, i64>("enabled")? != 0,
            last_run: from_millis_opt(0, row.get("last_run")?)?,
            next_run: from_millis_opt(0, row.get("next_run")?)?,
            created_at: from_millis(0, row.get("created_at")?)?,
        })
    }

    fn query_list(&self, sql: &str) -> Result<Vec<CronSchedule>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let schedules = stmt
            .query_map([], Self::row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    pub fn insert(&self, schedule: &NewSchedule) -> Result<CronSchedule> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO cron_schedules (id, name, job_type, cron_expression, payload, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                schedule.name,
                schedule.job_type.as_str(),
                schedule.cron_expression,
                serde_json::to_string(&schedule.payload)?,
                schedule.enabled as i64,
                to_millis(now),
            ],
        )
        .with_context(|| format!("Failed to insert schedule '{}'", schedule.name))?;

        Ok(CronSchedule {
            id,
            name: schedule.name.clone(),
            job_type: schedule.job_type,
            cron_expression: schedule.cron_expression.clone(),
            payload: schedule.payload.clone(),
            enabled: schedule.enabled,
            last_run: None,
            next_run: None,
            // Stored with millisecond precision
            created_at: from_millis(0, to_millis(now))?,
        })
    }

    /// Insert unless a schedule with the same name exists. Returns true if inserted.
    pub fn insert_if_absent(&self, schedule: &NewSchedule) -> Result<bool> {
        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO cron_schedules (id, name, job_type, cron_expression, payload, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO NOTHING",
            params![
                uuid::Uuid::new_v4().to_string(),
                schedule.name,
                schedule.job_type.as_str(),
                schedule.cron_expression,
                serde_json::to_string(&schedule.payload)?,
                schedule.enabled as i64,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<CronSchedule>> {
        let conn = self.db.lock()?;
        let schedule = conn
            .query_row(
                "SELECT * FROM cron_schedules WHERE id = ?1",
                params![id],
                Self::row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<CronSchedule>> {
        let conn = self.db.lock()?;
        let schedule = conn
            .query_row(
                "SELECT * FROM cron_schedules WHERE name = ?1",
                params![name],
                Self::row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    pub fn list_all(&self) -> Result<Vec<CronSchedule>> {
        self.query_list("SELECT * FROM cron_schedules ORDER BY name ASC")
    }

    pub fn list_enabled(&self) -> Result<Vec<CronSchedule>> {
        self.query_list("SELECT * FROM cron_schedules WHERE enabled = 1 ORDER BY name ASC")
    }

    /// Apply a partial patch. Returns false if no such schedule.
    pub fn update(&self, id: &str, update: &ScheduleUpdate) -> Result<bool> {
        let mut assignments: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = &update.name {
            assignments.push("name = ?");
            values.push(Value::Text(name.clone()));
        }
        if let Some(job_type) = update.job_type {
            assignments.push("job_type = ?");
            values.push(Value::Text(job_type.as_str().to_string()));
        }
        if let Some(cron_expression) = &update.cron_expression {
            assignments.push("cron_expression = ?");
            values.push(Value::Text(cron_expression.clone()));
        }
        if let Some(payload) = &update.payload {
            assignments.push("payload = ?");
            values.push(Value::Text(serde_json::to_string(payload)?));
        }
        if let Some(enabled) = update.enabled {
            assignments.push("enabled = ?");
            values.push(Value::Integer(enabled as i64));
        }
        if assignments.is_empty() {
            return Ok(self.get(id)?.is_some());
        }
        values.push(Value::Text(id.to_string()));

        let conn = self.db.lock()?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE cron_schedules SET {} WHERE id = ?",
                    assignments.join(", ")
                ),
                params_from_iter(values),
            )
            .context("Failed to update schedule")?;
        Ok(updated > 0)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE cron_schedules SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE cron_schedules SET last_run = ?1 WHERE id = ?2",
            params![to_millis(at), id],
        )?;
        Ok(())
    }

    pub fn set_next_run(&self, id: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE cron_schedules SET next_run = ?1 WHERE id = ?2",
            params![at.map(to_millis), id],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let deleted = conn.execute("DELETE FROM cron_schedules WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
