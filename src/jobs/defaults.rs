use super::models::{JobType, JsonMap, NewSchedule};
use serde_json::json;

/// Schedules seeded on first boot. Seeding is insert-if-absent by name, so
/// runtime edits to these rows survive restarts.
pub fn default_schedules() -> Vec<NewSchedule> {
    let mut cleanup_payload = JsonMap::new();
    cleanup_payload.insert("maxAgeDays".to_string(), json!(30));

    vec![
        NewSchedule::new("Daily RAG Channel Sync", JobType::RagSyncChannel, "0 6 * * *"),
        NewSchedule::new("News Fetch", JobType::RagSyncNews, "0 */4 * * *"),
        NewSchedule::new("Weekly Cache Cleanup", JobType::CacheCleanup, "0 3 * * 0")
            .with_payload(cleanup_payload),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cron_expr;

    #[test]
    fn test_defaults_are_valid_and_enabled() {
        let schedules = default_schedules();
        assert_eq!(schedules.len(), 3);
        for schedule in &schedules {
            assert!(schedule.enabled);
            cron_expr::validate(&schedule.cron_expression).unwrap();
        }
        assert_eq!(schedules[2].payload["maxAgeDays"], 30);
    }
}
