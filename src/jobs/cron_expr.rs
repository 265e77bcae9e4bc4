//! Cron expression parsing.
//!
//! Accepts the standard 5-field form (`min hour dom month dow`) and the
//! 6-field form with a leading seconds field. Expressions are evaluated in UTC.

use crate::error::JobsError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Clone)]
pub struct CronExpr {
    expression: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, JobsError> {
        let invalid = |reason: String| JobsError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let day_of_week = normalize_day_of_week(fields[4]).map_err(invalid)?;
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], day_of_week
                )
            }
            6 => fields.join(" "),
            0 => return Err(invalid("expression is empty".to_string())),
            n => return Err(invalid(format!("expected 5 or 6 fields, got {}", n))),
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Next occurrence from now.
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.expression).finish()
    }
}

/// Check an expression without keeping the parsed schedule.
pub fn validate(expression: &str) -> Result<(), JobsError> {
    CronExpr::parse(expression).map(|_| ())
}

/// Rewrite numeric day-of-week values (0-7, Sunday is 0 or 7) as day names,
/// since the parser numbers days 1-7 starting from Sunday.
///
/// A range ending in 7 wraps past Saturday, which the parser cannot express,
/// so it is spelled out as a list of days.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((start, "7")) => return expand_to_sunday(start, step),
                Some((start, end)) => format!("{}-{}", day_name(start)?, day_name(end)?),
                None => day_name(range)?,
            };
            Ok(match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, String>>()
        .map(|parts| parts.join(","))
}

fn expand_to_sunday(start: &str, step: Option<&str>) -> Result<String, String> {
    let start = match DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(start))
    {
        Some(day) => day,
        None => match start.parse::<usize>() {
            Ok(day @ 0..=7) => day,
            _ => return Err(format!("day of week '{}' out of range 0-7", start)),
        },
    };
    let step = match step {
        Some(step) => match step.parse::<usize>() {
            Ok(step) if step > 0 => step,
            _ => return Err(format!("invalid day of week step '{}'", step)),
        },
        None => 1,
    };

    let mut days: Vec<&str> = Vec::new();
    for day in (start..=7).step_by(step) {
        let name = DAY_NAMES[day % 7];
        if !days.contains(&name) {
            days.push(name);
        }
    }
    Ok(days.join(","))
}

fn day_name(value: &str) -> Result<String, String> {
    if value == "*" || value == "?" || !value.chars().all(|c| c.is_ascii_digit()) {
        return Ok(value.to_string());
    }
    match value.parse::<usize>() {
        Ok(day @ 0..=6) => Ok(DAY_NAMES[day].to_string()),
        Ok(7) => Ok(DAY_NAMES[0].to_string()),
        _ => Err(format!("day of week '{}' out of range 0-7", value)),
    }
}
