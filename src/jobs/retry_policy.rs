//! Retry policy for failed jobs.
//!
//! Exponential backoff: a job that failed on attempt `n` becomes eligible
//! again `initial_backoff_secs * multiplier^n` seconds later. With the
//! defaults that is `2^n` seconds and no cap.

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff for attempt 0, in seconds.
    pub initial_backoff_secs: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Optional cap for exponential growth, in seconds.
    pub max_backoff_secs: Option<u64>,
}

impl RetryPolicy {
    pub fn with_max_backoff_secs(mut self, max_backoff_secs: u64) -> Self {
        self.max_backoff_secs = Some(max_backoff_secs);
        self
    }

    /// Whether a job that has been claimed `attempt` times may run again.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// Backoff in seconds after the given attempt count.
    pub fn backoff_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        match self.max_backoff_secs {
            Some(cap) => backoff.min(cap as f64),
            None => backoff,
        }
    }

    /// Earliest time a job that failed after `attempt` claims becomes eligible again.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        // f64 -> i64 casts saturate, so huge backoffs land on the far future
        let millis = (self.backoff_secs(attempt) * 1000.0) as i64;
        TimeDelta::try_milliseconds(millis)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            backoff_multiplier: 2.0,
            max_backoff_secs: None,
        }
    }
}
