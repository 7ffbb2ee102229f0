//! Trigger evaluation.
//!
//! All stored times are UTC; cron expressions are evaluated in the
//! scheduler's configured timezone and converted back.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Compute the next UTC fire time for `trigger`.
///
/// - `Once` fires at `run_at` when it has never run; afterwards the schedule
///   is exhausted (`None`). A `run_at` already in the past still returns it,
///   so a task created (or reloaded) late fires once immediately.
/// - `Interval` counts from `max(now, last_run)`.
/// - `Cron` yields the next occurrence strictly after `from` in `tz`.
pub fn compute_next_run(
    trigger: &Trigger,
    last_run: Option<DateTime<Utc>>,
    from: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::Once { run_at } => {
            if last_run.is_some() {
                Ok(None)
            } else {
                Ok(Some(*run_at))
            }
        }

        Trigger::Interval { minutes } => {
            let base = match last_run {
                Some(lr) if lr > from => lr,
                Some(_) | None => from,
            };
            Ok(Some(base + chrono::Duration::minutes(*minutes as i64)))
        }

        Trigger::Cron { expression } => {
            let schedule = parse_cron(expression)?;
            let local = from.with_timezone(&tz);
            Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
        }
    }
}

/// Parse a standard 5-field cron expression.
///
/// The `cron` crate wants a seconds field, so `M H DOM MON DOW` becomes
/// `0 M H DOM MON DOW`. Six- and seven-field inputs pass through unchanged.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(SchedulerError::InvalidTrigger(format!(
                "cron expression needs 5 fields, got {fields}: {expression}"
            )))
        }
    };
    Schedule::from_str(&full)
        .map_err(|e| SchedulerError::InvalidTrigger(format!("{expression}: {e}")))
}

/// Resolve a timezone name, warning and falling back to UTC on nonsense.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, falling back to UTC");
        Tz::UTC
    })
}
