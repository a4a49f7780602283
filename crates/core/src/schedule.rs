//! Recurrence schedules for cron-style work items.
//!
//! Evaluation is pure: given the last run and the current time it yields the
//! next fire time strictly after `now`. Cron syntax is handled by the `cron`
//! crate (6 or 7 fields, seconds first).

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest accepted interval (366 days).
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression, e.g. `"0 */5 * * * *"`.
    Cron { expression: String },
    /// Fixed interval measured from the previous run.
    Interval { every_secs: u64 },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> DomainResult<Self> {
        let schedule = Self::Cron {
            expression: expression.into(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn every(interval: std::time::Duration) -> DomainResult<Self> {
        let schedule = Self::Interval {
            every_secs: interval.as_secs(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
            Schedule::Interval { every_secs } if *every_secs == 0 => {
                Err(DomainError::schedule("interval must be at least one second"))
            }
            Schedule::Interval { every_secs } if *every_secs > MAX_INTERVAL_SECS => Err(
                DomainError::schedule(format!("interval must not exceed {MAX_INTERVAL_SECS} seconds")),
            ),
            Schedule::Interval { .. } => Ok(()),
        }
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(
        &self,
        last_executed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<DateTime<Utc>> {
        match self {
            Schedule::Cron { expression } => {
                let schedule = parse_cron(expression)?;
                schedule
                    .after(&now)
                    .find(|t| *t > now)
                    .ok_or_else(|| {
                        DomainError::schedule(format!("'{expression}' has no future fire time"))
                    })
            }
            Schedule::Interval { every_secs } => {
                let every_secs = i64::try_from(*every_secs)
                    .map_err(|_| DomainError::schedule("interval too large"))?;
                if every_secs <= 0 {
                    return Err(DomainError::schedule("interval must be at least one second"));
                }
                let anchor = match last_executed_at {
                    Some(last) if last <= now => last,
                    _ => now,
                };
                let elapsed = (now - anchor).num_seconds();
                let periods = elapsed / every_secs + 1;
                periods
                    .checked_mul(every_secs)
                    .and_then(Duration::try_seconds)
                    .and_then(|offset| anchor.checked_add_signed(offset))
                    .ok_or_else(|| DomainError::schedule("next fire time out of range"))
            }
        }
    }
}

fn parse_cron(expression: &str) -> DomainResult<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| DomainError::schedule(format!("'{expression}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn cron_next_is_strictly_after_now() {
        let schedule = Schedule::cron("0 */5 * * * *").unwrap();

        // Exactly on a fire time: must move to the following one.
        assert_eq!(schedule.next_after(None, at(10, 5, 0)).unwrap(), at(10, 10, 0));
        assert_eq!(schedule.next_after(None, at(10, 7, 30)).unwrap(), at(10, 10, 0));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(matches!(
            Schedule::cron("every tuesday"),
            Err(DomainError::Schedule(_))
        ));
    }

    #[test]
    fn interval_skips_missed_periods() {
        let schedule = Schedule::every(std::time::Duration::from_secs(60)).unwrap();
        let last = at(10, 0, 0);

        assert_eq!(schedule.next_after(Some(last), at(10, 0, 30)).unwrap(), at(10, 1, 0));
        // Several periods missed: next fire is the first one after now, not a backlog.
        assert_eq!(schedule.next_after(Some(last), at(10, 5, 10)).unwrap(), at(10, 6, 0));
        // Exactly on a boundary still moves forward.
        assert_eq!(schedule.next_after(Some(last), at(10, 2, 0)).unwrap(), at(10, 3, 0));
    }

    #[test]
    fn interval_without_history_starts_from_now() {
        let schedule = Schedule::Interval { every_secs: 30 };
        assert_eq!(schedule.next_after(None, at(8, 0, 0)).unwrap(), at(8, 0, 30));
    }

    #[test]
    fn zero_interval_is_invalid() {
        assert!(Schedule::every(std::time::Duration::ZERO).is_err());
    }

    #[test]
    fn oversized_interval_is_rejected_not_panicking() {
        let huge = Schedule::Interval { every_secs: u64::MAX / 4 };
        assert!(matches!(huge.validate(), Err(DomainError::Schedule(_))));
        assert!(matches!(huge.next_after(None, at(8, 0, 0)), Err(DomainError::Schedule(_))));

        // Within i64 but past chrono's range.
        let far = Schedule::Interval { every_secs: i64::MAX as u64 / 2 };
        assert!(far.validate().is_err());
        assert!(matches!(far.next_after(None, at(8, 0, 0)), Err(DomainError::Schedule(_))));

        let longest = Schedule::Interval { every_secs: MAX_INTERVAL_SECS };
        assert!(longest.validate().is_ok());
        assert!(longest.next_after(None, at(8, 0, 0)).is_ok());
    }
}
