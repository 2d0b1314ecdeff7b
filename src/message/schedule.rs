//! Delivery scheduling: cron expressions, one-shot delays and fixed repeats.
//!
//! A message carrying a schedule is published as a template in the scheduled
//! sorted set. Every time it fires, a child message is forked into pending and
//! the template is moved to its next timestamp, or removed after its last run.

use crate::error::{SmithyError, SmithyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When a message should be delivered. Exactly one kind per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageSchedule {
    /// Seconds-first cron expression, e.g. `0 */5 * * * *`
    Cron(String),
    /// Deliver once after the given delay (ms)
    Delay(u64),
    /// Deliver `count` times, `period` ms apart
    #[serde(rename_all = "camelCase")]
    Repeat {
        /// Milliseconds between deliveries
        period: u64,
        /// Number of deliveries
        count: u32,
    },
}

impl MessageSchedule {
    /// Check the schedule is usable
    pub fn validate(&self) -> SmithyResult<()> {
        match self {
            MessageSchedule::Cron(expr) => {
                parse_cron(expr)?;
            }
            MessageSchedule::Delay(delay) => {
                if *delay == 0 {
                    return Err(SmithyError::invalid_message("schedule delay must be > 0"));
                }
            }
            MessageSchedule::Repeat { period, count } => {
                if *period == 0 || *count == 0 {
                    return Err(SmithyError::invalid_message(
                        "repeat period and count must be > 0",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Timestamp (ms) of the next delivery, given how many times the
    /// schedule already fired. `None` once the schedule is exhausted.
    pub fn next_timestamp(&self, fired_times: u64, now: u64) -> SmithyResult<Option<u64>> {
        match self {
            MessageSchedule::Delay(delay) => {
                if fired_times > 0 {
                    return Ok(None);
                }
                offset(now, *delay).map(Some)
            }
            MessageSchedule::Repeat { period, count } => {
                if fired_times >= u64::from(*count) {
                    return Ok(None);
                }
                offset(now, *period).map(Some)
            }
            MessageSchedule::Cron(expr) => {
                let schedule = parse_cron(expr)?;
                let after = DateTime::<Utc>::from_timestamp_millis(now as i64).ok_or_else(|| {
                    SmithyError::invalid_message(format!("timestamp {} out of range", now))
                })?;
                Ok(schedule
                    .after(&after)
                    .next()
                    .map(|next| next.timestamp_millis().max(0) as u64))
            }
        }
    }
}

fn offset(now: u64, by: u64) -> SmithyResult<u64> {
    now.checked_add(by).ok_or_else(|| {
        SmithyError::invalid_message(format!("schedule offset {}ms overflows the clock", by))
    })
}

fn parse_cron(expr: &str) -> SmithyResult<cron::Schedule> {
    cron::Schedule::from_str(expr).map_err(|e| {
        SmithyError::invalid_message(format!("invalid cron expression '{}': {}", expr, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn test_huge_offsets_are_rejected() {
        let err = MessageSchedule::Delay(u64::MAX).next_timestamp(0, NOW).unwrap_err();
        assert!(matches!(err, SmithyError::InvalidMessage { .. }));

        let repeat = MessageSchedule::Repeat {
            period: u64::MAX,
            count: 2,
        };
        let err = repeat.next_timestamp(0, NOW).unwrap_err();
        assert!(matches!(err, SmithyError::InvalidMessage { .. }));
        // an exhausted schedule never computes an offset
        assert_eq!(repeat.next_timestamp(2, NOW).unwrap(), None);
    }

    #[test]
    fn test_delay_fires_once() {
        let schedule = MessageSchedule::Delay(5_000);
        assert_eq!(schedule.next_timestamp(0, NOW).unwrap(), Some(NOW + 5_000));
        assert_eq!(schedule.next_timestamp(1, NOW).unwrap(), None);
    }

    #[test]
    fn test_repeat_fires_count_times() {
        let schedule = MessageSchedule::Repeat {
            period: 1_000,
            count: 3,
        };
        assert_eq!(schedule.next_timestamp(0, NOW).unwrap(), Some(NOW + 1_000));
        assert_eq!(schedule.next_timestamp(2, NOW).unwrap(), Some(NOW + 1_000));
        assert_eq!(schedule.next_timestamp(3, NOW).unwrap(), None);
    }

    #[test]
    fn test_cron_next_tick() {
        // every 10 seconds
        let schedule = MessageSchedule::Cron("*/10 * * * * *".to_string());
        let next = schedule.next_timestamp(0, NOW).unwrap().unwrap();
        assert!(next > NOW);
        assert!(next <= NOW + 10_000);
        assert_eq!(next % 10_000, 0);
        // cron never runs out
        assert!(schedule.next_timestamp(1_000, NOW).unwrap().is_some());
    }

    #[test]
    fn test_validation() {
        assert!(MessageSchedule::Delay(0).validate().is_err());
        assert!(MessageSchedule::Repeat { period: 0, count: 1 }.validate().is_err());
        assert!(MessageSchedule::Cron("not a cron".into()).validate().is_err());
        assert!(MessageSchedule::Cron("0 0 * * * *".into()).validate().is_ok());
    }
}
