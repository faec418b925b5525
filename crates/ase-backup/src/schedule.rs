//! Pure run/skip decisions for full and incremental backups.

use chrono::TimeDelta;

use crate::error::{Error, Result};
use crate::timing::Timestamp;

pub const WEEKDAYS: [&str; 7] = ["mo", "tu", "we", "th", "fr", "sa", "su"];

/// Per-weekday, per-hour table of when routine full backups may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourMask {
    days: [[bool; 24]; 7],
}

impl HourMask {
    pub fn always() -> Self {
        Self {
            days: [[true; 24]; 7],
        }
    }

    pub fn from_days(days: [[bool; 24]; 7]) -> Self {
        Self { days }
    }

    /// Parses `"111111111000000000011111"`; whitespace is ignored, exactly 24 digits required.
    pub fn parse_day(raw: &str) -> Result<[bool; 24]> {
        let mut out = [false; 24];
        let mut n = 0usize;
        for c in raw.chars().filter(|c| !c.is_whitespace()) {
            let v = match c {
                '1' => true,
                '0' => false,
                _ => {
                    return Err(Error::config(format!(
                        "invalid hour mask '{raw}': unexpected '{c}'"
                    )));
                }
            };
            if n >= 24 {
                return Err(Error::config(format!(
                    "invalid hour mask '{raw}': more than 24 hours"
                )));
            }
            out[n] = v;
            n += 1;
        }
        if n != 24 {
            return Err(Error::config(format!(
                "invalid hour mask '{raw}': expected 24 hours, got {n}"
            )));
        }
        Ok(out)
    }

    /// `day` is 0 for Monday.
    pub fn allows_hour(&self, day: usize, hour: usize) -> bool {
        self.days
            .get(day)
            .and_then(|d| d.get(hour))
            .copied()
            .unwrap_or(false)
    }

    pub fn allows(&self, t: Timestamp) -> bool {
        self.allows_hour(t.weekday_index(), t.hour())
    }

    pub fn render_day(&self, day: usize) -> String {
        self.days
            .get(day)
            .map(|d| d.iter().map(|b| if *b { '1' } else { '0' }).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub hours: HourMask,
    pub min_interval: TimeDelta,
    pub max_interval: TimeDelta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalSchedule {
    pub min_interval: TimeDelta,
}

pub fn should_run_full(
    now: Timestamp,
    forced: bool,
    last_full_end: Option<Timestamp>,
    schedule: &Schedule,
) -> bool {
    let allowed = schedule.hours.allows(now);
    let age = now.since(last_full_end.unwrap_or_else(Timestamp::epoch));
    forced || age > schedule.max_interval || (allowed && age > schedule.min_interval)
}

/// Incrementals are not gated by the hour mask.
pub fn should_run_incremental(
    now: Timestamp,
    forced: bool,
    last_incremental_end: Option<Timestamp>,
    min_interval: TimeDelta,
) -> bool {
    forced || now.since(last_incremental_end.unwrap_or_else(Timestamp::epoch)) > min_interval
}
