use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};

use crate::error::{Error, Result};

pub const TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A local wall-clock instant with second resolution, rendered as `yyyyMMdd_HHmmss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::Local::now().naive_local())
    }

    /// The "never backed up" instant, far enough in the past that every interval has elapsed.
    pub fn epoch() -> Self {
        let dt = NaiveDate::from_ymd_opt(1900, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(NaiveDateTime::MIN);
        Self(dt)
    }

    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self(dt.with_nanosecond(0).unwrap_or(dt))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != 15 {
            return None;
        }
        NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
            .ok()
            .map(Self)
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    /// Monday = 0 .. Sunday = 6.
    pub fn weekday_index(&self) -> usize {
        self.0.weekday().num_days_from_monday() as usize
    }

    pub fn hour(&self) -> usize {
        self.0.hour() as usize
    }

    /// `self - earlier`; negative when `earlier` is in the future.
    pub fn since(&self, earlier: Timestamp) -> TimeDelta {
        self.0 - earlier.0
    }

    pub fn checked_sub(&self, d: TimeDelta) -> Option<Self> {
        self.0.checked_sub_signed(d).map(Self)
    }

    pub fn checked_add(&self, d: TimeDelta) -> Option<Self> {
        self.0.checked_add_signed(d).map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIME_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Timestamp::parse(s.trim()).ok_or_else(|| {
            Error::config(format!(
                "invalid timestamp '{}' (expected yyyyMMdd_HHmmss)",
                s.trim()
            ))
        })
    }
}

/// Source of "now"; swapped out in tests.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Timestamp::now)
}

fn atom_to_delta(num: i64, unit: char) -> Option<TimeDelta> {
    match unit {
        'w' => TimeDelta::try_weeks(num),
        'd' => TimeDelta::try_days(num),
        'h' => TimeDelta::try_hours(num),
        'm' => TimeDelta::try_minutes(num),
        's' => TimeDelta::try_seconds(num),
        _ => None,
    }
}

/// Parses interval strings such as `"1w 3d 2s"` or `"90m"`.
pub fn parse_duration(raw: &str) -> Result<TimeDelta> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(Error::config("empty duration"));
    }

    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    for c in compact.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(Error::config(format!(
                "invalid duration '{raw}': unit '{c}' without a number"
            )));
        }
        let num: i64 = digits
            .parse()
            .map_err(|e| Error::config(format!("invalid duration '{raw}': {e}")))?;
        let delta = atom_to_delta(num, c).ok_or_else(|| {
            Error::config(format!(
                "invalid duration '{raw}': unknown unit '{c}' (expected w/d/h/m/s)"
            ))
        })?;
        total = total
            .checked_add(&delta)
            .ok_or_else(|| Error::config(format!("duration '{raw}' overflows")))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(Error::config(format!(
            "invalid duration '{raw}': trailing number without unit"
        )));
    }
    Ok(total)
}

pub fn format_duration(d: TimeDelta) -> String {
    let mut secs = d.num_seconds();
    if secs == 0 {
        return "0s".into();
    }
    let mut out = String::new();
    if secs < 0 {
        out.push('-');
        secs = -secs;
    }
    for (unit, len) in [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)] {
        let n = secs / len;
        if n > 0 {
            out.push_str(&format!("{n}{unit}"));
            secs %= len;
        }
    }
    out
}
