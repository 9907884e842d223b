// src/scheduler/schedule.rs
//! When a source is due: fixed interval or a standard 5-field cron expression (UTC).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression `{expr}`: {reason}")]
pub struct CronParseError {
    pub expr: String,
    pub reason: String,
}

/// Parsed `minute hour day-of-month month day-of-week`. Fields support `*`, lists, ranges
/// and steps. Day-of-week is 0–7 with both 0 and 7 meaning Sunday. When both day fields
/// are restricted a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    let mut mask = 0u64;
    let mut restricted = true;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("bad step `{s}`"))?;
                if step == 0 {
                    return Err("step must be positive".into());
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            if step == 1 {
                restricted = false;
            }
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| format!("bad value `{a}`"))?;
            let b: u32 = b.parse().map_err(|_| format!("bad value `{b}`"))?;
            (a, b)
        } else {
            let v: u32 = range.parse().map_err(|_| format!("bad value `{range}`"))?;
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(format!("`{part}` outside {min}-{max}"));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok((mask, restricted && field != "*"))
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let err = |reason: String| CronParseError {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(err(format!("expected 5 fields, got {}", fields.len())));
        }
        let (minutes, _) = parse_field(fields[0], 0, 59).map_err(err)?;
        let (hours, _) = parse_field(fields[1], 0, 23).map_err(err)?;
        let (days, days_restricted) = parse_field(fields[2], 1, 31).map_err(err)?;
        let (months, _) = parse_field(fields[3], 1, 12).map_err(err)?;
        let (mut weekdays, weekdays_restricted) = parse_field(fields[4], 0, 7).map_err(err)?;
        if weekdays & (1 << 7) != 0 {
            weekdays |= 1;
        }
        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            days_restricted,
            weekdays_restricted,
        })
    }
}

impl CronExpr {
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days & (1 << t.day()) != 0;
        let dow = self.weekdays & (1 << t.weekday().num_days_from_sunday()) != 0;
        match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`. `None` if nothing matches within
    /// five years (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let limit = after
            .checked_add_signed(Duration::days(366 * 5))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        while t <= limit {
            if self.months & (1 << t.month()) == 0 {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = t.checked_add_signed(Duration::days(1))?.with_hour(0)?.with_minute(0)?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t.checked_add_signed(Duration::hours(1))?.with_minute(0)?;
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t = t.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(t);
        }
        None
    }
}

/// Longest accepted interval: one year.
pub const MAX_INTERVAL_MINUTES: u64 = 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    IntervalMinutes(u64),
    Cron(String),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::IntervalMinutes(60)
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<(), CronParseError> {
        match self {
            Schedule::IntervalMinutes(0) => Err(CronParseError {
                expr: "interval 0".into(),
                reason: "interval must be at least one minute".into(),
            }),
            Schedule::IntervalMinutes(m) if *m > MAX_INTERVAL_MINUTES => Err(CronParseError {
                expr: format!("interval {m}"),
                reason: format!("interval must be at most {MAX_INTERVAL_MINUTES} minutes"),
            }),
            Schedule::IntervalMinutes(_) => Ok(()),
            Schedule::Cron(expr) => expr.parse::<CronExpr>().map(|_| ()),
        }
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::IntervalMinutes(m) => {
                let minutes = i64::try_from((*m).max(1)).ok()?;
                after.checked_add_signed(Duration::try_minutes(minutes)?)
            }
            Schedule::Cron(expr) => expr.parse::<CronExpr>().ok()?.next_after(after),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::IntervalMinutes(m) => write!(f, "every {m}m"),
            Schedule::Cron(expr) => write!(f, "cron({expr})"),
        }
    }
}
