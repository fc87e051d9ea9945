// src/scheduler/cron.rs

//! Five-field cron expressions evaluated in UTC.
//!
//! Grammar: `minute hour day-of-month month day-of-week`, each field a
//! comma-separated list of `*`, `N`, `N-M`, with an optional `/step`.
//! Months accept `jan`..`dec`, weekdays `sun`..`sat`, and `7` is Sunday.
//! The `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`
//! and `@hourly` shorthands are accepted.
//!
//! Day matching follows Vixie cron: when both day-of-month and day-of-week
//! are restricted, a day matches if *either* does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Timelike, Utc};

use crate::errors::StevedoreError;

/// How far ahead `next_after` searches before concluding a schedule never
/// fires (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: u64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Whether `t` (truncated to the minute) is a firing time.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours as u64, t.hour())
            && bit(self.months as u64, t.month())
            && self.day_matches(t.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month as u64, date.day());
        let dow = bit(
            self.days_of_week as u64,
            date.weekday().num_days_from_sunday(),
        );
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First firing time strictly after `after`.
    ///
    /// Returns `None` if the expression cannot fire within five years.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(after) + Duration::minutes(1);
        let limit = after.date_naive().checked_add_days(Days::new(SEARCH_HORIZON_DAYS))?;
        let mut t = start;

        while t.date_naive() <= limit {
            if !bit(self.months as u64, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !bit(self.hours as u64, t.hour()) {
                t = truncate_to_hour(t) + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// All firing times in `[start, end]`, ascending.
    pub fn occurrences(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.occurrences_within(start, end, usize::MAX)
            .unwrap_or_default()
    }

    /// Firing times in `[start, end]`, or `None` as soon as there are more
    /// than `limit` of them.
    pub fn occurrences_within(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Option<Vec<DateTime<Utc>>> {
        let mut out = Vec::new();
        let mut cursor = start - Duration::seconds(1);
        while let Some(next) = self.next_after(cursor) {
            if next > end {
                break;
            }
            if next >= start {
                if out.len() == limit {
                    return None;
                }
                out.push(next);
            }
            cursor = next;
        }
        Some(out)
    }

    /// Latest firing time at or before `now`, searching forward from
    /// `from` (itself a firing time at or before `now`).
    pub fn latest_at_or_before(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut latest = from;
        // Long outages: jump close to `now` instead of walking every minute.
        if now - latest > Duration::days(1) {
            if let Some(candidate) = self.next_after(now - Duration::days(1)) {
                if candidate <= now {
                    latest = candidate;
                }
            }
        }
        while let Some(next) = self.next_after(latest) {
            if next > now {
                break;
            }
            latest = next;
        }
        latest
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl FromStr for CronSchedule {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.trim();
        let err = |reason: String| StevedoreError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let expanded = match expr.to_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            other if other.starts_with('@') => {
                return Err(err(format!("unknown shorthand '{other}'")));
            }
            _ => expr.to_string(),
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(err(format!("expected 5 fields, found {}", fields.len())));
        };

        let days_of_week = parse_field(dow, 0, 7, Some(&DAY_NAMES)).map_err(err)?;
        // 7 is an alias for Sunday.
        let days_of_week = (days_of_week | ((days_of_week >> 7) & 1)) & 0x7f;

        Ok(Self {
            expr: expr.to_string(),
            minutes: parse_field(minute, 0, 59, None).map_err(err)?,
            hours: parse_field(hour, 0, 23, None).map_err(err)? as u32,
            days_of_month: parse_field(dom, 1, 31, None).map_err(err)? as u32,
            months: parse_field(month, 1, 12, Some(&MONTH_NAMES)).map_err(err)? as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: !dom.starts_with('*'),
            dow_restricted: !dow.starts_with('*'),
        })
    }
}

fn bit(set: u64, n: u32) -> bool {
    n < 64 && set & (1u64 << n) != 0
}

/// Parse one field into a bitset over `[min, max]`.
fn parse_field(field: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u64, String> {
    let mut set = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in '{field}'"));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in '{item}'"))?;
                if step == 0 {
                    return Err(format!("step must be positive in '{item}'"));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names, min)?, parse_value(b, names, min)?)
        } else {
            let v = parse_value(range, names, min)?;
            // `N/step` means "from N to the end of the range".
            if item.contains('/') { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("'{item}' is outside {min}-{max}"));
        }

        let mut v = lo;
        while v <= hi {
            set |= 1u64 << v;
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(s: &str, names: Option<&[&str]>, min: u32) -> Result<u32, String> {
    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }
    let lower = s.to_lowercase();
    names
        .and_then(|names| names.iter().position(|n| *n == lower))
        .map(|idx| idx as u32 + min)
        .ok_or_else(|| format!("invalid value '{s}'"))
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t).with_minute(0).unwrap_or(t)
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (y, m) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}
