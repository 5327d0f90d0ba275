//! Minimal cron expressions for scheduled jobs
//!
//! Accepts 5 fields (`min hour dom month dow`) or 6 with a leading seconds
//! field. Each field takes `*`, a value, a range `a-b`, a step (`*/n`,
//! `a-b/n`, `a/n`) or a comma-separated list of those. Day-of-week is 0-6
//! with Sunday as 0 (7 is accepted as Sunday). When both day fields are
//! restricted a day matches if either does, as in classic cron.

use crate::error::SchedulerError;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Upper bound on search steps; a valid expression matches well within it
const MAX_SEARCH_STEPS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    wildcard: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(invalid(expr, format!("expected 5 or 6 fields, got {}", n)));
            }
        };

        let mut days_of_week = parse_field(expr, rest[4], 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            expr: expr.to_string(),
            seconds: parse_field(expr, sec, 0, 59)?,
            minutes: parse_field(expr, rest[0], 0, 59)?,
            hours: parse_field(expr, rest[1], 0, 23)?,
            days_of_month: parse_field(expr, rest[2], 1, 31)?,
            months: parse_field(expr, rest[3], 1, 12)?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// First matching instant strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + ChronoDuration::seconds(1);
        let mut t = start;

        for _ in 0..MAX_SEARCH_STEPS {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + ChronoDuration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + ChronoDuration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += ChronoDuration::seconds(1);
                continue;
            }
            return Some(t.and_utc());
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.wildcard, self.days_of_week.wildcard) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<FieldSet, SchedulerError> {
    let mut bits = 0u64;
    let wildcard = field == "*" || field == "?";

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expr, format!("bad step in '{}'", part)))?;
                if step == 0 {
                    return Err(invalid(expr, format!("zero step in '{}'", part)));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(expr, a, min, max)?, parse_value(expr, b, min, max)?)
        } else {
            let value = parse_value(expr, range, min, max)?;
            // `a/n` runs from a to the end of the field
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if lo > hi {
            return Err(invalid(expr, format!("empty range '{}'", part)));
        }
        let mut v = lo;
        while v <= hi {
            bits |= 1u64 << v;
            v += step;
        }
    }

    Ok(FieldSet { bits, wildcard })
}

fn parse_value(expr: &str, raw: &str, min: u32, max: u32) -> Result<u32, SchedulerError> {
    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(expr, format!("'{}' is not a number", raw)))?;
    if value < min || value > max {
        return Err(invalid(expr, format!("{} outside {}-{}", value, min, max)));
    }
    Ok(value)
}
