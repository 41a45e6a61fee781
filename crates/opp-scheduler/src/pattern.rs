//! Wall-clock time patterns
//!
//! A [`TimePattern`] matches instants by hour, minute and second. Each field
//! is a wildcard, an exact value, or a divisor (`/5` matches 0, 5, 10, ...).

use crate::error::SchedulerError;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;

/// One field of a time pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    #[default]
    Any,
    Exact(u32),
    Every(u32),
}

impl Field {
    /// Parse `*`, `N` or `/N`
    pub fn parse(field: &'static str, raw: &str, max: u32) -> Result<Self, SchedulerError> {
        let invalid = |reason: &str| SchedulerError::InvalidPattern {
            field,
            value: raw.to_string(),
            reason: reason.to_string(),
        };
        let raw_trimmed = raw.trim();

        let parsed = if raw_trimmed == "*" {
            Field::Any
        } else if let Some(divisor) = raw_trimmed.strip_prefix('/') {
            let n: u32 = divisor.parse().map_err(|_| invalid("not a number"))?;
            if n == 0 {
                return Err(invalid("divisor must be positive"));
            }
            Field::Every(n)
        } else {
            Field::Exact(raw_trimmed.parse().map_err(|_| invalid("not a number"))?)
        };
        parsed.validate(field, max)
    }

    fn validate(self, field: &'static str, max: u32) -> Result<Self, SchedulerError> {
        let value = match self {
            Field::Any => return Ok(self),
            Field::Exact(v) | Field::Every(v) => v,
        };
        if value > max {
            return Err(SchedulerError::InvalidPattern {
                field,
                value: self.to_string(),
                reason: format!("must be at most {}", max),
            });
        }
        Ok(self)
    }

    pub fn matches(&self, value: u32) -> bool {
        match *self {
            Field::Any => true,
            Field::Exact(v) => v == value,
            Field::Every(n) => value % n == 0,
        }
    }
}

impl From<Option<u32>> for Field {
    fn from(value: Option<u32>) -> Self {
        value.map_or(Field::Any, Field::Exact)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Any => write!(f, "*"),
            Field::Exact(v) => write!(f, "{}", v),
            Field::Every(n) => write!(f, "/{}", n),
        }
    }
}

/// Hour, minute and second pattern; unspecified fields are wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimePattern {
    pub hour: Field,
    pub minute: Field,
    pub second: Field,
}

/// Upper bound on candidate steps when searching for the next match
const MAX_STEPS: usize = 200_000;

impl TimePattern {
    /// A pattern from plain numbers; `None` is a wildcard
    pub fn new(
        hour: Option<u32>,
        minute: Option<u32>,
        second: Option<u32>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            hour: Field::from(hour).validate("hour", 23)?,
            minute: Field::from(minute).validate("minute", 59)?,
            second: Field::from(second).validate("second", 59)?,
        })
    }

    /// A pattern from `*`, `N` or `/N` expressions; `None` is a wildcard
    pub fn parse(
        hour: Option<&str>,
        minute: Option<&str>,
        second: Option<&str>,
    ) -> Result<Self, SchedulerError> {
        let field = |name, raw: Option<&str>, max| match raw {
            Some(raw) => Field::parse(name, raw, max),
            None => Ok(Field::Any),
        };
        Ok(Self {
            hour: field("hour", hour, 23)?,
            minute: field("minute", minute, 59)?,
            second: field("second", second, 59)?,
        })
    }

    /// Whether the wall-clock time `at` matches every field
    pub fn matches<T: Timelike>(&self, at: &T) -> bool {
        self.hour.matches(at.hour())
            && self.minute.matches(at.minute())
            && self.second.matches(at.second())
    }

    /// The first whole second strictly after `after` whose wall-clock time in
    /// `time_zone` matches
    ///
    /// Local times skipped by a DST transition never match; repeated local
    /// times match on their first occurrence.
    pub fn next_after(&self, after: DateTime<Utc>, time_zone: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&time_zone).naive_local();
        let mut candidate = local.with_nanosecond(0)? + Duration::seconds(1);

        for _ in 0..MAX_STEPS {
            if !self.hour.matches(candidate.hour()) {
                candidate = next_hour(candidate)?;
                continue;
            }
            if !self.minute.matches(candidate.minute()) {
                candidate = next_minute(candidate)?;
                continue;
            }
            if self.second.matches(candidate.second()) {
                if let Some(resolved) = time_zone.from_local_datetime(&candidate).earliest() {
                    let utc = resolved.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
            }
            candidate += Duration::seconds(1);
        }
        None
    }
}

fn next_hour(at: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(at.with_minute(0)?.with_second(0)? + Duration::hours(1))
}

fn next_minute(at: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(at.with_second(0)? + Duration::minutes(1))
}

impl fmt::Display for TimePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hour, self.minute, self.second)
    }
}
