//! Time functions and utilities for templates
//!
//! `now()`, `utcnow()` and friends read the kernel [`Clock`] rather than the
//! system time, so templates follow whatever clock the runtime was built with.

use crate::filters::value_to_f64;
use crate::states::RenderTracker;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use minijinja::value::{Kwargs, Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind};
use opp_clock::{dt, Clock};
use std::sync::Arc;

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// The clock and zone a render reads time from
#[derive(Clone)]
pub(crate) struct TimeSource {
    pub clock: Arc<dyn Clock>,
    pub time_zone: Tz,
    pub tracker: Option<Arc<RenderTracker>>,
}

impl TimeSource {
    fn read(&self) -> DateTime<Utc> {
        if let Some(tracker) = &self.tracker {
            tracker.now();
        }
        self.clock.utcnow()
    }

    /// Current time in the configured zone
    pub fn now(&self) -> Value {
        wrap(self.read().with_timezone(&self.time_zone))
    }

    /// Current time in UTC
    pub fn utcnow(&self) -> Value {
        wrap(self.read().with_timezone(&Tz::UTC))
    }

    /// Today, in the configured zone, at `HH:MM[:SS]`
    pub fn today_at(&self, time: Option<&str>) -> Result<Value, Error> {
        let time = match time {
            Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
                .map_err(|e| invalid(format!("invalid time {:?}: {}", raw, e)))?,
            None => NaiveTime::MIN,
        };
        let today = self.read().with_timezone(&self.time_zone).date_naive();
        let local = self
            .time_zone
            .from_local_datetime(&today.and_time(time))
            .earliest()
            .ok_or_else(|| invalid("time does not exist today"))?;
        Ok(wrap(local))
    }

    /// Convert a datetime or timestamp to the configured zone
    pub fn as_local(&self, value: Value) -> Result<Value, Error> {
        let dt = to_datetime(&value)?;
        Ok(wrap(dt.with_timezone(&self.time_zone)))
    }

    /// Human readable age of a datetime, e.g. "2 hours"
    pub fn relative_time(&self, value: Value) -> Result<Value, Error> {
        let dt = match to_datetime(&value) {
            Ok(dt) => dt,
            Err(_) => return Ok(value),
        };
        let now = self.read();
        if dt > now {
            return Ok(value);
        }
        Ok(Value::from(format_duration(now - dt)))
    }
}

fn wrap(dt: DateTime<Tz>) -> Value {
    Value::from_object(DateTimeWrapper(dt))
}

fn to_datetime(value: &Value) -> Result<DateTime<Utc>, Error> {
    if let Some(wrapper) = value.downcast_object_ref::<DateTimeWrapper>() {
        return Ok(wrapper.0.with_timezone(&Utc));
    }
    if let Some(s) = value.as_str() {
        if let Ok(parsed) = dt::parse_datetime(s) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Some(ts) = s.trim().parse::<f64>().ok().and_then(dt::utc_from_timestamp) {
            return Ok(ts);
        }
        return Err(invalid(format!("cannot parse {:?} as a datetime", s)));
    }
    value_to_f64(value)
        .and_then(dt::utc_from_timestamp)
        .ok_or_else(|| invalid("cannot convert to datetime"))
}

/// Convert a datetime or datetime string to a UNIX timestamp
pub fn as_timestamp(value: Value, default: Option<Value>) -> Result<Value, Error> {
    match to_datetime(&value) {
        Ok(at) => Ok(Value::from(dt::as_timestamp(&at))),
        Err(e) => default.ok_or(e),
    }
}

/// Convert a string or timestamp to an aware datetime
pub fn as_datetime(value: Value) -> Result<Value, Error> {
    Ok(wrap(to_datetime(&value)?.with_timezone(&Tz::UTC)))
}

/// Create a duration from keyword arguments
pub fn timedelta(kwargs: Kwargs) -> Result<Value, Error> {
    let mut total = Duration::zero();
    for (unit, scale) in [
        ("weeks", 604_800_000_i64),
        ("days", 86_400_000),
        ("hours", 3_600_000),
        ("minutes", 60_000),
        ("seconds", 1_000),
        ("milliseconds", 1),
    ] {
        if let Some(amount) = kwargs.get::<Option<f64>>(unit)? {
            total += Duration::milliseconds((amount * scale as f64) as i64);
        }
    }
    kwargs.assert_all_used()?;
    Ok(Value::from_object(TimeDeltaWrapper(total)))
}

fn format_duration(diff: Duration) -> String {
    let seconds = diff.num_seconds().abs();
    let (amount, unit) = match seconds {
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 2_592_000 => (s / 86_400, "day"),
        s if s < 31_536_000 => (s / 2_592_000, "month"),
        s => (s / 31_536_000, "year"),
    };
    if amount == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

/// Immediate if - ternary operator as function
pub fn iif(
    condition: Value,
    if_true: Option<Value>,
    if_false: Option<Value>,
    if_none: Option<Value>,
) -> Value {
    if condition.is_none() || condition.is_undefined() {
        if_none.unwrap_or_else(|| if_false.clone().unwrap_or(Value::from(false)))
    } else if condition.is_true() {
        if_true.unwrap_or(Value::from(true))
    } else {
        if_false.unwrap_or(Value::from(false))
    }
}

// ==================== DateTime Wrapper ====================

/// Zone-aware datetime exposed to templates
#[derive(Debug, Clone)]
pub struct DateTimeWrapper(pub DateTime<Tz>);

impl DateTimeWrapper {
    fn other(args: &[Value]) -> Option<DateTime<Tz>> {
        args.first()
            .and_then(|v| v.downcast_object_ref::<DateTimeWrapper>())
            .map(|dt| dt.0)
    }
}

impl Object for DateTimeWrapper {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let at = &self.0;
        match key.as_str()? {
            "year" => Some(Value::from(at.year())),
            "month" => Some(Value::from(at.month())),
            "day" => Some(Value::from(at.day())),
            "hour" => Some(Value::from(at.hour())),
            "minute" => Some(Value::from(at.minute())),
            "second" => Some(Value::from(at.second())),
            "microsecond" => Some(Value::from(at.timestamp_subsec_micros())),
            "tzinfo" => Some(Value::from(at.timezone().name())),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        let at = self.0;
        match name {
            "strftime" => {
                let format = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| invalid("strftime requires a format string"))?;
                Ok(Value::from(at.format(format).to_string()))
            }
            "timestamp" => Ok(Value::from(dt::as_timestamp(&at))),
            "isoformat" => Ok(Value::from(at.to_rfc3339())),
            "weekday" => Ok(Value::from(at.weekday().num_days_from_monday())),
            "isoweekday" => Ok(Value::from(at.weekday().number_from_monday())),
            "date" => Ok(Value::from(at.date_naive().to_string())),
            "add" => match args.first().and_then(|v| v.downcast_object_ref::<TimeDeltaWrapper>()) {
                Some(td) => Ok(wrap(at + td.0)),
                None => Err(invalid("can only add a timedelta to a datetime")),
            },
            "sub" => {
                let other = args.first().ok_or_else(|| invalid("sub requires an argument"))?;
                if let Some(td) = other.downcast_object_ref::<TimeDeltaWrapper>() {
                    Ok(wrap(at - td.0))
                } else if let Some(rhs) = other.downcast_object_ref::<DateTimeWrapper>() {
                    Ok(Value::from_object(TimeDeltaWrapper(at - rhs.0)))
                } else {
                    Err(invalid("can only subtract a timedelta or datetime"))
                }
            }
            "gt" => Ok(Value::from(Self::other(args).map_or(false, |o| at > o))),
            "ge" => Ok(Value::from(Self::other(args).map_or(false, |o| at >= o))),
            "lt" => Ok(Value::from(Self::other(args).map_or(false, |o| at < o))),
            "le" => Ok(Value::from(Self::other(args).map_or(false, |o| at <= o))),
            "eq" => Ok(Value::from(Self::other(args).map_or(false, |o| at == o))),
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("datetime has no method {}", name),
            )),
        }
    }

    fn render(self: &Arc<Self>, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.f%:z"))
    }
}

// ==================== TimeDelta Wrapper ====================

/// Duration exposed to templates
#[derive(Debug, Clone)]
pub struct TimeDeltaWrapper(pub Duration);

impl Object for TimeDeltaWrapper {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "days" => Some(Value::from(self.0.num_days())),
            "seconds" => Some(Value::from(self.0.num_seconds() % 86_400)),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        name: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match name {
            "total_seconds" => Ok(Value::from(self.0.num_milliseconds() as f64 / 1000.0)),
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("timedelta has no method {}", name),
            )),
        }
    }

    fn render(self: &Arc<Self>, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.0.num_seconds();
        let days = total.div_euclid(86_400);
        let rest = total.rem_euclid(86_400);
        let hms = format!("{}:{:02}:{:02}", rest / 3_600, (rest % 3_600) / 60, rest % 60);
        match days {
            0 => write!(f, "{}", hms),
            1 | -1 => write!(f, "{} day, {}", days, hms),
            _ => write!(f, "{} days, {}", days, hms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opp_clock::MockClock;

    fn source(tracker: Option<Arc<RenderTracker>>) -> TimeSource {
        TimeSource {
            clock: Arc::new(MockClock::at(Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap())),
            time_zone: chrono_tz::Europe::Amsterdam,
            tracker,
        }
    }

    #[test]
    fn test_now_uses_clock_and_zone() {
        let tracker = Arc::new(RenderTracker::new());
        let time = source(Some(tracker.clone()));

        assert_eq!(time.now().to_string(), "2023-06-01 14:00:00+02:00");
        assert_eq!(time.utcnow().to_string(), "2023-06-01 12:00:00+00:00");
        assert!(tracker.info().uses_now);
    }

    #[test]
    fn test_today_at() {
        let time = source(None);
        let at = time.today_at(Some("07:30")).unwrap();
        let ts = as_timestamp(at, None).unwrap();
        // 2023-06-01 05:30 UTC
        assert_eq!(f64::try_from(ts).unwrap(), 1_685_597_400.0);
        assert!(time.today_at(Some("25:00")).is_err());
    }

    #[test]
    fn test_as_timestamp() {
        let ts = as_timestamp(Value::from("2023-06-01T12:00:00+00:00"), None).unwrap();
        assert_eq!(f64::try_from(ts).unwrap(), 1_685_620_800.0);
        assert!(as_timestamp(Value::from("soon"), None).is_err());
        assert_eq!(
            as_timestamp(Value::from("soon"), Some(Value::from(0))).unwrap(),
            Value::from(0)
        );
    }

    #[test]
    fn test_relative_time() {
        let time = source(None);
        let past = Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap();
        let value = wrap(past.with_timezone(&Tz::UTC));
        assert_eq!(time.relative_time(value).unwrap().as_str(), Some("2 hours"));
        assert_eq!(format_duration(Duration::seconds(1)), "1 second");
        assert_eq!(format_duration(Duration::days(3)), "3 days");
    }

    #[test]
    fn test_iif() {
        let pick = |c: Value| iif(c, Some(Value::from("yes")), Some(Value::from("no")), None);
        assert_eq!(pick(Value::from(true)).as_str(), Some("yes"));
        assert_eq!(pick(Value::from(false)).as_str(), Some("no"));
        assert_eq!(pick(Value::from(())).as_str(), Some("no"));
    }
}
