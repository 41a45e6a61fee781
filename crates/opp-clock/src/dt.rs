//! Date and time helpers
//!
//! All internal timestamps are UTC. Local time only appears at the edges:
//! time patterns evaluated on the wall clock and values shown to users.

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DateTimeError {
    #[error("datetime `{0}` has no UTC offset")]
    Naive(String),

    #[error("invalid datetime `{0}`")]
    Invalid(String),

    #[error("unknown time zone `{0}`")]
    UnknownTimeZone(String),
}

pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

/// Current time in `tz`
pub fn now(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

pub fn as_utc<T: TimeZone>(dt: &DateTime<T>) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}

pub fn as_local(dt: &DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    dt.with_timezone(&tz)
}

/// Seconds since the Unix epoch, with sub-second precision
pub fn as_timestamp<T: TimeZone>(dt: &DateTime<T>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1_000_000.0
}

pub fn utc_from_timestamp(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Parse an ISO 8601 datetime that carries an offset
///
/// Accepts `T` or a space between date and time. Strings without an offset
/// are rejected with [`DateTimeError::Naive`].
pub fn parse_datetime(raw: &str) -> Result<DateTime<FixedOffset>, DateTimeError> {
    let trimmed = raw.trim();
    let normalized = match trimmed.char_indices().nth(10) {
        Some((idx, ' ')) => format!("{}T{}", &trimmed[..idx], &trimmed[idx + 1..]),
        _ => trimmed.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z") {
        return Ok(dt);
    }

    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).is_ok());
    if naive {
        Err(DateTimeError::Naive(raw.to_string()))
    } else {
        Err(DateTimeError::Invalid(raw.to_string()))
    }
}

/// Look up an IANA time zone such as `Europe/London`
pub fn parse_time_zone(name: &str) -> Result<Tz, DateTimeError> {
    name.parse::<Tz>()
        .map_err(|_| DateTimeError::UnknownTimeZone(name.to_string()))
}

/// Local midnight of the day containing `dt`
///
/// Where midnight does not exist (a DST jump at 00:00) the first instant of
/// the day is used.
pub fn start_of_local_day(dt: &DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    let midnight = dt.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight).earliest() {
        Some(local) => local,
        None => tz.from_utc_datetime(&midnight),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_datetime_with_offset() {
        let dt = parse_datetime("2023-06-01T12:00:00+02:00").unwrap();
        assert_eq!(as_utc(&dt).hour(), 10);

        let spaced = parse_datetime("2023-06-01 12:00:00Z").unwrap();
        assert_eq!(as_utc(&spaced).hour(), 12);

        let short = parse_datetime("2023-06-01T12:30+00:00").unwrap();
        assert_eq!(short.minute(), 30);
    }

    #[test]
    fn test_parse_datetime_rejects_naive() {
        assert_eq!(
            parse_datetime("2023-06-01T12:00:00"),
            Err(DateTimeError::Naive("2023-06-01T12:00:00".to_string()))
        );
        assert!(matches!(
            parse_datetime("yesterday"),
            Err(DateTimeError::Invalid(_))
        ));
    }

    #[test]
    fn test_timestamp_conversion() {
        let dt = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        let ts = as_timestamp(&dt);
        assert_eq!(ts, 1_685_620_800.0);
        assert_eq!(utc_from_timestamp(ts), Some(dt));
        assert_eq!(utc_from_timestamp(f64::NAN), None);

        let half = utc_from_timestamp(ts + 0.5).unwrap();
        assert_eq!(half.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_time_zones() {
        let london = parse_time_zone("Europe/London").unwrap();
        let dt = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(as_local(&dt, london).hour(), 13);

        assert!(matches!(
            parse_time_zone("Mars/Olympus"),
            Err(DateTimeError::UnknownTimeZone(_))
        ));
    }

    #[test]
    fn test_start_of_local_day() {
        let tz = parse_time_zone("America/New_York").unwrap();
        let dt = Utc.with_ymd_and_hms(2023, 6, 2, 2, 0, 0).unwrap();
        let start = start_of_local_day(&dt, tz);

        assert_eq!(start.hour(), 0);
        assert_eq!(start.date_naive().to_string(), "2023-06-01");
        assert_eq!(as_utc(&start).hour(), 4);
    }
}
