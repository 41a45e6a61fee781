//! Sunrise, sunset and solar elevation
//!
//! Uses the NOAA solar position equations. Event times are accurate to
//! about a minute for latitudes below the polar circles, which is plenty
//! for scheduling. On days without the event (polar day or night) the
//! per-date queries return `None`.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zenith of the sun's centre at rise/set, including refraction
const SUNRISE_ZENITH: f64 = 90.833;

/// Elevation below which the sun counts as down
const HORIZON_ELEVATION: f64 = -0.833;

/// Days searched by the `next_*` queries
const MAX_SEARCH_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

/// Observer position used for sun queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level
    pub elevation: f64,
    pub time_zone: Tz,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, elevation: f64, time_zone: Tz) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
            time_zone,
        }
    }
}

struct SolarPosition {
    /// Declination in radians
    declination: f64,
    /// Equation of time in minutes
    eq_of_time: f64,
}

fn julian_day(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 / 86_400.0 + 2_440_587.5
}

fn julian_century(jd: f64) -> f64 {
    (jd - 2_451_545.0) / 36_525.0
}

fn solar_position(t: f64) -> SolarPosition {
    let mean_long = (280.46646 + t * (36000.76983 + t * 0.0003032)).rem_euclid(360.0);
    let mean_anomaly = 357.52911 + t * (35999.05029 - 0.0001537 * t);
    let eccentricity = 0.016708634 - t * (0.000042037 + 0.0000001267 * t);

    let m = mean_anomaly.to_radians();
    let eq_of_center = m.sin() * (1.914602 - t * (0.004817 + 0.000014 * t))
        + (2.0 * m).sin() * (0.019993 - 0.000101 * t)
        + (3.0 * m).sin() * 0.000289;

    let omega = (125.04 - 1934.136 * t).to_radians();
    let apparent_long = mean_long + eq_of_center - 0.00569 - 0.00478 * omega.sin();

    let mean_obliquity =
        23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.00059 - t * 0.001813))) / 60.0) / 60.0;
    let obliquity = (mean_obliquity + 0.00256 * omega.cos()).to_radians();

    let declination = (obliquity.sin() * apparent_long.to_radians().sin()).asin();

    let y = (obliquity / 2.0).tan().powi(2);
    let l0 = mean_long.to_radians();
    let e = eccentricity;
    let eq_of_time = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * e * m.sin() + 4.0 * e * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * e * e * (2.0 * m).sin())
        .to_degrees();

    SolarPosition {
        declination,
        eq_of_time,
    }
}

/// Hour angle in degrees at which the sun reaches `zenith`, or None if it never does
fn hour_angle(latitude: f64, declination: f64, zenith: f64) -> Option<f64> {
    let lat = latitude.to_radians();
    let cos_h = zenith.to_radians().cos() / (lat.cos() * declination.cos())
        - lat.tan() * declination.tan();
    if !(-1.0..=1.0).contains(&cos_h) {
        return None;
    }
    Some(cos_h.acos().to_degrees())
}

fn zenith_for(location: &Location) -> f64 {
    if location.elevation > 0.0 {
        SUNRISE_ZENITH + 2.076 * location.elevation.sqrt() / 60.0
    } else {
        SUNRISE_ZENITH
    }
}

/// Event time on the given UTC calendar day
fn event_on_utc_date(location: &Location, date: NaiveDate, event: SunEvent) -> Option<DateTime<Utc>> {
    let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    let jd = julian_day(&midnight);
    let zenith = zenith_for(location);

    // Start from solar noon, then refine with the time found
    let mut t = julian_century(jd + 0.5 - location.longitude / 360.0);
    let mut minutes = 0.0;
    for _ in 0..3 {
        let pos = solar_position(t);
        let h = hour_angle(location.latitude, pos.declination, zenith)?;
        let h = match event {
            SunEvent::Sunrise => h,
            SunEvent::Sunset => -h,
        };
        minutes = 720.0 - 4.0 * (location.longitude + h) - pos.eq_of_time;
        t = julian_century(jd + minutes / 1440.0);
    }

    Some(midnight + Duration::milliseconds((minutes * 60_000.0).round() as i64))
}

/// Time of `event` on the local calendar day `date`
pub fn sun_event(location: &Location, date: NaiveDate, event: SunEvent) -> Option<DateTime<Utc>> {
    let found = event_on_utc_date(location, date, event)?;
    let local_date = found.with_timezone(&location.time_zone).date_naive();

    if local_date == date {
        return Some(found);
    }
    let shifted = if local_date < date {
        date.succ_opt()?
    } else {
        date.pred_opt()?
    };
    event_on_utc_date(location, shifted, event)
}

pub fn sunrise(location: &Location, date: NaiveDate) -> Option<DateTime<Utc>> {
    sun_event(location, date, SunEvent::Sunrise)
}

pub fn sunset(location: &Location, date: NaiveDate) -> Option<DateTime<Utc>> {
    sun_event(location, date, SunEvent::Sunset)
}

/// First occurrence of `event` strictly after `after`
///
/// Walks forward one local day at a time for up to a year, so polar
/// day/night periods are skipped.
pub fn next_event(location: &Location, event: SunEvent, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = after.with_timezone(&location.time_zone).date_naive();
    (0..=MAX_SEARCH_DAYS)
        .filter_map(|offset| start.checked_add_signed(Duration::days(offset)))
        .filter_map(|date| sun_event(location, date, event))
        .find(|time| *time > after)
}

pub fn next_sunrise(location: &Location, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_event(location, SunEvent::Sunrise, after)
}

pub fn next_sunset(location: &Location, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_event(location, SunEvent::Sunset, after)
}

/// Angle of the sun above the horizon in degrees, without refraction
pub fn solar_elevation(location: &Location, at: DateTime<Utc>) -> f64 {
    let pos = solar_position(julian_century(julian_day(&at)));

    let minutes_of_day = f64::from(at.timestamp().rem_euclid(86_400) as u32) / 60.0;
    let true_solar_time =
        (minutes_of_day + pos.eq_of_time + 4.0 * location.longitude).rem_euclid(1440.0);
    let hour_angle = (true_solar_time / 4.0 - 180.0).to_radians();

    let lat = location.latitude.to_radians();
    let cos_zenith = lat.sin() * pos.declination.sin()
        + lat.cos() * pos.declination.cos() * hour_angle.cos();
    90.0 - cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
}

pub fn is_sun_up(location: &Location, at: DateTime<Utc>) -> bool {
    solar_elevation(location, at) > HORIZON_ELEVATION
}
