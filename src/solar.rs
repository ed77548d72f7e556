//! Sun-event calculator based on the NOAA low-precision solar position
//! algorithm.
//!
//! Pure and side-effect free: (civil date, latitude, longitude, timezone)
//! in, sunrise/sunset or a polar verdict out. Accuracy is a couple of
//! minutes for dates within ±50 years of J2000, which is far inside the
//! tolerance of a camera exposure schedule.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use std::f64::consts::PI;
use thiserror::Error;

const DEG: f64 = PI / 180.0;

/// Geometric altitude of the sun's center at rise/set: standard refraction
/// plus half the solar disc.
const HORIZON_ALTITUDE: f64 = -0.833;

#[derive(Debug, Error, PartialEq)]
pub enum AstroError {
    #[error("latitude {0} out of range -90..=90")]
    Latitude(f64),
    #[error("longitude {0} is not a finite number")]
    Longitude(f64),
}

/// Whether the sun crosses the horizon on a given civil date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SunVerdict {
    /// Sun rises and sets; both times are present.
    Normal,
    /// Sun stays above the horizon all day.
    PolarDay,
    /// Sun stays below the horizon all day.
    PolarNight,
}

impl std::fmt::Display for SunVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SunVerdict::Normal => write!(f, "normal"),
            SunVerdict::PolarDay => write!(f, "polar-day"),
            SunVerdict::PolarNight => write!(f, "polar-night"),
        }
    }
}

/// Sun events for one civil date at one location, resolved to one second.
/// Times are local times-of-day in the zone the date was given in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SunEvents {
    pub date: NaiveDate,
    pub verdict: SunVerdict,
    pub sunrise: Option<NaiveTime>,
    pub sunset: Option<NaiveTime>,
}

// ─── NOAA solar position terms ──────────────────────────────────

/// Convert a NaiveDateTime (assumed UTC) to Julian Date.
pub fn julian_date(dt: &NaiveDateTime) -> f64 {
    let y = dt.year() as f64;
    let m = dt.month() as f64;
    let d = dt.day() as f64;
    let h = dt.hour() as f64 + dt.minute() as f64 / 60.0 + dt.second() as f64 / 3600.0;

    let (y2, m2) = if m <= 2.0 {
        (y - 1.0, m + 12.0)
    } else {
        (y, m)
    };

    let a = (y2 / 100.0_f64).floor();
    let b = 2.0 - a + (a / 4.0_f64).floor();

    (365.25_f64 * (y2 + 4716.0)).floor()
        + (30.6001_f64 * (m2 + 1.0)).floor()
        + d
        + h / 24.0
        + b
        - 1524.5
}

fn julian_century(jd: f64) -> f64 {
    (jd - 2451545.0) / 36525.0
}

fn normalize_degrees(deg: f64) -> f64 {
    let mut d = deg % 360.0;
    if d < 0.0 {
        d += 360.0;
    }
    d
}

fn sun_mean_longitude(t: f64) -> f64 {
    normalize_degrees(280.46646 + t * (36000.76983 + t * 0.0003032))
}

fn sun_mean_anomaly(t: f64) -> f64 {
    normalize_degrees(357.52911 + t * (35999.05029 - t * 0.0001537))
}

fn earth_eccentricity(t: f64) -> f64 {
    0.016708634 - t * (0.000042037 + t * 0.0000001267)
}

fn sun_equation_of_center(t: f64) -> f64 {
    let m = sun_mean_anomaly(t) * DEG;
    m.sin() * (1.914602 - t * (0.004817 + t * 0.000014))
        + (2.0 * m).sin() * (0.019993 - t * 0.000101)
        + (3.0 * m).sin() * 0.000289
}

fn sun_apparent_longitude(t: f64) -> f64 {
    let omega = 125.04 - 1934.136 * t;
    sun_mean_longitude(t) + sun_equation_of_center(t) - 0.00569 - 0.00478 * (omega * DEG).sin()
}

fn mean_obliquity(t: f64) -> f64 {
    23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.00059 - t * 0.001813))) / 60.0) / 60.0
}

fn obliquity_corrected(t: f64) -> f64 {
    let omega = 125.04 - 1934.136 * t;
    mean_obliquity(t) + 0.00256 * (omega * DEG).cos()
}

/// Solar declination in degrees.
fn solar_declination(t: f64) -> f64 {
    let e = obliquity_corrected(t) * DEG;
    let lambda = sun_apparent_longitude(t) * DEG;
    (e.sin() * lambda.sin()).asin() / DEG
}

/// Equation of time in minutes.
fn equation_of_time(t: f64) -> f64 {
    let e = obliquity_corrected(t) * DEG;
    let l0 = sun_mean_longitude(t) * DEG;
    let ecc = earth_eccentricity(t);
    let m = sun_mean_anomaly(t) * DEG;

    let y = (e / 2.0).tan().powi(2);

    let eq = y * (2.0 * l0).sin() - 2.0 * ecc * m.sin()
        + 4.0 * ecc * y * m.sin() * (2.0 * l0).cos()
        - 0.5 * y * y * (4.0 * l0).sin()
        - 1.25 * ecc * ecc * (2.0 * m).sin();

    4.0 * eq / DEG
}

// ─── Sun events ─────────────────────────────────────────────────

/// Fold a longitude into [-180, 180). `sun_events` accepts any finite
/// longitude; +360° wraps are equivalent.
fn normalize_longitude(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Compute sunrise and sunset for a civil date in `tz`.
///
/// The verdict holds for the whole civil date; at extreme latitudes a
/// location can cross into or out of polar day/night partway through a
/// date, in which case the verdict is the one in effect at local noon.
pub fn sun_events(date: NaiveDate, lat: f64, lon: f64, tz: Tz) -> Result<SunEvents, AstroError> {
    if lat.is_nan() || !(-90.0..=90.0).contains(&lat) {
        return Err(AstroError::Latitude(lat));
    }
    if !lon.is_finite() {
        return Err(AstroError::Longitude(lon));
    }
    let lon = normalize_longitude(lon);

    // Anchor the solar terms at local noon of the requested civil date.
    // `earliest` resolves DST-ambiguous noons; no tz-database zone skips
    // noon outright, but fall back to reading the naive value as UTC
    // rather than panic.
    let local_noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0).expect("noon"));
    let noon_utc = tz
        .from_local_datetime(&local_noon)
        .earliest()
        .map(|dt| dt.naive_utc())
        .unwrap_or(local_noon);

    let t = julian_century(julian_date(&noon_utc));
    let decl = solar_declination(t);
    let eqtime = equation_of_time(t);

    // Solar noon in minutes after midnight UTC, on the UTC date containing
    // the local noon.
    let solar_noon_min = 720.0 - 4.0 * lon - eqtime;

    let lat_r = lat * DEG;
    let decl_r = decl * DEG;
    let cos_ha = ((90.0 - HORIZON_ALTITUDE) * DEG).cos() / (lat_r.cos() * decl_r.cos())
        - lat_r.tan() * decl_r.tan();

    if cos_ha.is_nan() || !(-1.0..=1.0).contains(&cos_ha) {
        // No horizon crossing on this date. Decide by the sun's geometric
        // altitude at solar noon; the tie resolves to daylight.
        let noon_altitude = 90.0 - (lat - decl).abs();
        let verdict = if noon_altitude >= HORIZON_ALTITUDE {
            SunVerdict::PolarDay
        } else {
            SunVerdict::PolarNight
        };
        return Ok(SunEvents {
            date,
            verdict,
            sunrise: None,
            sunset: None,
        });
    }

    let ha_min = 4.0 * (cos_ha.acos() / DEG);
    let sunrise_utc = minutes_to_utc(noon_utc.date(), solar_noon_min - ha_min);
    let sunset_utc = minutes_to_utc(noon_utc.date(), solar_noon_min + ha_min);

    Ok(SunEvents {
        date,
        verdict: SunVerdict::Normal,
        sunrise: Some(to_local_time(sunrise_utc, tz)),
        sunset: Some(to_local_time(sunset_utc, tz)),
    })
}

/// Minutes after midnight UTC on `utc_date` to an absolute UTC instant,
/// rounded to one second. Values outside 0..1440 spill into the adjacent
/// date, which happens routinely at longitudes far from the zone meridian.
fn minutes_to_utc(utc_date: NaiveDate, minutes: f64) -> NaiveDateTime {
    let midnight = utc_date.and_time(NaiveTime::from_hms_opt(0, 0, 0).expect("midnight"));
    midnight + Duration::seconds((minutes * 60.0).round() as i64)
}

fn to_local_time(utc: NaiveDateTime, tz: Tz) -> NaiveTime {
    tz.from_utc_datetime(&utc).time()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono_tz::Tz;

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn minutes_between(a: NaiveTime, b: NaiveTime) -> i64 {
        (b - a).num_minutes().abs()
    }

    #[test]
    fn pittsburgh_summer_solstice() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let events = sun_events(
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            40.4406,
            -79.9959,
            tz,
        )
        .unwrap();

        assert_eq!(events.verdict, SunVerdict::Normal);
        let sunrise = events.sunrise.unwrap();
        let sunset = events.sunset.unwrap();
        assert!(
            minutes_between(sunrise, hms(5, 52, 0)) <= 5,
            "sunrise {} too far from 05:52",
            sunrise
        );
        assert!(
            minutes_between(sunset, hms(20, 53, 0)) <= 5,
            "sunset {} too far from 20:53",
            sunset
        );
        assert!(sunrise < sunset);
    }

    #[test]
    fn longyearbyen_december_is_polar_night() {
        let tz: Tz = "Arctic/Longyearbyen".parse().unwrap();
        let events = sun_events(
            NaiveDate::from_ymd_opt(2024, 12, 15).unwrap(),
            78.2232,
            15.6267,
            tz,
        )
        .unwrap();

        assert_eq!(events.verdict, SunVerdict::PolarNight);
        assert!(events.sunrise.is_none());
        assert!(events.sunset.is_none());
    }

    #[test]
    fn longyearbyen_june_is_polar_day() {
        let tz: Tz = "Arctic/Longyearbyen".parse().unwrap();
        let events = sun_events(
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            78.2232,
            15.6267,
            tz,
        )
        .unwrap();

        assert_eq!(events.verdict, SunVerdict::PolarDay);
        assert!(events.sunrise.is_none());
    }

    #[test]
    fn sub_polar_latitudes_are_always_normal() {
        // Every month, both hemispheres. The refraction-adjusted horizon
        // pulls the midsummer polar-day boundary down to about 65.7°, so
        // 65° is the highest latitude that stays normal year round.
        for lat in [65.0, 45.0, 0.0, -45.0, -65.0] {
            for month in 1..=12 {
                let date = NaiveDate::from_ymd_opt(2024, month, 15).unwrap();
                let events = sun_events(date, lat, 10.0, chrono_tz::UTC).unwrap();
                assert_eq!(
                    events.verdict,
                    SunVerdict::Normal,
                    "lat {} month {}",
                    lat,
                    month
                );
                assert!(events.sunrise.unwrap() < events.sunset.unwrap());
            }
        }
    }

    #[test]
    fn longitude_wraps_modulo_360() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let a = sun_events(date, 40.0, -79.99, chrono_tz::UTC).unwrap();
        let b = sun_events(date, 40.0, -79.99 + 360.0, chrono_tz::UTC).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn polar_circle_boundary_at_solstices() {
        // Just below the arctic circle the midsummer sun still sets (barely);
        // well inside it does not.
        let midsummer = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let inside = sun_events(midsummer, 64.0, 0.0, chrono_tz::UTC).unwrap();
        assert_eq!(inside.verdict, SunVerdict::Normal);

        let above = sun_events(midsummer, 68.0, 0.0, chrono_tz::UTC).unwrap();
        assert_eq!(above.verdict, SunVerdict::PolarDay);

        let midwinter = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        let dark = sun_events(midwinter, 68.0, 0.0, chrono_tz::UTC).unwrap();
        assert_eq!(dark.verdict, SunVerdict::PolarNight);
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            sun_events(date, 90.5, 0.0, chrono_tz::UTC),
            Err(AstroError::Latitude(90.5))
        );
    }

    #[test]
    fn declination_at_solstices() {
        let june = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let t = julian_century(julian_date(
            &june.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
        ));
        assert_relative_eq!(solar_declination(t), 23.44, epsilon = 0.1);

        let dec = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        let t = julian_century(julian_date(
            &dec.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
        ));
        assert_relative_eq!(solar_declination(t), -23.44, epsilon = 0.1);
    }

    #[test]
    fn equation_of_time_stays_in_known_bounds() {
        // EoT is bounded by roughly -14.3 and +16.5 minutes over a year.
        for day in (0..365).step_by(5) {
            let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(day);
            let t = julian_century(julian_date(
                &date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
            ));
            let eot = equation_of_time(t);
            assert!((-15.0..=17.0).contains(&eot), "day {} eot {}", day, eot);
        }
    }

    #[test]
    fn normalize_longitude_folds_into_range() {
        assert_relative_eq!(normalize_longitude(181.0), -179.0);
        assert_relative_eq!(normalize_longitude(-181.0), 179.0);
        assert_relative_eq!(normalize_longitude(15.65), 15.65);
        assert_relative_eq!(normalize_longitude(15.65 + 720.0), 15.65, epsilon = 1e-9);
    }

    #[test]
    fn julian_date_j2000_epoch() {
        // 2000-01-01 12:00 UTC is JD 2451545.0 by definition.
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        assert_relative_eq!(julian_date(&epoch), 2451545.0);
    }
}
