//! Time and coordinate conversions for pointing.
//!
//! Equatorial coordinates come in as (RA hours, Dec degrees); the mount's
//! local frame is altitude over azimuth, azimuth measured from North
//! clockwise through East. Unit vectors for the solver live in a rotating
//! frame anchored at a reference epoch, which is what the sidereal
//! reframing in [`sky_unit_vector`] provides.

use chrono::{DateTime, Datelike, Timelike, Utc};
use nalgebra::Vector3;

/// Radians per arcsecond.
pub const ARCSEC_TO_RAD: f64 = 4.84813681109536e-6;
/// Arcseconds per radian.
pub const RAD_TO_ARCSEC: f64 = 206264.80624709636;
/// Apparent drift of the sky in RA arcseconds per second of wall-clock time.
/// Must match the firmware's tracking constant exactly.
pub const SIDEREAL_RATE_ARCSEC_PER_SEC: f64 = 15.041;

/// Julian date of a UTC instant (Meeus, Gregorian calendar).
pub fn julian_date(t: DateTime<Utc>) -> f64 {
    let mut year = t.year() as f64;
    let mut month = t.month() as f64;
    let day = t.day() as f64
        + (t.hour() as f64
            + t.minute() as f64 / 60.0
            + (t.second() as f64 + t.nanosecond() as f64 * 1e-9) / 3600.0)
            / 24.0;

    if month <= 2.0 {
        year -= 1.0;
        month += 12.0;
    }
    let a = (year / 100.0).floor();
    let b = 2.0 - a + (a / 4.0).floor();

    (365.25 * (year + 4716.0)).floor() + (30.6001 * (month + 1.0)).floor() + day + b - 1524.5
}

/// Greenwich mean sidereal time in hours, reduced to [0, 24).
pub fn gmst_hours(t: DateTime<Utc>) -> f64 {
    let d = julian_date(t) - 2451545.0;
    (18.697374558 + 24.06570982441908 * d).rem_euclid(24.0)
}

/// Local sidereal time in hours for an observer at `longitude_deg`
/// (east positive), reduced to [0, 24).
pub fn lst_hours(t: DateTime<Utc>, longitude_deg: f64) -> f64 {
    (gmst_hours(t) + longitude_deg / 15.0).rem_euclid(24.0)
}

/// Horizontal coordinates: altitude above the horizon and azimuth from North
/// clockwise through East, both in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AltAz {
    pub alt_deg: f64,
    pub az_deg: f64,
}

/// Where `(ra_hours, dec_deg)` appears in the observer's sky at `t`.
pub fn radec_to_altaz(
    ra_hours: f64,
    dec_deg: f64,
    t: DateTime<Utc>,
    latitude_deg: f64,
    longitude_deg: f64,
) -> AltAz {
    let lst = lst_hours(t, longitude_deg);
    let ha = ((lst - ra_hours) * 15.0).to_radians();
    let dec = dec_deg.to_radians();
    let lat = latitude_deg.to_radians();

    let sin_alt = (dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos()).clamp(-1.0, 1.0);
    let alt = sin_alt.asin();

    let cos_az = ((dec.sin() - sin_alt * lat.sin()) / (alt.cos() * lat.cos())).clamp(-1.0, 1.0);
    let mut az = cos_az.acos();
    if ha.sin() > 0.0 {
        az = std::f64::consts::TAU - az;
    }

    AltAz {
        alt_deg: alt.to_degrees(),
        az_deg: az.to_degrees(),
    }
}

/// Unit vector of a sky target in the rotating frame anchored at `t_ref`.
///
/// The RA is shifted by the sidereal rate times `(t_ref - t_obs)` so that
/// vectors observed at different times become comparable in one frame.
pub fn sky_unit_vector(
    ra_hours: f64,
    dec_deg: f64,
    t_ref: DateTime<Utc>,
    t_obs: DateTime<Utc>,
) -> Vector3<f64> {
    let dt_s = (t_ref - t_obs).num_milliseconds() as f64 / 1000.0;
    let ra_arcsec = ra_hours * 15.0 * 3600.0 + SIDEREAL_RATE_ARCSEC_PER_SEC * dt_s;
    let ra = ra_arcsec * ARCSEC_TO_RAD;
    let dec = dec_deg.to_radians();

    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

/// Unit pointing vector from encoder readings. The roll axis (Y) does not
/// affect the pointing direction and is not an input.
pub fn mount_unit_vector(alt_arcsec: i32, az_arcsec: i32) -> Vector3<f64> {
    let alt = alt_arcsec as f64 * ARCSEC_TO_RAD;
    let az = az_arcsec as f64 * ARCSEC_TO_RAD;
    Vector3::new(alt.cos() * az.cos(), alt.cos() * az.sin(), alt.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    #[test]
    fn test_julian_date_j2000() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert_relative_eq!(julian_date(t), 2_451_545.0, epsilon = 1e-9);
    }

    #[test]
    fn test_julian_date_meeus_example() {
        // Meeus ch. 7: 1999 January 1.0 is JD 2451179.5.
        let t = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
        assert_relative_eq!(julian_date(t), 2_451_179.5, epsilon = 1e-9);
    }

    #[test]
    fn test_gmst_at_j2000() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert_relative_eq!(gmst_hours(t), 18.697374558, epsilon = 1e-9);
    }

    #[test]
    fn test_lst_wraps_longitude() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let east = lst_hours(t, 15.0);
        let greenwich = lst_hours(t, 0.0);
        assert_relative_eq!((east - greenwich).rem_euclid(24.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_altaz_on_meridian() {
        // A target on the local meridian (HA = 0) with Dec equal to the
        // latitude passes through the zenith.
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let lat = 45.0;
        let ra = lst_hours(t, 0.0);
        let altaz = radec_to_altaz(ra, lat, t, lat, 0.0);
        assert_relative_eq!(altaz.alt_deg, 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_altaz_western_target_wraps_azimuth() {
        // HA = +6h on the equator for an equatorial observer: the target
        // sits on the western horizon, azimuth 270°.
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let ra = (lst_hours(t, 0.0) - 6.0).rem_euclid(24.0);
        let altaz = radec_to_altaz(ra, 0.0, t, 0.0, 0.0);
        assert_relative_eq!(altaz.alt_deg, 0.0, epsilon = 1e-6);
        assert_relative_eq!(altaz.az_deg, 270.0, epsilon = 1e-6);
    }

    #[test]
    fn test_sky_vector_is_unit() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 2, 30, 0).unwrap();
        let v = sky_unit_vector(18.615, 38.78, t, t);
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sidereal_reframing_shifts_ra_exactly() {
        // Reframing by Δt must equal shifting RA by 15.041·Δt arcseconds.
        let t_obs = Utc.with_ymd_and_hms(2024, 6, 1, 2, 30, 0).unwrap();
        let dt = 100;
        let t_ref = t_obs + chrono::Duration::seconds(dt);

        let reframed = sky_unit_vector(5.5, -12.0, t_ref, t_obs);
        let shift_hours = SIDEREAL_RATE_ARCSEC_PER_SEC * dt as f64 / 3600.0 / 15.0;
        let direct = sky_unit_vector(5.5 + shift_hours, -12.0, t_obs, t_obs);
        assert_relative_eq!(reframed, direct, epsilon = 1e-12);
    }

    #[test]
    fn test_mount_vector_axes() {
        // Level, pointing North.
        let v = mount_unit_vector(0, 0);
        assert_relative_eq!(v, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);

        // Straight up.
        let v = mount_unit_vector(90 * 3600, 0);
        assert_relative_eq!(v, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-9);

        // Level, azimuth 90° (East).
        let v = mount_unit_vector(0, 90 * 3600);
        assert_relative_eq!(v, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_arcsec_constants_are_inverses() {
        assert_relative_eq!(ARCSEC_TO_RAD * RAD_TO_ARCSEC, 1.0, epsilon = 1e-12);
    }
}
