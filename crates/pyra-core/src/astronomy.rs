// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Sun position and station coordinates.
//!
//! The service is created once by the supervisor and passed to whoever
//! needs elevations; there is no module-level singleton. Elevation comes
//! from the NOAA solar position equations, which are within a tenth of a
//! degree of ephemeris output and more than accurate enough for the
//! measurement triggers.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::config::CamTrackerConfig;
use crate::error::{PyraError, Result};

/// Marker line in the CamTracker config after which the three coordinate
/// lines follow.
const COORDINATE_MARKER: &str = "$1";

/// Solar geometry service.
#[derive(Debug, Clone)]
pub struct AstronomyService {
    _private: (),
}

impl AstronomyService {
    /// Initialize the service. Done once per process by the supervisor.
    pub fn initialize() -> Self {
        Self { _private: () }
    }

    /// Sun elevation in degrees above the horizon at `time` for the given
    /// position. Negative below the horizon. Altitude is accepted for
    /// interface completeness; its effect is below the trigger resolution.
    pub fn sun_elevation(
        &self,
        latitude: f64,
        longitude: f64,
        _altitude: f64,
        time: DateTime<Utc>,
    ) -> f64 {
        let julian_day = julian_day(time);
        let julian_century = (julian_day - 2451545.0) / 36525.0;

        let geom_mean_long =
            (280.46646 + julian_century * (36000.76983 + julian_century * 0.0003032)) % 360.0;
        let geom_mean_anom = 357.52911 + julian_century * (35999.05029 - 0.0001537 * julian_century);
        let eccentricity =
            0.016708634 - julian_century * (0.000042037 + 0.0000001267 * julian_century);

        let m_rad = geom_mean_anom.to_radians();
        let eq_of_center = m_rad.sin()
            * (1.914602 - julian_century * (0.004817 + 0.000014 * julian_century))
            + (2.0 * m_rad).sin() * (0.019993 - 0.000101 * julian_century)
            + (3.0 * m_rad).sin() * 0.000289;

        let true_long = geom_mean_long + eq_of_center;
        let apparent_long =
            true_long - 0.00569 - 0.00478 * (125.04 - 1934.136 * julian_century).to_radians().sin();

        let mean_obliq = 23.0
            + (26.0
                + (21.448
                    - julian_century
                        * (46.815 + julian_century * (0.00059 - julian_century * 0.001813)))
                    / 60.0)
                / 60.0;
        let obliq_corr =
            mean_obliq + 0.00256 * (125.04 - 1934.136 * julian_century).to_radians().cos();

        let declination = (obliq_corr.to_radians().sin() * apparent_long.to_radians().sin())
            .asin()
            .to_degrees();

        let var_y = (obliq_corr / 2.0).to_radians().tan().powi(2);
        let long_rad = geom_mean_long.to_radians();
        let eq_of_time = 4.0
            * (var_y * (2.0 * long_rad).sin() - 2.0 * eccentricity * m_rad.sin()
                + 4.0 * eccentricity * var_y * m_rad.sin() * (2.0 * long_rad).cos()
                - 0.5 * var_y * var_y * (4.0 * long_rad).sin()
                - 1.25 * eccentricity * eccentricity * (2.0 * m_rad).sin())
            .to_degrees();

        let minutes_of_day = time.hour() as f64 * 60.0
            + time.minute() as f64
            + time.second() as f64 / 60.0;
        let true_solar_time =
            (minutes_of_day + eq_of_time + 4.0 * longitude).rem_euclid(1440.0);
        let hour_angle = if true_solar_time / 4.0 < 0.0 {
            true_solar_time / 4.0 + 180.0
        } else {
            true_solar_time / 4.0 - 180.0
        };

        let lat_rad = latitude.to_radians();
        let dec_rad = declination.to_radians();
        (lat_rad.sin() * dec_rad.sin()
            + lat_rad.cos() * dec_rad.cos() * hour_angle.to_radians().cos())
        .asin()
        .to_degrees()
    }

    /// Read `(latitude, longitude, altitude)` from the CamTracker config
    /// file: the line equal to `$1` is followed by one line each.
    pub fn camtracker_coordinates(config: &CamTrackerConfig) -> Result<(f64, f64, f64)> {
        let text = std::fs::read_to_string(&config.config_path).map_err(|e| {
            PyraError::Tracker {
                details: format!(
                    "cannot read camtracker config '{}': {}",
                    config.config_path.display(),
                    e
                ),
            }
        })?;

        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let marker_index = lines
            .iter()
            .position(|line| *line == COORDINATE_MARKER)
            .ok_or_else(|| PyraError::Tracker {
                details: format!(
                    "camtracker config invalid: marker '{}' not found in '{}'",
                    COORDINATE_MARKER,
                    config.config_path.display()
                ),
            })?;

        let mut values = [0.0f64; 3];
        for (slot, value) in values.iter_mut().enumerate() {
            let line = lines.get(marker_index + 1 + slot).copied().unwrap_or("");
            *value = line.parse().map_err(|_| PyraError::Tracker {
                details: format!(
                    "camtracker config invalid: line {} after marker is not a float: '{}'",
                    slot + 1,
                    line
                ),
            })?;
        }
        Ok((values[0], values[1], values[2]))
    }
}

fn julian_day(time: DateTime<Utc>) -> f64 {
    let (mut year, mut month) = (time.year() as f64, time.month() as f64);
    if month <= 2.0 {
        year -= 1.0;
        month += 12.0;
    }
    let a = (year / 100.0).floor();
    let b = 2.0 - a + (a / 4.0).floor();
    let day_fraction = (time.hour() as f64
        + time.minute() as f64 / 60.0
        + time.second() as f64 / 3600.0)
        / 24.0;
    (365.25 * (year + 4716.0)).floor() + (30.6001 * (month + 1.0)).floor()
        + time.day() as f64
        + day_fraction
        + b
        - 1524.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    const MUNICH_LAT: f64 = 48.151;
    const MUNICH_LON: f64 = 11.569;

    fn service() -> AstronomyService {
        AstronomyService::initialize()
    }

    #[test]
    fn test_summer_solstice_noon_elevation() {
        // Solar noon in Munich on the solstice is around 11:14 UTC with a
        // culmination near 65.3 degrees.
        let t = Utc.with_ymd_and_hms(2024, 6, 21, 11, 14, 0).unwrap();
        let elevation = service().sun_elevation(MUNICH_LAT, MUNICH_LON, 530.0, t);
        assert!(
            (elevation - 65.3).abs() < 0.5,
            "expected ~65.3 deg, got {}",
            elevation
        );
    }

    #[test]
    fn test_midnight_is_below_horizon() {
        let t = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        let elevation = service().sun_elevation(MUNICH_LAT, MUNICH_LON, 530.0, t);
        assert!(elevation < -10.0, "got {}", elevation);
    }

    #[test]
    fn test_winter_noon_is_low() {
        let t = Utc.with_ymd_and_hms(2024, 12, 21, 11, 30, 0).unwrap();
        let elevation = service().sun_elevation(MUNICH_LAT, MUNICH_LON, 530.0, t);
        assert!(
            (elevation - 18.4).abs() < 1.0,
            "expected ~18.4 deg, got {}",
            elevation
        );
    }

    #[test]
    fn test_elevation_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        let a = service().sun_elevation(MUNICH_LAT, MUNICH_LON, 530.0, t);
        let b = service().sun_elevation(MUNICH_LAT, MUNICH_LON, 530.0, t);
        assert_eq!(a, b);
    }

    fn camtracker_config_with(content: &str) -> (tempfile::TempDir, CamTrackerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("camtracker.cfg");
        let mut file = std::fs::File::create(&config_path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let config = CamTrackerConfig {
            executable_path: dir.path().join("camtracker.exe"),
            config_path,
            learn_az_elev_path: dir.path().join("learn.dat"),
            sun_intensity_path: dir.path().join("sun.dat"),
            motor_offset_threshold: 10.0,
        };
        (dir, config)
    }

    #[test]
    fn test_coordinates_parsed_after_marker() {
        let (_dir, config) =
            camtracker_config_with("some header\n$1\n48.151\n11.569\n530.0\n$2\nother\n");
        let (lat, lon, alt) = AstronomyService::camtracker_coordinates(&config).unwrap();
        assert_eq!((lat, lon, alt), (48.151, 11.569, 530.0));
    }

    #[test]
    fn test_missing_marker_fails() {
        let (_dir, config) = camtracker_config_with("no marker here\n1.0\n2.0\n3.0\n");
        let err = AstronomyService::camtracker_coordinates(&config).unwrap_err();
        assert!(err.to_string().contains("marker"));
    }

    #[test]
    fn test_non_float_coordinate_fails() {
        let (_dir, config) = camtracker_config_with("$1\n48.151\nnot-a-number\n530.0\n");
        assert!(AstronomyService::camtracker_coordinates(&config).is_err());
    }
}
