// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! The persisted runtime-state document.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exceptions::ExceptionsState;

/// Three-valued classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    /// Conditions are good.
    Yes,
    /// Conditions are bad.
    No,
    /// Not enough samples yet.
    Inconclusive,
}

/// Station position and the latest sun elevation computed from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees north.
    pub latitude: Option<f64>,
    /// Longitude in degrees east.
    pub longitude: Option<f64>,
    /// Altitude in meters.
    pub altitude: Option<f64>,
    /// Sun elevation in degrees above the horizon.
    pub sun_elevation: Option<f64>,
}

/// Actor readings of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumActors {
    /// Fan speed register.
    pub fan_speed: Option<i64>,
    /// Current cover angle in degrees.
    pub current_angle: Option<i64>,
}

/// Control bits of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumControl {
    /// Automatic temperature regulation.
    pub auto_temp_mode: Option<bool>,
    /// Manual control enabled.
    pub manual_control: Option<bool>,
    /// Manual temperature mode.
    pub manual_temp_mode: Option<bool>,
    /// Cover follows the tracker.
    pub sync_to_tracker: Option<bool>,
}

/// Sensor readings of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumSensors {
    /// Relative humidity in percent.
    pub humidity: Option<i64>,
    /// Temperature in degrees Celsius.
    pub temperature: Option<i64>,
}

/// State flags of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumStateFlags {
    /// Cover reports fully closed.
    pub cover_closed: Option<bool>,
    /// Motor fault. Absent from the v2 address table, hence `None` there.
    pub motor_failed: Option<bool>,
    /// Rain sensor asserted.
    pub rain: Option<bool>,
    /// PLC requests a reset.
    pub reset_needed: Option<bool>,
    /// UPS alert line.
    pub ups_alert: Option<bool>,
}

/// Power rails of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumPower {
    /// Camera rail.
    pub camera: Option<bool>,
    /// Computer rail.
    pub computer: Option<bool>,
    /// Heater rail.
    pub heater: Option<bool>,
    /// Router rail.
    pub router: Option<bool>,
    /// Spectrometer rail.
    pub spectrometer: Option<bool>,
}

/// Connection-presence rails of the TUM enclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumConnections {
    /// Camera connected.
    pub camera: Option<bool>,
    /// Computer connected.
    pub computer: Option<bool>,
    /// Heater connected.
    pub heater: Option<bool>,
    /// Router connected.
    pub router: Option<bool>,
    /// Spectrometer connected.
    pub spectrometer: Option<bool>,
}

/// Snapshot of the last successful TUM PLC read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumEnclosureState {
    /// When the snapshot was taken.
    pub last_full_fetch: Option<DateTime<Utc>>,
    /// Actors.
    pub actors: TumActors,
    /// Control bits.
    pub control: TumControl,
    /// Sensors.
    pub sensors: TumSensors,
    /// State flags.
    pub state: TumStateFlags,
    /// Power rails.
    pub power: TumPower,
    /// Connection rails.
    pub connections: TumConnections,
}

/// Snapshot of the last successful AEMET datalogger read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AemetEnclosureState {
    /// When the snapshot was taken.
    pub last_full_fetch: Option<DateTime<Utc>>,
    /// Datalogger runs its own automatic program.
    pub auto_mode: Option<bool>,
    /// Enhanced security mode.
    pub enhanced_security_mode: Option<bool>,
    /// Cover reported open.
    pub cover_is_open: Option<bool>,
    /// Weather alert level; 2 blocks all cover movement.
    pub alert_level: Option<i64>,
    /// Fault code; nonzero blocks the cover until cleared.
    pub averia_fault_code: Option<i64>,
    /// Rain sensor asserted.
    pub rain: Option<bool>,
    /// Wind speed in m/s.
    pub wind_speed: Option<f64>,
    /// Temperature in degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// EM27 power plug state.
    pub em27_powered: Option<bool>,
}

/// What the supervisor knows about the running OPUS instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpusState {
    /// Experiment last seen loaded.
    pub experiment_path: Option<PathBuf>,
    /// Macro last started by the supervisor.
    pub macro_path: Option<PathBuf>,
    /// Id of that macro, used for adoption after restarts.
    pub macro_id: Option<i64>,
}

/// Sampled OS metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatingSystemState {
    /// Usage per CPU core in percent.
    pub cpu_usage: Option<Vec<f32>>,
    /// Memory usage in percent.
    pub memory_usage: Option<f32>,
    /// Last boot time.
    pub last_boot_time: Option<DateTime<Utc>>,
    /// Fraction of the data disk in use, 0-1.
    pub filled_disk_space_fraction: Option<f32>,
    /// Battery level in percent if the machine has one.
    pub battery_level: Option<f32>,
}

/// Counters drained into the daily activity file by the system monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityCounters {
    /// CamTracker starts since the last drain.
    pub camtracker_startups: u32,
    /// OPUS starts since the last drain.
    pub opus_startups: u32,
    /// CLI invocations since the last drain.
    pub cli_calls: u32,
    /// The uploader is currently inside an iteration.
    pub upload_is_running: bool,
}

/// The persisted runtime-state document.
///
/// Rebuilt on each supervisor start; only the exception ledger and the
/// activity counters survive `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// The current measurement decision.
    pub measurements_should_be_running: Option<bool>,
    /// Latest Helios verdict.
    pub helios_indicates_good_conditions: Option<TriState>,
    /// Station position and sun elevation.
    pub position: Position,
    /// TUM enclosure snapshot.
    pub tum_enclosure_state: TumEnclosureState,
    /// AEMET enclosure snapshot.
    pub aemet_enclosure_state: AemetEnclosureState,
    /// OPUS bookkeeping.
    pub opus_state: OpusState,
    /// OS metrics.
    pub operating_system_state: OperatingSystemState,
    /// Active and notified exceptions.
    pub exceptions_state: ExceptionsState,
    /// When rain was last seen asserted (UTC).
    pub last_rain_detection_time: Option<DateTime<Utc>>,
    /// When the automatic decision was last good (UTC), for the grace period.
    pub last_good_automatic_decision_time: Option<DateTime<Utc>>,
    /// CLI invocations since the supervisor last looked.
    pub recent_cli_calls: u32,
    /// Counters for the activity history.
    pub activity: ActivityCounters,
}

impl StateDocument {
    /// Fresh document that keeps the parts surviving a supervisor restart.
    pub fn reset_from(previous: StateDocument) -> Self {
        Self {
            exceptions_state: previous.exceptions_state,
            activity: previous.activity,
            recent_cli_calls: previous.recent_cli_calls,
            ..Self::default()
        }
    }

    /// True when any enclosure snapshot currently reports rain.
    pub fn rain_is_asserted(&self) -> bool {
        self.tum_enclosure_state.state.rain == Some(true)
            || self.aemet_enclosure_state.rain == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_is_empty() {
        let doc = StateDocument::default();
        assert_eq!(doc.measurements_should_be_running, None);
        assert_eq!(doc.helios_indicates_good_conditions, None);
        assert!(!doc.rain_is_asserted());
    }

    #[test]
    fn test_reset_preserves_ledger_and_counters() {
        let mut doc = StateDocument {
            measurements_should_be_running: Some(true),
            recent_cli_calls: 3,
            ..Default::default()
        };
        doc.activity.opus_startups = 2;
        doc.exceptions_state.current.push(
            crate::state::ExceptionStateItem {
                origin: "opus".to_string(),
                subject: "spectrometer-error".to_string(),
                details: "ping failed".to_string(),
                send_emails: true,
            },
        );

        let reset = StateDocument::reset_from(doc);
        assert_eq!(reset.measurements_should_be_running, None);
        assert_eq!(reset.recent_cli_calls, 3);
        assert_eq!(reset.activity.opus_startups, 2);
        assert_eq!(reset.exceptions_state.current.len(), 1);
    }

    #[test]
    fn test_rain_from_either_enclosure() {
        let mut doc = StateDocument::default();
        doc.tum_enclosure_state.state.rain = Some(true);
        assert!(doc.rain_is_asserted());

        let mut doc = StateDocument::default();
        doc.aemet_enclosure_state.rain = Some(true);
        assert!(doc.rain_is_asserted());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut doc = StateDocument::default();
        doc.helios_indicates_good_conditions = Some(TriState::Inconclusive);
        doc.position.sun_elevation = Some(23.5);

        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("inconclusive"));
        let back: StateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
