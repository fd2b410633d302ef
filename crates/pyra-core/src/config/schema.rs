// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Configuration schema and validation.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration errors, mirroring the load/update failure modes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file missing: {path}")]
    FileMissing {
        /// Expected location of the document.
        path: PathBuf,
    },

    /// The file is not valid JSON.
    #[error("config parse error: {details}")]
    ParseError {
        /// Parser message.
        details: String,
    },

    /// The document violates the schema (shape, ranges, unknown keys,
    /// leaf type changes).
    #[error("config schema error: {details}")]
    SchemaError {
        /// What is invalid.
        details: String,
    },

    /// A constraint spanning multiple fields is violated.
    #[error("config cross-field error: {details}")]
    CrossFieldError {
        /// What is inconsistent.
        details: String,
    },

    /// The config lock could not be taken.
    #[error(transparent)]
    Lock(#[from] crate::locks::LockError),

    /// Reading or writing the document failed.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Measurement decision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    /// Decide from the configured triggers.
    Automatic,
    /// Decide from `manual_decision_result` (still gated on sun elevation).
    Manual,
    /// Decide from `cli_decision_result`.
    Cli,
}

/// A local wall-clock time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeOfDay {
    /// Hour in [0, 23].
    pub hour: u8,
    /// Minute in [0, 59].
    pub minute: u8,
    /// Second in [0, 59].
    pub second: u8,
}

impl TimeOfDay {
    /// Seconds since local midnight.
    pub fn as_seconds(&self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.hour > 23 || self.minute > 59 || self.second > 59 {
            return Err(ConfigError::SchemaError {
                details: format!(
                    "{}: {:02}:{:02}:{:02} is not a valid time of day",
                    field, self.hour, self.minute, self.second
                ),
            });
        }
        Ok(())
    }
}

/// Station-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Identifier of this field station, used in emails and uploads.
    pub station_id: String,
    /// Length of one supervisor iteration in seconds, 5-600.
    pub seconds_per_core_interval: u32,
    /// Global minimum sun elevation in degrees, 0-90.
    pub min_sun_elevation: f64,
    /// Test mode disables everything that talks to hardware or remote hosts.
    pub test_mode: bool,
}

/// Spectrometer program (OPUS) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpusConfig {
    /// Path of the OPUS executable.
    pub executable_path: PathBuf,
    /// Login username passed on the OPUS command line.
    pub username: String,
    /// Login password passed on the OPUS command line.
    pub password: String,
    /// Experiment file to load.
    pub experiment_path: PathBuf,
    /// Measurement macro to run.
    pub macro_path: PathBuf,
    /// IPv4 address of the EM27 instrument, pinged for liveness.
    pub em27_ip: String,
}

/// Sun tracker program (CamTracker) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CamTrackerConfig {
    /// Path of the CamTracker executable.
    pub executable_path: PathBuf,
    /// CamTracker's own config file (source of the station coordinates).
    pub config_path: PathBuf,
    /// Motor offset log ("learn az/elev" file).
    pub learn_az_elev_path: PathBuf,
    /// Sun intensity log.
    pub sun_intensity_path: PathBuf,
    /// Maximum tolerated motor offset in degrees.
    pub motor_offset_threshold: f64,
}

/// SMTP settings for error notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorEmailConfig {
    /// SMTP relay hostname.
    pub smtp_host: String,
    /// SMTP port; 587 uses STARTTLS, 465 uses implicit TLS.
    pub smtp_port: u16,
    /// SMTP login username.
    pub smtp_username: String,
    /// SMTP login password.
    pub smtp_password: String,
    /// Sender address of outgoing mails.
    pub sender_address: String,
    /// Whether to send mails at all.
    pub notify_recipients: bool,
    /// Comma-separated recipient list.
    pub recipients: String,
}

/// How the measurement decision is made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementDecisionConfig {
    /// Decision mode.
    pub mode: DecisionMode,
    /// Operator override used in manual mode.
    pub manual_decision_result: bool,
    /// Override written by the CLI, used in cli mode.
    pub cli_decision_result: bool,
}

/// Trigger clauses for automatic mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementTriggersConfig {
    /// Whether the time-of-day window participates.
    pub consider_time: bool,
    /// Whether the sun elevation clause participates.
    pub consider_sun_elevation: bool,
    /// Whether the Helios verdict participates.
    pub consider_helios: bool,
    /// Start of the measurement window (local time).
    pub start_time: TimeOfDay,
    /// End of the measurement window (local time).
    pub stop_time: TimeOfDay,
    /// Trigger-specific minimum sun elevation in degrees.
    pub min_sun_elevation: f64,
    /// Keep measurements alive this many seconds after the automatic
    /// decision flips to false.
    pub shutdown_grace_period: f64,
}

/// TUM enclosure (Siemens S7 PLC) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TumEnclosureConfig {
    /// IPv4 address of the PLC.
    pub ip: String,
    /// Fieldbus address-table version, 1 or 2.
    pub version: u8,
    /// When true, the supervisor keeps its hands off the enclosure and the
    /// operator drives it through the CLI.
    pub controlled_by_user: bool,
}

/// Remote-controllable power plug for the EM27.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerPlugConfig {
    /// Hostname or IPv4 of the plug.
    pub host: String,
    /// HTTP port of the plug.
    pub port: u16,
    /// HTTP basic-auth username.
    pub username: String,
    /// HTTP basic-auth password.
    pub password: String,
}

/// AEMET enclosure (HTTP datalogger) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AemetEnclosureConfig {
    /// IPv4 address of the datalogger.
    pub datalogger_ip: String,
    /// HTTP port of the datalogger CSAPI.
    pub datalogger_port: u16,
    /// HTTP basic-auth username.
    pub datalogger_username: String,
    /// HTTP basic-auth password.
    pub datalogger_password: String,
    /// Optional EM27 power plug.
    pub em27_power_plug: Option<PowerPlugConfig>,
    /// Whether the plug is switched alongside the cover.
    pub use_em27_power_plug: bool,
    /// When true, the supervisor keeps its hands off the enclosure.
    pub controlled_by_user: bool,
}

/// Helios cloud-cover classifier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeliosConfig {
    /// OS index of the sky camera.
    pub camera_id: u32,
    /// Length of the edge-fraction ring buffer.
    pub evaluation_size: usize,
    /// Seconds between frames.
    pub seconds_per_interval: f64,
    /// Upper hysteresis threshold on the mean edge fraction, in (0, 1].
    pub edge_detection_threshold: f64,
    /// Keep the processed frames on disk for later inspection.
    pub save_images: bool,
}

/// Whether a stream uploads single files or whole day folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadVariant {
    /// Each dated child is a single file.
    PerFile,
    /// Each dated child is a directory uploaded as one unit.
    PerDayFolder,
}

/// One upload stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadStreamConfig {
    /// Inactive streams are skipped entirely.
    pub is_active: bool,
    /// Local directory containing dated children.
    pub src_directory: PathBuf,
    /// Remote directory receiving the units.
    pub dst_directory: String,
    /// Regex a child name must match; must capture a date strictly before
    /// today for the child to become a transfer unit.
    pub dated_regex: String,
    /// Unit granularity.
    pub variant: UploadVariant,
    /// Delete the local unit once the remote copy is verified complete.
    pub remove_src_after_upload: bool,
}

/// Uploader connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// SFTP host.
    pub host: String,
    /// SFTP username.
    pub user: String,
    /// SFTP password.
    pub password: String,
    /// Configured streams.
    pub streams: Vec<UploadStreamConfig>,
}

/// The full operator-facing configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Must match the supervisor's own version.
    pub version: String,
    /// Station-wide settings.
    pub general: GeneralConfig,
    /// Spectrometer program.
    pub opus: OpusConfig,
    /// Sun tracker program.
    pub camtracker: CamTrackerConfig,
    /// Error notification channel.
    pub error_email: ErrorEmailConfig,
    /// Decision mode and overrides.
    pub measurement_decision: MeasurementDecisionConfig,
    /// Automatic-mode triggers.
    pub measurement_triggers: MeasurementTriggersConfig,
    /// TUM enclosure, if this station has one.
    pub tum_enclosure: Option<TumEnclosureConfig>,
    /// AEMET enclosure, if this station has one.
    pub aemet_enclosure: Option<AemetEnclosureConfig>,
    /// Cloud-cover classifier, if this station has a sky camera.
    pub helios: Option<HeliosConfig>,
    /// Uploader, if this station pushes data to an archive.
    pub upload: Option<UploadConfig>,
}

fn check_range_f64(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::SchemaError {
            details: format!("{}: {} is outside [{}, {}]", field, value, min, max),
        });
    }
    Ok(())
}

fn check_ipv4(field: &str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ConfigError::SchemaError {
            details: format!("{}: '{}' is not a valid IPv4 address", field, value),
        })
}

fn check_path_exists(field: &str, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::SchemaError {
            details: format!("{}: path '{}' does not exist", field, path.display()),
        });
    }
    Ok(())
}

impl Config {
    /// Validate ranges, addresses, times and path existence.
    ///
    /// `ignore_path_existence` is passed by CLI write paths that validate a
    /// document which will only exist on the target machine.
    pub fn validate(&self, ignore_path_existence: bool) -> Result<(), ConfigError> {
        if self.version != crate::VERSION {
            return Err(ConfigError::CrossFieldError {
                details: format!(
                    "config version '{}' does not match supervisor version '{}'",
                    self.version,
                    crate::VERSION
                ),
            });
        }

        let g = &self.general;
        if !(5..=600).contains(&g.seconds_per_core_interval) {
            return Err(ConfigError::SchemaError {
                details: format!(
                    "general.seconds_per_core_interval: {} is outside [5, 600]",
                    g.seconds_per_core_interval
                ),
            });
        }
        check_range_f64(
            "general.min_sun_elevation",
            g.min_sun_elevation,
            0.0,
            90.0,
        )?;

        check_ipv4("opus.em27_ip", &self.opus.em27_ip)?;

        let t = &self.measurement_triggers;
        t.start_time.validate("measurement_triggers.start_time")?;
        t.stop_time.validate("measurement_triggers.stop_time")?;
        check_range_f64(
            "measurement_triggers.min_sun_elevation",
            t.min_sun_elevation,
            0.0,
            90.0,
        )?;
        if t.shutdown_grace_period < 0.0 {
            return Err(ConfigError::SchemaError {
                details: format!(
                    "measurement_triggers.shutdown_grace_period: {} is negative",
                    t.shutdown_grace_period
                ),
            });
        }

        if let Some(tum) = &self.tum_enclosure {
            check_ipv4("tum_enclosure.ip", &tum.ip)?;
            if tum.version != 1 && tum.version != 2 {
                return Err(ConfigError::SchemaError {
                    details: format!("tum_enclosure.version: {} is not 1 or 2", tum.version),
                });
            }
        }

        if let Some(aemet) = &self.aemet_enclosure {
            check_ipv4("aemet_enclosure.datalogger_ip", &aemet.datalogger_ip)?;
            if aemet.use_em27_power_plug && aemet.em27_power_plug.is_none() {
                return Err(ConfigError::CrossFieldError {
                    details: "aemet_enclosure.use_em27_power_plug is set but no plug is configured"
                        .to_string(),
                });
            }
        }

        if let Some(helios) = &self.helios {
            if helios.evaluation_size == 0 {
                return Err(ConfigError::SchemaError {
                    details: "helios.evaluation_size: must be at least 1".to_string(),
                });
            }
            if !(helios.edge_detection_threshold > 0.0
                && helios.edge_detection_threshold <= 1.0)
            {
                return Err(ConfigError::SchemaError {
                    details: format!(
                        "helios.edge_detection_threshold: {} is outside (0, 1]",
                        helios.edge_detection_threshold
                    ),
                });
            }
            if helios.seconds_per_interval <= 0.0 {
                return Err(ConfigError::SchemaError {
                    details: "helios.seconds_per_interval: must be positive".to_string(),
                });
            }
        }

        if let Some(upload) = &self.upload {
            for (i, stream) in upload.streams.iter().enumerate() {
                regex::Regex::new(&stream.dated_regex).map_err(|e| {
                    ConfigError::SchemaError {
                        details: format!(
                            "upload.streams[{}].dated_regex: invalid regex: {}",
                            i, e
                        ),
                    }
                })?;
            }
        }

        if !ignore_path_existence {
            check_path_exists("opus.executable_path", &self.opus.executable_path)?;
            check_path_exists("opus.experiment_path", &self.opus.experiment_path)?;
            check_path_exists("opus.macro_path", &self.opus.macro_path)?;
            check_path_exists(
                "camtracker.executable_path",
                &self.camtracker.executable_path,
            )?;
            check_path_exists("camtracker.config_path", &self.camtracker.config_path)?;
            check_path_exists(
                "camtracker.learn_az_elev_path",
                &self.camtracker.learn_az_elev_path,
            )?;
            if let Some(upload) = &self.upload {
                for (i, stream) in upload.streams.iter().enumerate() {
                    if stream.is_active {
                        check_path_exists(
                            &format!("upload.streams[{}].src_directory", i),
                            &stream.src_directory,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A valid configuration whose paths point into `dir`.
    pub fn config_in_dir(dir: &Path) -> Config {
        for name in [
            "opus.exe",
            "experiment.xpm",
            "macro.mtx",
            "camtracker.exe",
            "camtracker.cfg",
            "learn_az_elev.dat",
        ] {
            std::fs::write(dir.join(name), b"fixture").unwrap();
        }
        Config {
            version: crate::VERSION.to_string(),
            general: GeneralConfig {
                station_id: "tst".to_string(),
                seconds_per_core_interval: 30,
                min_sun_elevation: 11.0,
                test_mode: false,
            },
            opus: OpusConfig {
                executable_path: dir.join("opus.exe"),
                username: "Default".to_string(),
                password: "pyra".to_string(),
                experiment_path: dir.join("experiment.xpm"),
                macro_path: dir.join("macro.mtx"),
                em27_ip: "10.10.0.1".to_string(),
            },
            camtracker: CamTrackerConfig {
                executable_path: dir.join("camtracker.exe"),
                config_path: dir.join("camtracker.cfg"),
                learn_az_elev_path: dir.join("learn_az_elev.dat"),
                sun_intensity_path: dir.join("sun_intensity.dat"),
                motor_offset_threshold: 10.0,
            },
            error_email: ErrorEmailConfig {
                smtp_host: "smtp.example.org".to_string(),
                smtp_port: 587,
                smtp_username: "station".to_string(),
                smtp_password: "secret".to_string(),
                sender_address: "station@example.org".to_string(),
                notify_recipients: true,
                recipients: "ops@example.org".to_string(),
            },
            measurement_decision: MeasurementDecisionConfig {
                mode: DecisionMode::Automatic,
                manual_decision_result: false,
                cli_decision_result: false,
            },
            measurement_triggers: MeasurementTriggersConfig {
                consider_time: true,
                consider_sun_elevation: true,
                consider_helios: false,
                start_time: TimeOfDay {
                    hour: 7,
                    minute: 0,
                    second: 0,
                },
                stop_time: TimeOfDay {
                    hour: 21,
                    minute: 0,
                    second: 0,
                },
                min_sun_elevation: 11.0,
                shutdown_grace_period: 300.0,
            },
            tum_enclosure: None,
            aemet_enclosure: None,
            helios: None,
            upload: None,
        }
    }
}
