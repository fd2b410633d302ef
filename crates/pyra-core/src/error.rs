// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Error types for pyra-core.
//!
//! Every subsystem error maps onto a stable subject code. The codes are what
//! the exception ledger stores and what error emails report, so they must
//! stay stable across releases.

use std::fmt;

/// Result type using PyraError
pub type Result<T> = std::result::Result<T, PyraError>;

/// Unified runtime error carried by the exception ledger.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PyraError {
    /// Invalid configuration document or unresolvable path.
    Config {
        /// What is wrong with the document.
        reason: String,
    },

    /// Fieldbus connect timeout, verified-write mismatch, or unreachable PLC.
    Plc {
        /// The failed operation.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Datalogger HTTP failure or a snapshot staler than the freshness window.
    Datalogger {
        /// Error details.
        details: String,
    },

    /// Spectrometer IPC not working, macro crash, ping failure, or startup timeout.
    Spectrometer {
        /// Error details.
        details: String,
    },

    /// Tracker start/stop timeout, log parse failure, or persistent desync.
    Tracker {
        /// Error details.
        details: String,
    },

    /// Camera initialization or repeated frame read failure.
    Camera {
        /// Error details.
        details: String,
    },

    /// Upload transport unreachable or persistent transfer failure.
    Upload {
        /// Error details.
        details: String,
    },

    /// Disk usage above the storage alarm threshold.
    Storage {
        /// Current disk usage in percent.
        disk_usage_percent: f64,
    },

    /// Battery below the energy alarm threshold.
    LowEnergy {
        /// Current battery level in percent.
        battery_percent: f64,
    },

    /// Catch-all for unexpected failures inside a worker.
    Runtime {
        /// Error details.
        details: String,
    },
}

impl PyraError {
    /// Stable subject code for the exception ledger and error emails.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config-error",
            Self::Plc { .. } => "plc-error",
            Self::Datalogger { .. } => "datalogger-error",
            Self::Spectrometer { .. } => "spectrometer-error",
            Self::Tracker { .. } => "tracker-error",
            Self::Camera { .. } => "camera-error",
            Self::Upload { .. } => "upload-error",
            Self::Storage { .. } => "storage-error",
            Self::LowEnergy { .. } => "low-energy-error",
            Self::Runtime { .. } => "runtime-error",
        }
    }
}

impl fmt::Display for PyraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "invalid configuration: {}", reason),
            Self::Plc { operation, details } => {
                write!(f, "PLC error during '{}': {}", operation, details)
            }
            Self::Datalogger { details } => write!(f, "datalogger error: {}", details),
            Self::Spectrometer { details } => write!(f, "spectrometer error: {}", details),
            Self::Tracker { details } => write!(f, "tracker error: {}", details),
            Self::Camera { details } => write!(f, "camera error: {}", details),
            Self::Upload { details } => write!(f, "upload error: {}", details),
            Self::Storage { disk_usage_percent } => {
                write!(f, "disk is {:.1}% full", disk_usage_percent)
            }
            Self::LowEnergy { battery_percent } => {
                write!(f, "battery is down to {:.1}%", battery_percent)
            }
            Self::Runtime { details } => write!(f, "runtime error: {}", details),
        }
    }
}

impl std::error::Error for PyraError {}

impl From<std::io::Error> for PyraError {
    fn from(err: std::io::Error) -> Self {
        PyraError::Runtime {
            details: format!("io: {}", err),
        }
    }
}

impl From<serde_json::Error> for PyraError {
    fn from(err: serde_json::Error) -> Self {
        PyraError::Runtime {
            details: format!("json: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_codes() {
        let cases: Vec<(PyraError, &str)> = vec![
            (
                PyraError::Config {
                    reason: "x".to_string(),
                },
                "config-error",
            ),
            (
                PyraError::Plc {
                    operation: "connect".to_string(),
                    details: "timeout".to_string(),
                },
                "plc-error",
            ),
            (
                PyraError::Datalogger {
                    details: "stale".to_string(),
                },
                "datalogger-error",
            ),
            (
                PyraError::Spectrometer {
                    details: "ping".to_string(),
                },
                "spectrometer-error",
            ),
            (
                PyraError::Tracker {
                    details: "offset".to_string(),
                },
                "tracker-error",
            ),
            (
                PyraError::Camera {
                    details: "init".to_string(),
                },
                "camera-error",
            ),
            (
                PyraError::Upload {
                    details: "unreachable".to_string(),
                },
                "upload-error",
            ),
            (
                PyraError::Storage {
                    disk_usage_percent: 95.0,
                },
                "storage-error",
            ),
            (
                PyraError::LowEnergy {
                    battery_percent: 12.0,
                },
                "low-energy-error",
            ),
            (
                PyraError::Runtime {
                    details: "boom".to_string(),
                },
                "runtime-error",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.subject(), expected, "wrong code for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_display_includes_details() {
        let err = PyraError::Plc {
            operation: "set_cover_angle".to_string(),
            details: "echo mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "PLC error during 'set_cover_angle': echo mismatch"
        );

        let err = PyraError::Storage {
            disk_usage_percent: 93.25,
        };
        assert_eq!(err.to_string(), "disk is 93.2% full");
    }
}
