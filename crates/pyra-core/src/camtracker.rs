// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! CamTracker driver and worker.
//!
//! CamTracker is a detached external program. It is started with
//! `-autostart` from its own directory, asked to stop by dropping an empty
//! `stop.txt` next to its executable, and watched through its motor-offset
//! learn log. The worker restarts it when the tracked position drifts past
//! the configured threshold.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};

use crate::config::CamTrackerConfig;
use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::process;

const ORIGIN: &str = "camtracker";

const ITERATION_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for the process to appear after launch and to vanish after a
/// stop request.
const START_STOP_TIMEOUT: Duration = Duration::from_secs(90);
const START_STOP_POLL: Duration = Duration::from_secs(5);

/// Minimum uptime before an invalid position triggers a restart.
const FLAP_SUPPRESSION: Duration = Duration::from_secs(300);

/// Image name CamTracker shows up under (matches `camtracker*.exe` too).
const PROCESS_PATTERN: &str = "camtracker";

fn tracker_error(details: impl Into<String>) -> PyraError {
    PyraError::Tracker {
        details: details.into(),
    }
}

/// One parsed line of the motor-offset learn log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnLogLine {
    pub julian_date: f64,
    pub tracker_elevation: f64,
    pub tracker_azimuth: f64,
    pub elevation_offset: f64,
    pub azimuth_offset: f64,
    pub ellipse_distance_px: f64,
}

impl LearnLogLine {
    fn parse(line: &str) -> Result<Self> {
        let values: Vec<f64> = line
            .split_whitespace()
            .map(|token| token.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| tracker_error(format!("learn log line unparsable: {}", e)))?;
        if values.len() != 6 {
            return Err(tracker_error(format!(
                "learn log line has {} fields, expected 6",
                values.len()
            )));
        }
        Ok(Self {
            julian_date: values[0],
            tracker_elevation: values[1],
            tracker_azimuth: values[2],
            elevation_offset: values[3],
            azimuth_offset: values[4],
            ellipse_distance_px: values[5],
        })
    }

    /// Calendar date of the julian timestamp.
    pub fn date(&self) -> Option<NaiveDate> {
        let days = (self.julian_date - 1_721_424.5).floor() as i32;
        NaiveDate::from_num_days_from_ce_opt(days)
    }
}

pub struct CamTrackerDriver;

impl CamTrackerDriver {
    fn stop_file(config: &CamTrackerConfig) -> PathBuf {
        config
            .executable_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("stop.txt")
    }

    pub fn is_running() -> bool {
        process::any_process_matches(&[PROCESS_PATTERN])
    }

    /// Launch CamTracker from its own directory and wait for the process.
    pub fn start(config: &CamTrackerConfig) -> Result<()> {
        let stop_file = Self::stop_file(config);
        if stop_file.exists() {
            // stale stop request would kill the fresh instance immediately
            fs::remove_file(&stop_file)
                .map_err(|e| tracker_error(format!("cannot remove stale stop.txt: {}", e)))?;
        }
        info!(executable = %config.executable_path.display(), "Starting CamTracker");
        process::spawn_detached(
            &config.executable_path,
            &["-autostart"],
            config.executable_path.parent(),
        )?;
        Self::wait_for_presence(true)
    }

    /// Request a graceful stop via `stop.txt`; force-kill on timeout.
    pub fn stop(config: &CamTrackerConfig) -> Result<()> {
        if !Self::is_running() {
            return Ok(());
        }
        fs::write(Self::stop_file(config), "")
            .map_err(|e| tracker_error(format!("cannot write stop.txt: {}", e)))?;
        if Self::wait_for_presence(false).is_err() {
            warn!("CamTracker ignored stop.txt, killing");
            process::kill_processes_by_name(&[PROCESS_PATTERN]);
        }
        Ok(())
    }

    fn wait_for_presence(present: bool) -> Result<()> {
        let deadline = Instant::now() + START_STOP_TIMEOUT;
        loop {
            if Self::is_running() == present {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(tracker_error(if present {
                    "CamTracker did not appear within 90 s"
                } else {
                    "CamTracker still running 90 s after stop request"
                }));
            }
            thread::sleep(START_STOP_POLL);
        }
    }

    /// Last line of the motor-offset learn log; its date must be today.
    pub fn read_learn_log(config: &CamTrackerConfig) -> Result<LearnLogLine> {
        let content = fs::read_to_string(&config.learn_az_elev_path)
            .map_err(|e| tracker_error(format!("cannot read learn log: {}", e)))?;
        let last_line = content
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| tracker_error("learn log is empty"))?;
        let parsed = LearnLogLine::parse(last_line)?;
        let today = Local::now().date_naive();
        if parsed.date() != Some(today) {
            return Err(tracker_error(format!(
                "learn log is stale (line date {:?}, today {})",
                parsed.date(),
                today
            )));
        }
        Ok(parsed)
    }

    /// Both motor offsets within the configured threshold.
    pub fn position_is_valid(config: &CamTrackerConfig) -> Result<bool> {
        let line = Self::read_learn_log(config)?;
        Ok(line.elevation_offset.abs() <= config.motor_offset_threshold
            && line.azimuth_offset.abs() <= config.motor_offset_threshold)
    }
}

pub struct CamTrackerWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl CamTrackerWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting CamTracker worker");
        let mut started_at: Option<Instant> = None;

        loop {
            let context = self.context.clone();
            let outcome =
                task::spawn_blocking(move || run_iteration(&context, started_at)).await;

            match outcome {
                Ok(Ok(new_started_at)) => {
                    started_at = new_started_at;
                    let _ = self.context.clear_exceptions(ORIGIN);
                }
                Ok(Err(error)) => {
                    warn!(error = %error, "CamTracker iteration failed");
                    let _ = self.context.record_exception(ORIGIN, &error);
                }
                Err(join_error) => {
                    warn!(error = %join_error, "CamTracker iteration panicked");
                    let error = PyraError::Runtime {
                        details: join_error.to_string(),
                    };
                    let _ = self.context.record_exception(ORIGIN, &error);
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(ITERATION_INTERVAL) => {}
            }
        }

        // teardown: no unsupervised tracking
        let context = self.context.clone();
        let _ = task::spawn_blocking(move || {
            if let Ok(config) = context.load_config() {
                let _ = CamTrackerDriver::stop(&config.camtracker);
            }
        })
        .await;
        info!("CamTracker worker stopped");
    }
}

/// Keep CamTracker aligned with the measurement decision; restart it when
/// the motor offsets drift, but never within the first five minutes.
fn run_iteration(
    context: &CoreContext,
    started_at: Option<Instant>,
) -> Result<Option<Instant>> {
    let config = context.load_config()?;
    let should_run = context.state_store.load()?.measurements_should_be_running == Some(true);
    let running = CamTrackerDriver::is_running();

    if should_run && !running {
        CamTrackerDriver::start(&config.camtracker)?;
        context.state_store.update_state(|state| {
            state.activity.camtracker_startups += 1;
            Ok(())
        })?;
        return Ok(Some(Instant::now()));
    }

    if !should_run {
        if running {
            info!("Measurements stopped, stopping CamTracker");
            CamTrackerDriver::stop(&config.camtracker)?;
        }
        return Ok(None);
    }

    // running and should run: watch the motor offsets
    let uptime = started_at.map(|at| at.elapsed()).unwrap_or(Duration::MAX);
    if uptime >= FLAP_SUPPRESSION {
        match CamTrackerDriver::position_is_valid(&config.camtracker) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Motor offsets out of range, restarting CamTracker");
                CamTrackerDriver::stop(&config.camtracker)?;
                CamTrackerDriver::start(&config.camtracker)?;
                context.state_store.update_state(|state| {
                    state.activity.camtracker_startups += 1;
                    Ok(())
                })?;
                return Ok(Some(Instant::now()));
            }
            Err(error) => {
                // a stale or unreadable log is reported but not restarted on
                warn!(error = %error, "Cannot judge CamTracker position");
            }
        }
    }
    Ok(started_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn test_config(dir: &Path) -> CamTrackerConfig {
        CamTrackerConfig {
            executable_path: dir.join("camtracker.exe"),
            config_path: dir.join("camtracker.cfg"),
            learn_az_elev_path: dir.join("learn_az_elev.dat"),
            sun_intensity_path: dir.join("sun_intensity.dat"),
            motor_offset_threshold: 50.0,
        }
    }

    fn todays_julian_date() -> f64 {
        Local::now().date_naive().num_days_from_ce() as f64 + 1_721_424.5 + 0.3
    }

    #[test]
    fn test_parse_learn_log_line() {
        let line = LearnLogLine::parse("2460000.5 45.2 180.1 -10.0 12.5 3.2").unwrap();
        assert_eq!(line.tracker_elevation, 45.2);
        assert_eq!(line.azimuth_offset, 12.5);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(LearnLogLine::parse("1.0 2.0 3.0").is_err());
        assert!(LearnLogLine::parse("a b c d e f").is_err());
    }

    #[test]
    fn test_read_learn_log_takes_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let jd = todays_julian_date();
        fs::write(
            &config.learn_az_elev_path,
            format!("{} 10 10 1 1 1\n{} 45.0 180.0 -3.0 4.0 2.0\n", jd, jd),
        )
        .unwrap();
        let line = CamTrackerDriver::read_learn_log(&config).unwrap();
        assert_eq!(line.tracker_elevation, 45.0);
    }

    #[test]
    fn test_read_learn_log_rejects_stale_date() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        // a julian date far in the past
        fs::write(&config.learn_az_elev_path, "2440000.5 45 180 1 1 1\n").unwrap();
        let error = CamTrackerDriver::read_learn_log(&config).unwrap_err();
        assert_eq!(error.subject(), "tracker-error");
    }

    #[test]
    fn test_position_validity_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let jd = todays_julian_date();

        fs::write(
            &config.learn_az_elev_path,
            format!("{} 45 180 -30.0 49.9 2\n", jd),
        )
        .unwrap();
        assert!(CamTrackerDriver::position_is_valid(&config).unwrap());

        fs::write(
            &config.learn_az_elev_path,
            format!("{} 45 180 -30.0 50.1 2\n", jd),
        )
        .unwrap();
        assert!(!CamTrackerDriver::position_is_valid(&config).unwrap());
    }

    #[test]
    fn test_julian_date_roundtrip() {
        let today = Local::now().date_naive();
        let line = LearnLogLine::parse(&format!("{} 0 0 0 0 0", todays_julian_date())).unwrap();
        assert_eq!(line.date(), Some(today));
    }
}
