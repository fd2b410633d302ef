// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! System monitor worker.
//!
//! Samples CPU, memory, disk, boot time and battery every 30 seconds,
//! raises storage and energy errors, and is the single writer of the
//! per-day activity files.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};

use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::state::{ActivityHistory, OperatingSystemState};

const ORIGIN: &str = "system-monitor";

const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// The activity file is written at most this often (and on shutdown).
const ACTIVITY_FLUSH_INTERVAL: Duration = Duration::from_secs(120);

const DISK_USAGE_LIMIT: f32 = 0.90;
const BATTERY_MINIMUM: f32 = 30.0;

/// State carried across sampling passes.
///
/// The `System` must live across passes: sysinfo reports CPU usage as the
/// delta between two refreshes of the same instance. The activity document
/// accumulates in memory and only hits the disk on flush.
struct MonitorState {
    system: System,
    history: Option<ActivityHistory>,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            system: System::new(),
            history: None,
        }
    }
}

/// Metrics of one sampling pass.
fn sample_operating_system(system: &mut System) -> OperatingSystemState {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu_usage: Vec<f32> = system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
    let memory_usage = if system.total_memory() > 0 {
        Some(system.used_memory() as f32 / system.total_memory() as f32 * 100.0)
    } else {
        None
    };
    let last_boot_time = DateTime::<Utc>::from_timestamp(System::boot_time() as i64, 0);

    OperatingSystemState {
        cpu_usage: Some(cpu_usage),
        memory_usage,
        last_boot_time,
        filled_disk_space_fraction: sample_disk_usage(),
        battery_level: read_battery_level(Path::new("/sys/class/power_supply")),
    }
}

/// Fill fraction of the fullest mounted disk.
fn sample_disk_usage() -> Option<f32> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| 1.0 - disk.available_space() as f32 / disk.total_space() as f32)
        .fold(None, |worst: Option<f32>, usage| {
            Some(worst.map_or(usage, |w| w.max(usage)))
        })
}

/// First readable `capacity` file under the power-supply class, in
/// percent. Stations without a UPS report nothing.
fn read_battery_level(power_supply_dir: &Path) -> Option<f32> {
    let entries = std::fs::read_dir(power_supply_dir).ok()?;
    for entry in entries.flatten() {
        let capacity_path = entry.path().join("capacity");
        if let Ok(content) = std::fs::read_to_string(&capacity_path) {
            if let Ok(level) = content.trim().parse::<f32>() {
                return Some(level);
            }
        }
    }
    None
}

pub struct MonitorWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl MonitorWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting system monitor");
        let mut monitor_state = MonitorState::new();
        let mut last_flush = tokio::time::Instant::now();

        loop {
            let context = self.context.clone();
            let flush_due = last_flush.elapsed() >= ACTIVITY_FLUSH_INTERVAL;
            let mut moved = monitor_state;
            let outcome = task::spawn_blocking(move || {
                let result = run_sample(&context, &mut moved, flush_due);
                (moved, result)
            })
            .await;

            match outcome {
                Ok((returned, Ok(()))) => {
                    monitor_state = returned;
                    if flush_due {
                        last_flush = tokio::time::Instant::now();
                    }
                    let _ = self.context.clear_exceptions(ORIGIN);
                }
                Ok((returned, Err(error))) => {
                    monitor_state = returned;
                    warn!(error = %error, "Monitor sample failed");
                    let _ = self.context.record_exception(ORIGIN, &error);
                }
                Err(join_error) => {
                    monitor_state = MonitorState::new();
                    warn!(error = %join_error, "Monitor sample panicked");
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
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            }
        }

        // clean shutdown writes the current day unconditionally
        let context = self.context.clone();
        let mut final_state = monitor_state;
        let _ = task::spawn_blocking(move || flush_history(&context, &mut final_state)).await;
        info!("System monitor stopped");
    }
}

fn run_sample(context: &CoreContext, monitor: &mut MonitorState, flush_due: bool) -> Result<()> {
    let os_state = sample_operating_system(&mut monitor.system);

    let disk_full = os_state
        .filled_disk_space_fraction
        .map(|f| f > DISK_USAGE_LIMIT)
        .unwrap_or(false);
    let battery_low = os_state
        .battery_level
        .map(|level| level < BATTERY_MINIMUM)
        .unwrap_or(false);

    context.state_store.update_state(|state| {
        state.operating_system_state = os_state.clone();
        Ok(())
    })?;

    if disk_full {
        let usage = os_state.filled_disk_space_fraction.unwrap_or(1.0) * 100.0;
        context.record_exception(
            ORIGIN,
            &PyraError::Storage {
                disk_usage_percent: usage as f64,
            },
        )?;
    }
    if battery_low {
        context.record_exception(
            ORIGIN,
            &PyraError::LowEnergy {
                battery_percent: os_state.battery_level.unwrap_or(0.0) as f64,
            },
        )?;
    }

    record_activity_sample(context, monitor)?;
    if flush_due {
        flush_history(context, monitor)?;
    }
    Ok(())
}

/// Fold the current state into the minute bucket of the local wall clock
/// and drain the startup counters. The document stays in memory; only the
/// flush writes it out.
fn record_activity_sample(context: &CoreContext, monitor: &mut MonitorState) -> Result<()> {
    let now = Local::now();
    let minute_index = (now.hour() * 60 + now.minute()) as usize;
    let date = now.date_naive();

    let (counters, is_measuring, has_errors, is_uploading) = context
        .state_store
        .update_state(|state| {
            let counters = state.activity.clone();
            state.activity.camtracker_startups = 0;
            state.activity.opus_startups = 0;
            state.activity.cli_calls = 0;
            Ok((
                counters,
                state.measurements_should_be_running == Some(true),
                !state.exceptions_state.current.is_empty(),
                state.activity.upload_is_running,
            ))
        })?;

    // day rollover: write the finished day out before opening the new one
    let stale = monitor
        .history
        .as_ref()
        .map(|history| history.date != date)
        .unwrap_or(true);
    if stale {
        if let Some(previous) = monitor.history.take() {
            previous
                .dump(&context.activity_dir)
                .map_err(|e| PyraError::Runtime {
                    details: format!("cannot write activity file: {}", e),
                })?;
        }
        monitor.history = Some(ActivityHistory::load_or_create(&context.activity_dir, date));
    }

    let history = monitor.history.as_mut().unwrap();
    history.sample(
        minute_index,
        true,
        is_measuring,
        has_errors,
        is_uploading,
        counters.camtracker_startups,
        counters.opus_startups,
        counters.cli_calls,
    );
    Ok(())
}

fn flush_history(context: &CoreContext, monitor: &mut MonitorState) -> Result<()> {
    if let Some(history) = monitor.history.as_ref() {
        history
            .dump(&context.activity_dir)
            .map_err(|e| PyraError::Runtime {
                details: format!("cannot flush activity file: {}", e),
            })?;
    }
    Ok(())
}
