// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! OPUS worker.
//!
//! Keeps the OPUS process aligned with the sun, the loaded experiment
//! aligned with the config, and the measurement macro aligned with the
//! decision. On its first iteration it reconciles with whatever OPUS is
//! already doing on the machine.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::opus::driver::OpusDriver;

const ORIGIN: &str = "opus";

const ITERATION_INTERVAL: Duration = Duration::from_secs(30);

/// Back-off after OPUS had to be closed forcefully.
const FORCED_CLOSE_BACKOFF: Duration = Duration::from_secs(120);

const PING_INTERVAL: Duration = Duration::from_secs(300);

/// Ping failures and macro-thread absence are tolerated this long after
/// measurements start.
const STARTUP_GRACE: Duration = Duration::from_secs(60);

/// Cover angles outside this range mean the beam path is blocked.
const COVER_OPEN_MIN_ANGLE: i64 = 20;
const COVER_OPEN_MAX_ANGLE: i64 = 340;

struct OpusLoopState {
    driver: OpusDriver,
    reconciled: bool,
    active_macro: Option<(PathBuf, i64)>,
    measurement_start: Option<Instant>,
    last_ping: Option<Instant>,
}

impl OpusLoopState {
    fn new() -> Self {
        Self {
            driver: OpusDriver::default(),
            reconciled: false,
            active_macro: None,
            measurement_start: None,
            last_ping: None,
        }
    }
}

pub struct OpusWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl OpusWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting OPUS worker");
        let mut loop_state = OpusLoopState::new();

        loop {
            let context = self.context.clone();
            let moved = loop_state;
            let (returned, outcome) =
                match task::spawn_blocking(move || run_iteration(context, moved)).await {
                    Ok(result) => result,
                    Err(join_error) => {
                        warn!(error = %join_error, "OPUS iteration panicked");
                        let error = PyraError::Runtime {
                            details: join_error.to_string(),
                        };
                        let _ = self.context.record_exception(ORIGIN, &error);
                        (OpusLoopState::new(), Ok(ITERATION_INTERVAL))
                    }
                };
            loop_state = returned;

            let sleep_interval = match outcome {
                Ok(interval) => {
                    let _ = self.context.clear_exceptions(ORIGIN);
                    interval
                }
                Err(error) => {
                    warn!(error = %error, "OPUS iteration failed");
                    let _ = self.context.record_exception(ORIGIN, &error);
                    if matches!(error, PyraError::Runtime { .. }) {
                        // fatal: restart the loop from a clean slate
                        loop_state = OpusLoopState::new();
                    }
                    ITERATION_INTERVAL
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep_interval) => {}
            }
        }

        // teardown: leave no macro running unsupervised
        let mut final_state = loop_state;
        let _ = task::spawn_blocking(move || {
            if let Some((path, id)) = final_state.active_macro.take() {
                let _ = final_state.driver.stop_macro(&path, id);
            }
        })
        .await;
        info!("OPUS worker stopped");
    }
}

/// One blocking pass over the start/stop/reload/macro/ping duties. Returns
/// the loop state and the sleep until the next pass.
fn run_iteration(
    context: CoreContext,
    mut loop_state: OpusLoopState,
) -> (OpusLoopState, Result<Duration>) {
    let result = iteration_inner(&context, &mut loop_state);
    (loop_state, result)
}

fn iteration_inner(context: &CoreContext, loop_state: &mut OpusLoopState) -> Result<Duration> {
    let config = context.load_config()?;
    let state = context.state_store.load()?;
    let sun_elevation = state.position.sun_elevation.unwrap_or(-90.0);

    if !loop_state.reconciled {
        reconcile(context, loop_state)?;
        loop_state.reconciled = true;
    }

    // the process follows the sun, not the measurement decision: warm
    // optics before measuring, cold only at night
    let opus_should_run = sun_elevation >= config.general.min_sun_elevation;
    if opus_should_run && !loop_state.driver.is_running() {
        loop_state.driver.start(&config.opus)?;
        context.state_store.update_state(|state| {
            state.activity.opus_startups += 1;
            Ok(())
        })?;
    } else if !opus_should_run && loop_state.driver.is_running() {
        info!(sun_elevation, "Sun below minimum, closing OPUS");
        loop_state.active_macro = None;
        loop_state.measurement_start = None;
        loop_state.driver.stop()?;
        return Ok(FORCED_CLOSE_BACKOFF);
    }
    if !opus_should_run {
        return Ok(ITERATION_INTERVAL);
    }

    // keep the loaded experiment aligned with the config
    let loaded = loop_state.driver.get_loaded_experiment().ok();
    if loaded.as_deref() != Some(config.opus.experiment_path.as_path()) {
        loop_state.driver.load_experiment(&config.opus.experiment_path)?;
        context.state_store.update_state(|state| {
            state.opus_state.experiment_path = Some(config.opus.experiment_path.clone());
            Ok(())
        })?;
    }

    let mut should_measure = state.measurements_should_be_running == Some(true);
    if let Some(angle) = cover_angle(&config, &state) {
        let cover_open = COVER_OPEN_MIN_ANGLE < angle && angle < COVER_OPEN_MAX_ANGLE;
        if should_measure && !cover_open {
            info!(angle, "Cover not meaningfully open, holding measurements");
            should_measure = false;
        }
    }

    sync_macro(context, loop_state, &config, should_measure)?;
    ping_em27(loop_state, &config)?;
    Ok(ITERATION_INTERVAL)
}

/// First-iteration reconciliation with a live OPUS instance.
fn reconcile(context: &CoreContext, loop_state: &mut OpusLoopState) -> Result<()> {
    if !loop_state.driver.is_running() {
        return Ok(());
    }
    if !loop_state.driver.some_macro_is_running()? {
        info!("Found OPUS running without a macro, adopting it");
        return Ok(());
    }
    let previous = context.state_store.load()?.opus_state;
    if let (Some(macro_path), Some(macro_id)) = (previous.macro_path, previous.macro_id) {
        if loop_state.driver.macro_is_running(macro_id)? {
            info!(macro_id, "Adopting macro from a previous run");
            loop_state.active_macro = Some((macro_path, macro_id));
            loop_state.measurement_start = Some(Instant::now());
            return Ok(());
        }
    }
    warn!("OPUS is running an unknown macro, stopping it");
    loop_state.driver.stop()
}

fn cover_angle(config: &Config, state: &crate::state::StateDocument) -> Option<i64> {
    config.tum_enclosure.as_ref()?;
    state.tum_enclosure_state.actors.current_angle
}

fn sync_macro(
    context: &CoreContext,
    loop_state: &mut OpusLoopState,
    config: &Config,
    should_measure: bool,
) -> Result<()> {
    match (&loop_state.active_macro, should_measure) {
        (None, true) => {
            let macro_id = loop_state.driver.start_macro(&config.opus.macro_path)?;
            loop_state.active_macro = Some((config.opus.macro_path.clone(), macro_id));
            loop_state.measurement_start = Some(Instant::now());
            context.state_store.update_state(|state| {
                state.opus_state.macro_path = Some(config.opus.macro_path.clone());
                state.opus_state.macro_id = Some(macro_id);
                Ok(())
            })?;
        }
        (Some((path, id)), true) => {
            let (path, id) = (path.clone(), *id);
            if path != config.opus.macro_path {
                info!("Configured macro changed, restarting measurement");
                loop_state.driver.stop_macro(&path, id)?;
                loop_state.active_macro = None;
                return sync_macro(context, loop_state, config, true);
            }
            // crash detection past the first minute
            let past_grace = loop_state
                .measurement_start
                .map(|start| start.elapsed() > STARTUP_GRACE)
                .unwrap_or(true);
            if past_grace && !loop_state.driver.macro_is_running(id)? {
                loop_state.active_macro = None;
                loop_state.measurement_start = None;
                return Err(PyraError::Runtime {
                    details: format!("macro {} vanished while measuring", id),
                });
            }
        }
        (Some((path, id)), false) => {
            let (path, id) = (path.clone(), *id);
            info!(macro_id = id, "Stopping measurement macro");
            loop_state.driver.stop_macro(&path, id)?;
            loop_state.active_macro = None;
            loop_state.measurement_start = None;
            context.state_store.update_state(|state| {
                state.opus_state.macro_id = None;
                Ok(())
            })?;
        }
        (None, false) => {}
    }
    Ok(())
}

fn ping_em27(loop_state: &mut OpusLoopState, config: &Config) -> Result<()> {
    let due = loop_state
        .last_ping
        .map(|at| at.elapsed() >= PING_INTERVAL)
        .unwrap_or(true);
    if !due {
        return Ok(());
    }
    loop_state.last_ping = Some(Instant::now());
    if loop_state.driver.ping_em27(&config.opus) {
        return Ok(());
    }
    let within_grace = loop_state
        .measurement_start
        .map(|start| start.elapsed() < STARTUP_GRACE)
        .unwrap_or(false);
    if within_grace {
        info!("EM27 ping failed right after startup, tolerated");
        return Ok(());
    }
    Err(PyraError::Spectrometer {
        details: format!("EM27 at {} does not answer pings", config.opus.em27_ip),
    })
}
