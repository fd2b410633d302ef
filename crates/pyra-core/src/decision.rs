// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! The measurement decision engine.
//!
//! [`evaluate`] is a pure function of its inputs; the worker around it
//! gathers those inputs (sun elevation, rain window, classifier verdict,
//! triggers, overrides) each interval and writes the outcome into state.

use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{Config, DecisionMode};
use crate::context::CoreContext;
use crate::error::Result;
use crate::state::TriState;

/// Any rain reading within this window overrides all other inputs.
pub const RAIN_WINDOW: Duration = Duration::from_secs(180);

/// Everything the decision depends on.
#[derive(Debug, Clone)]
pub struct DecisionInputs {
    /// Wall clock, UTC.
    pub now_utc: DateTime<Utc>,
    /// Seconds since local midnight, for the time-of-day window.
    pub now_local_seconds: u32,
    /// Current sun elevation in degrees.
    pub sun_elevation: f64,
    /// When rain was last seen asserted.
    pub last_rain_detection_time: Option<DateTime<Utc>>,
    /// Latest classifier verdict.
    pub helios: Option<TriState>,
    /// When the automatic decision was last good.
    pub last_good_automatic_decision_time: Option<DateTime<Utc>>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionOutcome {
    /// Whether measurements should be running.
    pub should_run: bool,
    /// Updated timestamp of the last good automatic decision.
    pub last_good_automatic_decision_time: Option<DateTime<Utc>>,
}

/// Evaluate the decision. Pure: same inputs, same outcome.
pub fn evaluate(config: &Config, inputs: &DecisionInputs) -> DecisionOutcome {
    let mut last_good = inputs.last_good_automatic_decision_time;

    // Rain overrides everything, with no grace.
    if let Some(rain_time) = inputs.last_rain_detection_time {
        let age = inputs.now_utc.signed_duration_since(rain_time);
        if age >= chrono::Duration::zero()
            && age.to_std().map(|d| d <= RAIN_WINDOW).unwrap_or(false)
        {
            return DecisionOutcome {
                should_run: false,
                last_good_automatic_decision_time: last_good,
            };
        }
    }

    let decision = &config.measurement_decision;
    let should_run = match decision.mode {
        DecisionMode::Manual => {
            decision.manual_decision_result
                && inputs.sun_elevation >= config.general.min_sun_elevation
        }
        DecisionMode::Cli => decision.cli_decision_result,
        DecisionMode::Automatic => {
            let triggers = &config.measurement_triggers;
            let mut any_clause = false;
            let mut raw = true;

            if triggers.consider_sun_elevation {
                any_clause = true;
                let threshold = config
                    .general
                    .min_sun_elevation
                    .max(triggers.min_sun_elevation);
                raw &= inputs.sun_elevation > threshold;
            }
            if triggers.consider_time {
                any_clause = true;
                raw &= triggers.start_time.as_seconds() < inputs.now_local_seconds
                    && inputs.now_local_seconds < triggers.stop_time.as_seconds();
            }
            if triggers.consider_helios {
                any_clause = true;
                raw &= inputs.helios == Some(TriState::Yes);
            }

            let raw = any_clause && raw;
            if raw {
                last_good = Some(inputs.now_utc);
                true
            } else {
                // Grace period: a recent good automatic decision keeps
                // measurements alive through brief cloud passages.
                match last_good {
                    Some(good) => {
                        let age = inputs.now_utc.signed_duration_since(good);
                        age >= chrono::Duration::zero()
                            && age.num_seconds() as f64
                                <= config.measurement_triggers.shutdown_grace_period
                    }
                    None => false,
                }
            }
        }
    };

    DecisionOutcome {
        should_run,
        last_good_automatic_decision_time: last_good,
    }
}

/// Worker computing the decision each interval.
pub struct DecisionWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl DecisionWorker {
    /// Worker over the shared context.
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    /// Run until shutdown. Errors are recorded in the ledger and the loop
    /// continues after a back-off.
    pub async fn run(mut self) {
        info!("Decision worker started");
        loop {
            let interval = match self.iteration().await {
                Ok(interval) => interval,
                Err(e) => {
                    error!(error = %e, "Decision iteration failed");
                    let _ = self.context.record_exception("measurement-decision", &e);
                    Duration::from_secs(30)
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Decision worker stopped");
    }

    async fn iteration(&self) -> Result<Duration> {
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || iteration_blocking(&context))
            .await
            .map_err(|e| crate::error::PyraError::Runtime {
                details: format!("decision task join: {}", e),
            })?
    }
}

fn iteration_blocking(context: &CoreContext) -> Result<Duration> {
    let config = context.load_config()?;
    let (latitude, longitude, altitude) =
        crate::astronomy::AstronomyService::camtracker_coordinates(&config.camtracker)?;

    let now_utc = Utc::now();
    let sun_elevation = context
        .astronomy
        .sun_elevation(latitude, longitude, altitude, now_utc);

    let now_local = Local::now();
    let now_local_seconds = now_local.num_seconds_from_midnight();

    context.state_store.update_state(|state| {
        let inputs = DecisionInputs {
            now_utc,
            now_local_seconds,
            sun_elevation,
            last_rain_detection_time: state.last_rain_detection_time,
            helios: state.helios_indicates_good_conditions,
            last_good_automatic_decision_time: state.last_good_automatic_decision_time,
        };
        let outcome = evaluate(&config, &inputs);

        state.position.latitude = Some(latitude);
        state.position.longitude = Some(longitude);
        state.position.altitude = Some(altitude);
        state.position.sun_elevation = Some(sun_elevation);
        state.last_good_automatic_decision_time = outcome.last_good_automatic_decision_time;

        if state.measurements_should_be_running != Some(outcome.should_run) {
            info!(
                should_run = outcome.should_run,
                sun_elevation = sun_elevation,
                "Measurement decision changed"
            );
        } else {
            debug!(should_run = outcome.should_run, "Measurement decision unchanged");
        }
        state.measurements_should_be_running = Some(outcome.should_run);
        state.exceptions_state.clear_exception_origin("measurement-decision");
        Ok(())
    })?;

    Ok(Duration::from_secs(
        config.general.seconds_per_core_interval.max(5) as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::test_fixtures;
    use crate::config::TimeOfDay;
    use chrono::TimeZone;

    fn config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_fixtures::config_in_dir(dir.path());
        (dir, config)
    }

    fn inputs_at_noon(sun_elevation: f64) -> DecisionInputs {
        DecisionInputs {
            now_utc: Utc.with_ymd_and_hms(2024, 7, 12, 12, 0, 0).unwrap(),
            now_local_seconds: 12 * 3600,
            sun_elevation,
            last_rain_detection_time: None,
            helios: None,
            last_good_automatic_decision_time: None,
        }
    }

    #[test]
    fn test_automatic_all_clauses_good() {
        let (_dir, config) = config();
        let outcome = evaluate(&config, &inputs_at_noon(45.0));
        assert!(outcome.should_run);
        assert!(outcome.last_good_automatic_decision_time.is_some());
    }

    #[test]
    fn test_automatic_low_sun_fails() {
        let (_dir, config) = config();
        let outcome = evaluate(&config, &inputs_at_noon(5.0));
        assert!(!outcome.should_run);
    }

    #[test]
    fn test_automatic_uses_max_of_both_elevation_thresholds() {
        let (_dir, mut config) = config();
        config.general.min_sun_elevation = 5.0;
        config.measurement_triggers.min_sun_elevation = 20.0;
        assert!(!evaluate(&config, &inputs_at_noon(15.0)).should_run);
        assert!(evaluate(&config, &inputs_at_noon(25.0)).should_run);
    }

    #[test]
    fn test_automatic_outside_time_window_fails() {
        let (_dir, mut config) = config();
        config.measurement_triggers.start_time = TimeOfDay {
            hour: 13,
            minute: 0,
            second: 0,
        };
        let outcome = evaluate(&config, &inputs_at_noon(45.0));
        assert!(!outcome.should_run);
    }

    #[test]
    fn test_automatic_no_active_clause_is_false() {
        let (_dir, mut config) = config();
        config.measurement_triggers.consider_time = false;
        config.measurement_triggers.consider_sun_elevation = false;
        config.measurement_triggers.consider_helios = false;
        assert!(!evaluate(&config, &inputs_at_noon(45.0)).should_run);
    }

    #[test]
    fn test_helios_clause() {
        let (_dir, mut config) = config();
        config.measurement_triggers.consider_helios = true;

        let mut inputs = inputs_at_noon(45.0);
        assert!(!evaluate(&config, &inputs).should_run, "no verdict yet");

        inputs.helios = Some(TriState::Inconclusive);
        assert!(!evaluate(&config, &inputs).should_run);

        inputs.helios = Some(TriState::Yes);
        assert!(evaluate(&config, &inputs).should_run);
    }

    #[test]
    fn test_rain_overrides_everything() {
        let (_dir, config) = config();
        let mut inputs = inputs_at_noon(45.0);
        inputs.last_rain_detection_time =
            Some(inputs.now_utc - chrono::Duration::seconds(60));
        assert!(!evaluate(&config, &inputs).should_run);

        // Outside the 180 s window the rain reading no longer binds.
        inputs.last_rain_detection_time =
            Some(inputs.now_utc - chrono::Duration::seconds(181));
        assert!(evaluate(&config, &inputs).should_run);
    }

    #[test]
    fn test_rain_overrides_grace_period() {
        let (_dir, config) = config();
        let mut inputs = inputs_at_noon(45.0);
        inputs.last_good_automatic_decision_time =
            Some(inputs.now_utc - chrono::Duration::seconds(10));
        inputs.last_rain_detection_time = Some(inputs.now_utc);
        assert!(!evaluate(&config, &inputs).should_run);
    }

    #[test]
    fn test_grace_period_keeps_running() {
        let (_dir, config) = config();
        // Sun just dropped below threshold, good decision 2 minutes ago,
        // grace period 300 s.
        let mut inputs = inputs_at_noon(5.0);
        inputs.last_good_automatic_decision_time =
            Some(inputs.now_utc - chrono::Duration::seconds(120));
        let outcome = evaluate(&config, &inputs);
        assert!(outcome.should_run);
        // The good timestamp is not refreshed by a grace continuation.
        assert_eq!(
            outcome.last_good_automatic_decision_time,
            inputs.last_good_automatic_decision_time
        );
    }

    #[test]
    fn test_grace_period_expires() {
        let (_dir, config) = config();
        let mut inputs = inputs_at_noon(5.0);
        inputs.last_good_automatic_decision_time =
            Some(inputs.now_utc - chrono::Duration::seconds(301));
        assert!(!evaluate(&config, &inputs).should_run);
    }

    #[test]
    fn test_manual_mode_has_no_grace() {
        let (_dir, mut config) = config();
        config.measurement_decision.mode = DecisionMode::Manual;
        config.measurement_decision.manual_decision_result = false;
        let mut inputs = inputs_at_noon(45.0);
        inputs.last_good_automatic_decision_time = Some(inputs.now_utc);
        assert!(!evaluate(&config, &inputs).should_run);
    }

    #[test]
    fn test_manual_mode_gated_on_sun() {
        let (_dir, mut config) = config();
        config.measurement_decision.mode = DecisionMode::Manual;
        config.measurement_decision.manual_decision_result = true;
        assert!(evaluate(&config, &inputs_at_noon(45.0)).should_run);
        assert!(!evaluate(&config, &inputs_at_noon(5.0)).should_run);
    }

    #[test]
    fn test_cli_mode_ignores_sun() {
        let (_dir, mut config) = config();
        config.measurement_decision.mode = DecisionMode::Cli;
        config.measurement_decision.cli_decision_result = true;
        assert!(evaluate(&config, &inputs_at_noon(-10.0)).should_run);
    }

    #[test]
    fn test_pure_function_same_inputs_same_output() {
        let (_dir, config) = config();
        let inputs = inputs_at_noon(30.0);
        assert_eq!(evaluate(&config, &inputs), evaluate(&config, &inputs));
    }
}
