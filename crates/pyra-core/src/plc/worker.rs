// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! TUM enclosure worker.
//!
//! Mirrors the PLC into the state document, stamps rain detections, and
//! drives the cover to follow the measurement decision unless the operator
//! has taken over. PLC failures are tolerated for ten minutes before they
//! become a ledger entry.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};

use crate::config::{Config, TumEnclosureConfig};
use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::plc::s7::S7Client;
use crate::plc::tum::TumEnclosureDriver;

const ORIGIN: &str = "tum-enclosure";

/// Continuous failure tolerated before a `plc-error` goes to the ledger.
const FAILURE_TOLERANCE: Duration = Duration::from_secs(600);

const ITERATION_INTERVAL: Duration = Duration::from_secs(30);

pub struct TumEnclosureWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl TumEnclosureWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting TUM enclosure worker");
        let mut driver: Option<TumEnclosureDriver<S7Client>> = None;
        let mut first_failure: Option<chrono::DateTime<Utc>> = None;

        loop {
            let context = self.context.clone();
            let moved_driver = driver.take();
            let outcome = task::spawn_blocking(move || {
                let result = run_iteration(&context, moved_driver);
                match result {
                    Ok(driver) => (Some(driver), Ok(())),
                    Err(error) => (None, Err(error)),
                }
            })
            .await;

            match outcome {
                Ok((returned_driver, Ok(()))) => {
                    driver = returned_driver;
                    first_failure = None;
                    let _ = self.context.clear_exceptions(ORIGIN);
                }
                Ok((_, Err(error))) => {
                    warn!(error = %error, "Enclosure iteration failed");
                    let since = *first_failure.get_or_insert_with(Utc::now);
                    let elapsed = (Utc::now() - since)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= FAILURE_TOLERANCE {
                        let _ = self.context.record_exception(ORIGIN, &error);
                    }
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Enclosure iteration panicked");
                    let _ = self.context.record_exception(
                        ORIGIN,
                        &PyraError::Runtime {
                            details: join_error.to_string(),
                        },
                    );
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
        info!("TUM enclosure worker stopped");
    }
}

/// One blocking iteration. Returns the (possibly freshly connected)
/// driver so the session survives across iterations.
fn run_iteration(
    context: &CoreContext,
    driver: Option<TumEnclosureDriver<S7Client>>,
) -> Result<TumEnclosureDriver<S7Client>> {
    let config = context.load_config()?;
    let enclosure_config = config.tum_enclosure.clone().ok_or_else(|| PyraError::Plc {
        operation: "config".to_string(),
        details: "tum_enclosure section disappeared".to_string(),
    })?;

    let mut driver = match driver {
        Some(mut driver) => {
            driver.update_config(&enclosure_config)?;
            driver
        }
        None => TumEnclosureDriver::connect(&enclosure_config)?,
    };

    let snapshot = driver.read()?;
    let rain_now = snapshot.state.rain == Some(true);
    let should_measure = context.state_store.load()?.measurements_should_be_running
        == Some(true);

    context.state_store.update_state(|state| {
        state.tum_enclosure_state = snapshot.clone();
        if rain_now {
            state.last_rain_detection_time = Some(Utc::now());
        }
        Ok(())
    })?;

    if enclosure_config.controlled_by_user {
        return Ok(driver);
    }

    if snapshot.state.reset_needed == Some(true) {
        info!("PLC requests a reset, pulsing reset bit");
        driver.reset()?;
    }

    sync_cover(&mut driver, &config, &enclosure_config, &snapshot, should_measure, rain_now)?;
    Ok(driver)
}

fn sync_cover(
    driver: &mut TumEnclosureDriver<S7Client>,
    _config: &Config,
    _enclosure_config: &TumEnclosureConfig,
    snapshot: &crate::state::TumEnclosureState,
    should_measure: bool,
    rain_now: bool,
) -> Result<()> {
    if should_measure && !rain_now {
        // closed -> opening: hand the cover to the tracker
        if snapshot.control.sync_to_tracker != Some(true) {
            info!("Measurements resumed, syncing cover to tracker");
            driver.set_sync_to_tracker(true)?;
        }
        return Ok(());
    }

    // open -> closing
    let cover_open = snapshot.state.cover_closed == Some(false);
    let still_synced = snapshot.control.sync_to_tracker == Some(true);
    if cover_open || still_synced {
        info!(rain = rain_now, "Measurements stopped, closing cover");
        driver.force_cover_close()?;
    }
    Ok(())
}
