// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! AEMET enclosure worker.
//!
//! Mirrors the datalogger into the state document, stamps rain, and moves
//! the cover (and optionally the EM27 power plug) to follow the
//! measurement decision.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::aemet::client::{AemetDatalogger, Em27PowerPlug};
use crate::context::CoreContext;
use crate::error::{PyraError, Result};

const ORIGIN: &str = "aemet-enclosure";

const ITERATION_INTERVAL: Duration = Duration::from_secs(30);

pub struct AemetEnclosureWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl AemetEnclosureWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting AEMET enclosure worker");
        let mut client: Option<AemetDatalogger> = None;

        loop {
            match self.iteration(&mut client).await {
                Ok(()) => {
                    let _ = self.context.clear_exceptions(ORIGIN);
                }
                Err(error) => {
                    warn!(error = %error, "AEMET iteration failed");
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
        info!("AEMET enclosure worker stopped");
    }

    async fn iteration(&self, client: &mut Option<AemetDatalogger>) -> Result<()> {
        let config = self.context.load_config()?;
        let enclosure_config = config.aemet_enclosure.clone().ok_or_else(|| {
            PyraError::Datalogger {
                details: "aemet_enclosure section disappeared".to_string(),
            }
        })?;

        match client {
            Some(datalogger) => datalogger.update_config(enclosure_config.clone()),
            None => *client = Some(AemetDatalogger::new(enclosure_config.clone())?),
        }
        let datalogger = client.as_mut().unwrap();

        let snapshot = datalogger.read().await?;
        let rain_now = snapshot.rain == Some(true);
        let should_measure = self
            .context
            .state_store
            .load()?
            .measurements_should_be_running
            == Some(true);

        self.context.state_store.update_state(|state| {
            state.aemet_enclosure_state = snapshot.clone();
            if rain_now {
                state.last_rain_detection_time = Some(Utc::now());
            }
            Ok(())
        })?;

        if enclosure_config.controlled_by_user {
            return Ok(());
        }

        let want_open = should_measure && !rain_now;
        if want_open && snapshot.cover_is_open != Some(true) {
            info!("Measurements resumed, opening AEMET cover");
            datalogger.open_cover().await?;
        } else if !want_open && snapshot.cover_is_open != Some(false) {
            info!(rain = rain_now, "Measurements stopped, closing AEMET cover");
            datalogger.close_cover().await?;
        }

        if enclosure_config.use_em27_power_plug {
            if let Some(plug_config) = enclosure_config.em27_power_plug.clone() {
                let powered = snapshot.em27_powered;
                if powered != Some(want_open) {
                    let plug = Em27PowerPlug::new(plug_config)?;
                    plug.set_power(want_open).await?;
                    self.context.state_store.update_state(|state| {
                        state.aemet_enclosure_state.em27_powered = Some(want_open);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    }
}
