// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Helios worker.
//!
//! Owns the camera while the sun is up: auto-exposure, lens-circle
//! detection, one edge fraction per interval, and the hysteresis verdict
//! into `helios_indicates_good_conditions`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::HeliosConfig;
use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::helios::camera::{self, Camera, CameraFactory};
use crate::helios::evaluation::HeliosEvaluator;
use crate::helios::vision::{self, LensCircle};
use crate::state::TriState;

const ORIGIN: &str = "helios";

/// Pause while the sun is below the general minimum elevation.
const NIGHT_PAUSE: Duration = Duration::from_secs(300);

/// Pause after three consecutive frame failures, before re-init.
const REINIT_PAUSE: Duration = Duration::from_secs(15);

const MAX_CONSECUTIVE_FRAME_FAILURES: u32 = 3;

struct HeliosSession {
    camera: Box<dyn Camera>,
    lens_circle: LensCircle,
}

pub struct HeliosWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
    camera_factory: CameraFactory,
}

impl HeliosWorker {
    pub fn new(
        context: CoreContext,
        shutdown_rx: watch::Receiver<bool>,
        camera_factory: CameraFactory,
    ) -> Self {
        Self {
            context,
            shutdown_rx,
            camera_factory,
        }
    }

    pub async fn run(mut self) {
        info!("Starting Helios worker");
        let mut session: Option<HeliosSession> = None;
        let mut evaluator: Option<HeliosEvaluator> = None;
        let mut frame_failures: u32 = 0;

        loop {
            let context = self.context.clone();
            let factory = self.camera_factory.clone();
            let moved_session = session.take();
            let moved_evaluator = evaluator.take();
            let outcome = task::spawn_blocking(move || {
                run_iteration(&context, &factory, moved_session, moved_evaluator, frame_failures)
            })
            .await;

            let sleep_interval = match outcome {
                Ok(iteration) => {
                    session = iteration.session;
                    evaluator = iteration.evaluator;
                    frame_failures = iteration.frame_failures;
                    match iteration.result {
                        Ok(interval) => {
                            let _ = self.context.clear_exceptions(ORIGIN);
                            interval
                        }
                        Err(error) => {
                            warn!(error = %error, "Helios iteration failed");
                            let _ = self.context.record_exception(ORIGIN, &error);
                            let _ = self.context.state_store.update_state(|state| {
                                state.helios_indicates_good_conditions =
                                    Some(TriState::Inconclusive);
                                Ok(())
                            });
                            Duration::from_secs(30)
                        }
                    }
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Helios iteration panicked");
                    let error = PyraError::Runtime {
                        details: join_error.to_string(),
                    };
                    let _ = self.context.record_exception(ORIGIN, &error);
                    frame_failures = 0;
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
                _ = tokio::time::sleep(sleep_interval) => {}
            }
        }
        // the camera handle is dropped here, releasing the device
        info!("Helios worker stopped");
    }
}

struct IterationOutcome {
    session: Option<HeliosSession>,
    evaluator: Option<HeliosEvaluator>,
    frame_failures: u32,
    result: Result<Duration>,
}

fn run_iteration(
    context: &CoreContext,
    factory: &CameraFactory,
    mut session: Option<HeliosSession>,
    mut evaluator: Option<HeliosEvaluator>,
    mut frame_failures: u32,
) -> IterationOutcome {
    let result = (|| -> Result<Duration> {
        let config = context.load_config()?;
        let helios_config = config.helios.clone().ok_or_else(|| PyraError::Camera {
            details: "helios section disappeared".to_string(),
        })?;

        let state = context.state_store.load()?;
        let sun_elevation = state.position.sun_elevation.unwrap_or(-90.0);
        if sun_elevation < config.general.min_sun_elevation {
            // night: release the camera and report nothing
            if session.take().is_some() {
                info!("Sun below minimum, releasing camera");
            }
            if let Some(evaluator) = evaluator.as_mut() {
                evaluator.reset();
            }
            context.state_store.update_state(|state| {
                state.helios_indicates_good_conditions = None;
                Ok(())
            })?;
            return Ok(NIGHT_PAUSE);
        }

        match evaluator.as_mut() {
            Some(evaluator) => evaluator.update_config(
                helios_config.evaluation_size,
                helios_config.edge_detection_threshold,
            ),
            None => {
                evaluator = Some(HeliosEvaluator::new(
                    helios_config.evaluation_size,
                    helios_config.edge_detection_threshold,
                ));
            }
        }
        let evaluator = evaluator.as_mut().unwrap();

        if session.is_none() {
            session = Some(open_session(factory, &helios_config)?);
            frame_failures = 0;
        }
        let active_session = session.as_mut().unwrap();

        let frame = match active_session.camera.grab() {
            Ok(frame) => {
                frame_failures = 0;
                frame
            }
            Err(error) => {
                frame_failures += 1;
                if frame_failures < MAX_CONSECUTIVE_FRAME_FAILURES {
                    debug!(frame_failures, "Frame grab failed, retrying next interval");
                    return Ok(Duration::from_secs_f64(helios_config.seconds_per_interval));
                }
                if frame_failures == MAX_CONSECUTIVE_FRAME_FAILURES {
                    warn!("Three dropped frames, re-initializing camera");
                    session = None;
                    evaluator.reset();
                    return Ok(REINIT_PAUSE);
                }
                return Err(error);
            }
        };

        let processed = vision::preprocess(&frame);
        let edges = vision::dilate(&vision::edge_map(&processed));
        let fraction = vision::edge_fraction(&edges, &active_session.lens_circle);
        let verdict = evaluator.push(fraction);
        debug!(fraction, verdict = ?verdict, "Helios frame evaluated");

        if helios_config.save_images {
            save_frame(context, &frame)?;
        }

        context.state_store.update_state(|state| {
            state.helios_indicates_good_conditions = Some(verdict);
            Ok(())
        })?;
        Ok(Duration::from_secs_f64(helios_config.seconds_per_interval))
    })();

    // a failed iteration drops the session so the next one starts clean
    if result.is_err() {
        session = None;
        frame_failures = 0;
    }
    IterationOutcome {
        session,
        evaluator,
        frame_failures,
        result,
    }
}

/// Open the camera, calibrate exposure, and locate the lens circle.
fn open_session(factory: &CameraFactory, config: &HeliosConfig) -> Result<HeliosSession> {
    let mut camera = camera::initialize(factory, config.camera_id)?;
    camera::auto_adjust_exposure(camera.as_mut())?;
    let frame = camera.grab()?;
    let processed = vision::preprocess(&frame);
    let lens_circle = vision::detect_lens_circle(&processed).ok_or_else(|| PyraError::Camera {
        details: "lens circle not found".to_string(),
    })?;
    info!(
        cx = lens_circle.center_x,
        cy = lens_circle.center_y,
        r = lens_circle.radius,
        "Lens circle located"
    );
    Ok(HeliosSession {
        camera,
        lens_circle,
    })
}

fn save_frame(context: &CoreContext, frame: &image::GrayImage) -> Result<()> {
    let dir: PathBuf = context
        .logs_dir
        .parent()
        .map(|parent| parent.join("helios"))
        .unwrap_or_else(|| PathBuf::from("logs/helios"));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.jpg", Utc::now().format("%Y%m%d-%H%M%S")));
    frame.save(&path).map_err(|e| PyraError::Camera {
        details: format!("cannot save frame: {}", e),
    })?;
    Ok(())
}
