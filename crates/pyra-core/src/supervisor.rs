// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! The supervisor: worker lifecycle, 12-hour self-restarts, email
//! dispatch.
//!
//! One record per activity. Every iteration the supervisor evaluates
//! which workers the current config wants, starts and stops them
//! accordingly, respawns long-lived ones, and diffs the exception ledger
//! against the already-notified set to drive the error-email channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aemet::AemetEnclosureWorker;
use crate::camtracker::CamTrackerWorker;
use crate::config::Config;
use crate::context::CoreContext;
use crate::decision::DecisionWorker;
use crate::email::{self, EmailClient};
use crate::error::{PyraError, Result};
use crate::helios::camera::CameraFactory;
use crate::helios::HeliosWorker;
use crate::monitor::MonitorWorker;
use crate::opus::OpusWorker;
use crate::plc::TumEnclosureWorker;
use crate::upload::UploadWorker;

/// Hard uptime cap per worker; long-running stability measure.
const WORKER_RESTART_CEILING: Duration = Duration::from_secs(12 * 3600);

/// Smallest pause between supervisor iterations.
const MIN_ITERATION_PAUSE: Duration = Duration::from_secs(5);

/// Repeated crashes within the restart ceiling become a persistent
/// ledger item.
const CRASH_TOLERANCE: u32 = 3;

type SpawnFn = Box<dyn Fn(CoreContext, watch::Receiver<bool>) -> JoinHandle<()> + Send>;

struct WorkerRecord {
    name: &'static str,
    should_be_running: fn(&Config) -> bool,
    spawn: SpawnFn,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    started_at: Option<Instant>,
    crash_count: u32,
    last_crash_reset: Instant,
}

impl WorkerRecord {
    fn new(name: &'static str, should_be_running: fn(&Config) -> bool, spawn: SpawnFn) -> Self {
        Self {
            name,
            should_be_running,
            spawn,
            handle: None,
            shutdown_tx: None,
            started_at: None,
            crash_count: 0,
            last_crash_reset: Instant::now(),
        }
    }

    fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn start(&mut self, context: &CoreContext) {
        info!(worker = self.name, "Starting worker");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.handle = Some((self.spawn)(context.clone(), shutdown_rx));
        self.shutdown_tx = Some(shutdown_tx);
        self.started_at = Some(Instant::now());
    }

    async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            info!(worker = self.name, "Joining worker");
            if let Err(join_error) = handle.await {
                warn!(worker = self.name, error = %join_error, "Worker panicked on join");
            }
        }
        self.started_at = None;
    }
}

pub struct Supervisor {
    context: CoreContext,
    workers: Vec<WorkerRecord>,
}

impl Supervisor {
    pub fn new(context: CoreContext, camera_factory: CameraFactory) -> Self {
        let workers = build_worker_records(camera_factory);
        Self { context, workers }
    }

    /// Run until `shutdown_rx` flips. A missing or invalid configuration
    /// at startup is fatal.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let config = self.context.load_config().map_err(|e| {
            error!(error = %e, "No legal configuration, refusing to start");
            e
        })?;
        info!(
            station_id = %config.general.station_id,
            version = crate::VERSION,
            "Supervisor starting"
        );
        self.context.state_store.initialize()?;

        loop {
            let iteration_started = Instant::now();
            info!("Starting iteration");

            match self.context.load_config() {
                Ok(config) => {
                    self.reconcile_workers(&config).await;
                    self.dispatch_emails(&config).await;
                }
                Err(error) => {
                    warn!(error = %error, "Config unreadable, keeping current workers");
                    let _ = self.context.record_exception("supervisor", &error);
                }
            }

            let interval = self
                .context
                .load_config()
                .map(|c| Duration::from_secs(c.general.seconds_per_core_interval as u64))
                .unwrap_or(MIN_ITERATION_PAUSE);
            let elapsed = iteration_started.elapsed();
            let pause = interval.saturating_sub(elapsed).max(MIN_ITERATION_PAUSE);

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Shutting down workers");
        for worker in &mut self.workers {
            worker.stop().await;
        }
        info!("Supervisor stopped");
        Ok(())
    }

    async fn reconcile_workers(&mut self, config: &Config) {
        for index in 0..self.workers.len() {
            let wanted = (self.workers[index].should_be_running)(config);
            let alive = self.workers[index].is_alive();
            let crashed = self.workers[index].handle.is_some() && !alive;

            if crashed {
                let worker = &mut self.workers[index];
                worker.handle = None;
                worker.started_at = None;
                worker.crash_count += 1;
                warn!(
                    worker = worker.name,
                    crash_count = worker.crash_count,
                    "Worker exited unexpectedly"
                );
                if worker.last_crash_reset.elapsed() > WORKER_RESTART_CEILING {
                    worker.crash_count = 1;
                    worker.last_crash_reset = Instant::now();
                }
                if worker.crash_count >= CRASH_TOLERANCE {
                    let name = worker.name;
                    let error = PyraError::Runtime {
                        details: format!("worker '{}' keeps crashing", name),
                    };
                    let _ = self.context.record_exception("supervisor", &error);
                }
            }

            let over_ceiling = self.workers[index]
                .started_at
                .map(|at| at.elapsed() > WORKER_RESTART_CEILING)
                .unwrap_or(false);

            if wanted && over_ceiling {
                info!(
                    worker = self.workers[index].name,
                    "12-hour ceiling reached, respawning"
                );
                self.workers[index].stop().await;
            }

            let alive = self.workers[index].is_alive();
            if wanted && !alive {
                let context = self.context.clone();
                self.workers[index].start(&context);
            } else if !wanted && alive {
                info!(worker = self.workers[index].name, "No longer wanted, stopping");
                self.workers[index].stop().await;
            }
        }
    }

    /// Emails on the edges of the ledger: fresh items, and the drain.
    async fn dispatch_emails(&self, config: &Config) {
        let Ok(state) = self.context.state_store.load() else {
            return;
        };
        let pending = state.exceptions_state.pending_notifications();
        let resolved = state.exceptions_state.is_resolved();
        if pending.is_empty() && !resolved {
            return;
        }

        let client = EmailClient::new(config.error_email.clone());
        let logs_dir = self.context.logs_dir.clone();
        let station_id = config.general.station_id.clone();
        let sent = tokio::task::spawn_blocking(move || {
            let log_window = email::recent_log_window(&logs_dir);
            if !pending.is_empty() {
                client.send_new_exceptions(&station_id, &pending, &log_window)
            } else {
                client.send_all_resolved(&station_id, &log_window)
            }
        })
        .await;

        match sent {
            Ok(Ok(())) => {
                let _ = self.context.state_store.update_state(|state| {
                    state.exceptions_state.mark_notified();
                    Ok(())
                });
            }
            Ok(Err(error)) => warn!(error = %error, "Cannot send error email"),
            Err(join_error) => warn!(error = %join_error, "Email dispatch panicked"),
        }
    }
}

fn build_worker_records(camera_factory: CameraFactory) -> Vec<WorkerRecord> {
    let factory = Arc::clone(&camera_factory);
    vec![
        WorkerRecord::new(
            "measurement-decision",
            |_| true,
            Box::new(|context, shutdown_rx| {
                tokio::spawn(DecisionWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "system-monitor",
            |_| true,
            Box::new(|context, shutdown_rx| {
                tokio::spawn(MonitorWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "tum-enclosure",
            |config| !config.general.test_mode && config.tum_enclosure.is_some(),
            Box::new(|context, shutdown_rx| {
                tokio::spawn(TumEnclosureWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "aemet-enclosure",
            |config| !config.general.test_mode && config.aemet_enclosure.is_some(),
            Box::new(|context, shutdown_rx| {
                tokio::spawn(AemetEnclosureWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "opus",
            |config| !config.general.test_mode,
            Box::new(|context, shutdown_rx| {
                tokio::spawn(OpusWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "camtracker",
            |config| !config.general.test_mode,
            Box::new(|context, shutdown_rx| {
                tokio::spawn(CamTrackerWorker::new(context, shutdown_rx).run())
            }),
        ),
        WorkerRecord::new(
            "helios",
            |config| !config.general.test_mode && config.helios.is_some(),
            Box::new(move |context, shutdown_rx| {
                tokio::spawn(
                    HeliosWorker::new(context, shutdown_rx, Arc::clone(&factory)).run(),
                )
            }),
        ),
        WorkerRecord::new(
            "upload",
            |config| !config.general.test_mode && config.upload.is_some(),
            Box::new(|context, shutdown_rx| {
                tokio::spawn(UploadWorker::new(context, shutdown_rx).run())
            }),
        ),
    ]
}

/// Production camera factory. Stations plug their capture backend in
/// here; without one, Helios surfaces a camera error and keeps retrying.
pub fn default_camera_factory() -> CameraFactory {
    Arc::new(|camera_id| {
        Err(PyraError::Camera {
            details: format!("no capture backend for camera {}", camera_id),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::test_fixtures;

    #[test]
    fn test_worker_gating_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_fixtures::config_in_dir(dir.path());
        let records = build_worker_records(default_camera_factory());
        let by_name = |name: &str| {
            records
                .iter()
                .find(|record| record.name == name)
                .unwrap()
                .should_be_running
        };

        assert!(by_name("measurement-decision")(&config));
        assert!(by_name("opus")(&config));

        config.general.test_mode = true;
        assert!(by_name("measurement-decision")(&config));
        assert!(!by_name("opus")(&config));
        assert!(!by_name("upload")(&config));
    }

    #[tokio::test]
    async fn test_worker_record_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let context = CoreContext::new(dir.path());
        context.state_store.initialize().unwrap();

        let mut record = WorkerRecord::new(
            "test-worker",
            |_| true,
            Box::new(|_, mut shutdown_rx| {
                tokio::spawn(async move {
                    let _ = shutdown_rx.changed().await;
                })
            }),
        );
        record.start(&context);
        assert!(record.is_alive());
        record.stop().await;
        assert!(!record.is_alive());
    }
}
