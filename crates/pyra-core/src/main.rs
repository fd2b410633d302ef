// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Pyra Core - EM27 Field Station Supervisor
//!
//! Entry point: set up logging, write the pid file, run the supervisor
//! until SIGINT/SIGTERM.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pyra_core::context::CoreContext;
use pyra_core::supervisor::{default_camera_factory, Supervisor};

const PID_FILE_NAME: &str = "pyra-core.pid";

fn project_root() -> PathBuf {
    std::env::var_os("PYRA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let root = project_root();
    let context = CoreContext::new(&root);

    // Log to stdout and to the file the error emails quote from.
    std::fs::create_dir_all(&context.logs_dir)
        .with_context(|| format!("cannot create {}", context.logs_dir.display()))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(context.logs_dir.join("core.log"))
        .context("cannot open core.log")?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();

    info!(version = pyra_core::VERSION, root = %root.display(), "Starting Pyra Core");

    // The pid file is how the operator CLI finds and stops this process.
    let runtime_dir = root.join("runtime-data");
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("cannot create {}", runtime_dir.display()))?;
    let pid_file = runtime_dir.join(PID_FILE_NAME);
    std::fs::write(&pid_file, std::process::id().to_string()).context("cannot write pid file")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received");
        let _ = shutdown_tx.send(true);
    });

    let outcome = Supervisor::new(context, default_camera_factory())
        .run(shutdown_rx)
        .await;

    let _ = std::fs::remove_file(&pid_file);
    if let Err(e) = &outcome {
        error!(error = %e, "Supervisor exited with error");
    }
    outcome.map_err(Into::into)
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
