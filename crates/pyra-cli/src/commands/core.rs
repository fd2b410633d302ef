// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! `pyra-cli core` - lifecycle of the supervisor process.
//!
//! The supervisor writes `runtime-data/pyra-core.pid` on startup and
//! removes it on clean exit; these commands work off that file plus the
//! OS process table (a stale file after a crash does not count as
//! running).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use clap::Subcommand;

use pyra_core::process;

use crate::{CliError, CliResult};

const PID_FILE_NAME: &str = "pyra-core.pid";

#[derive(Subcommand)]
pub enum CoreCommand {
    /// Start one supervisor process in the background.
    Start,
    /// Terminate the running supervisor.
    Stop,
    /// Exit 0 and print the PID when a supervisor is running.
    IsRunning,
}

pub fn run(root: &Path, command: CoreCommand) -> CliResult {
    let pid_file = root.join("runtime-data").join(PID_FILE_NAME);
    match command {
        CoreCommand::Start => start(root, &pid_file),
        CoreCommand::Stop => stop(&pid_file),
        CoreCommand::IsRunning => match running_pid(&pid_file) {
            Some(pid) => {
                println!("Pyra Core is running with PID {}", pid);
                Ok(())
            }
            None => Err(CliError::User("Pyra Core is not running".to_string())),
        },
    }
}

fn start(root: &Path, pid_file: &Path) -> CliResult {
    if let Some(pid) = running_pid(pid_file) {
        return Err(CliError::User(format!(
            "Pyra Core is already running with PID {}",
            pid
        )));
    }
    let executable = core_executable()?;
    let child = Command::new(&executable)
        .env("PYRA_ROOT", root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            CliError::Integration(format!("cannot start {}: {}", executable.display(), e))
        })?;
    println!("Started Pyra Core with PID {}", child.id());
    Ok(())
}

fn stop(pid_file: &Path) -> CliResult {
    let Some(pid) = running_pid(pid_file) else {
        return Err(CliError::User("Pyra Core is not running".to_string()));
    };
    if !process::kill_pid(pid) {
        return Err(CliError::Integration(format!(
            "cannot terminate process {}",
            pid
        )));
    }
    let _ = std::fs::remove_file(pid_file);
    println!("Terminated Pyra Core with PID {}", pid);
    Ok(())
}

/// The pid from the pid file, if that process is actually alive.
fn running_pid(pid_file: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    process::process_is_alive(pid).then_some(pid)
}

/// The supervisor binary is installed next to the CLI binary.
fn core_executable() -> Result<PathBuf, CliError> {
    let own = std::env::current_exe()
        .map_err(|e| CliError::Integration(format!("cannot locate own executable: {}", e)))?;
    let directory = own
        .parent()
        .ok_or_else(|| CliError::Integration("own executable has no directory".to_string()))?;
    let name = if cfg!(windows) { "pyra-core.exe" } else { "pyra-core" };
    let executable = directory.join(name);
    if !executable.exists() {
        return Err(CliError::User(format!(
            "supervisor binary not found at {}",
            executable.display()
        )));
    }
    Ok(executable)
}
