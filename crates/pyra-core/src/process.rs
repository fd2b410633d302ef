// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! OS process table helpers.
//!
//! The OPUS and CamTracker drivers own their external programs through
//! these functions: spawn detached, scan the process table by image name,
//! kill leftovers. Matching is case-insensitive on the image name so that
//! `camtracker.exe`, `CamTracker.exe` and a bare `camtracker` all count.

use std::path::Path;
use std::process::{Command, Stdio};

use sysinfo::{ProcessesToUpdate, System};

use crate::error::{PyraError, Result};

/// Pids of all processes whose image name contains `pattern`
/// (case-insensitive).
pub fn find_pids_by_name(pattern: &str) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let needle = pattern.to_lowercase();
    system
        .processes()
        .iter()
        .filter(|(_, process)| {
            process
                .name()
                .to_string_lossy()
                .to_lowercase()
                .contains(&needle)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// True when a process with this pid exists.
pub fn process_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Signal the process with this pid to terminate. Returns false when no
/// such process exists or the signal could not be delivered.
pub fn kill_pid(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(sysinfo::Pid::from_u32(pid))
        .map(|process| process.kill())
        .unwrap_or(false)
}

/// True when at least one process matches any of the given patterns.
pub fn any_process_matches(patterns: &[&str]) -> bool {
    patterns
        .iter()
        .any(|pattern| !find_pids_by_name(pattern).is_empty())
}

/// Kill every process whose image name matches any pattern. Returns the
/// number of processes signalled.
pub fn kill_processes_by_name(patterns: &[&str]) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let needles: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
    let mut killed = 0;
    for process in system.processes().values() {
        let name = process.name().to_string_lossy().to_lowercase();
        if needles.iter().any(|needle| name.contains(needle.as_str())) && process.kill() {
            killed += 1;
        }
    }
    killed
}

/// Spawn a detached child with null stdio, optionally from `working_dir`.
pub fn spawn_detached(
    executable: &Path,
    args: &[&str],
    working_dir: Option<&Path>,
) -> Result<u32> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    let child = command.spawn().map_err(|e| PyraError::Runtime {
        details: format!("cannot spawn '{}': {}", executable.display(), e),
    })?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_pids_matches_own_process() {
        // The test binary's own image name must be findable; take the first
        // token of the current exe name.
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_stem().unwrap().to_string_lossy().to_string();
        // Cargo test binaries carry a hash suffix like `pyra_core-1a2b`;
        // match on the crate part only.
        let prefix: String = name.chars().take(6).collect();
        assert!(!find_pids_by_name(&prefix).is_empty());
    }

    #[test]
    fn test_find_pids_no_match() {
        assert!(find_pids_by_name("definitely-not-a-process-name-xyz").is_empty());
        assert!(!any_process_matches(&["definitely-not-a-process-name-xyz"]));
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let result = spawn_detached(Path::new("/nonexistent/binary"), &[], None);
        assert!(result.is_err());
    }
}
