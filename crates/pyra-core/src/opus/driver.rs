// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! OPUS process and macro control.
//!
//! The driver owns the OPUS process (start, stop, detect) and speaks the
//! command pipe for everything else: loading experiments, running and
//! killing macros, and figuring out which macro threads are alive.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::OpusConfig;
use crate::error::{PyraError, Result};
use crate::opus::ipc::{self, ChannelFactory, OpusChannel, TcpOpusChannel};
use crate::process;

/// Image names OPUS shows up under in the process table.
pub const OPUS_PROCESS_NAMES: [&str; 2] = ["opus.exe", "opuscore"];

/// Deadline for the process to appear after launch.
const START_TIMEOUT: Duration = Duration::from_secs(90);
const START_POLL: Duration = Duration::from_secs(8);

/// Deadline for a graceful `CLOSE_OPUS` before force-killing.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a killed macro to actually stop.
const MACRO_STOP_TIMEOUT: Duration = Duration::from_secs(90);

/// Gap between the two thread-id polls of `some_macro_is_running`.
const FIND_FUNCTION_POLL_GAP: Duration = Duration::from_secs(3);

/// Entry points of every long-running OPUS measurement function.
const MACRO_ENTRY_POINTS: [&str; 10] = [
    "MeasureReference",
    "MeasureSample",
    "MeasureRepeated",
    "MeasureRapidTRS",
    "MeasureStepScanTrans",
    "UserDialog",
    "Baseline",
    "PeakPick",
    "Timer",
    "SendCommand",
];

fn spectrometer_error(details: impl Into<String>) -> PyraError {
    PyraError::Spectrometer {
        details: details.into(),
    }
}

pub struct OpusDriver {
    channel: Option<Box<dyn OpusChannel>>,
    factory: ChannelFactory,
    /// Gap between thread-id polls; shortened in tests.
    poll_gap: Duration,
}

impl Default for OpusDriver {
    fn default() -> Self {
        Self::new(Box::new(TcpOpusChannel::open))
    }
}

impl OpusDriver {
    pub fn new(factory: ChannelFactory) -> Self {
        Self {
            channel: None,
            factory,
            poll_gap: FIND_FUNCTION_POLL_GAP,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_gap(factory: ChannelFactory, poll_gap: Duration) -> Self {
        Self {
            channel: None,
            factory,
            poll_gap,
        }
    }

    fn channel(&mut self) -> Result<&mut dyn OpusChannel> {
        if self.channel.is_none() {
            self.channel = Some(ipc::setup(&self.factory)?);
        }
        Ok(self.channel.as_mut().unwrap().as_mut())
    }

    fn drop_channel(&mut self) {
        self.channel = None;
    }

    /// Send a command over the pipe. A failed request tears the cached
    /// channel down so the next call reconnects; the old stream is dead
    /// when OPUS was killed and relaunched in between.
    fn request_ok(&mut self, command: &str) -> Result<Vec<String>> {
        let channel = self.channel()?;
        match ipc::request_ok(channel, command) {
            Ok(reply) => Ok(reply),
            Err(error) => {
                self.drop_channel();
                Err(error)
            }
        }
    }

    /// True when an OPUS process is in the OS process table.
    pub fn is_running(&self) -> bool {
        process::any_process_matches(&OPUS_PROCESS_NAMES)
    }

    /// Launch OPUS with direct login and wait for the process to appear.
    pub fn start(&mut self, config: &OpusConfig) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // any cached pipe belonged to the previous process
        self.drop_channel();
        info!(executable = %config.executable_path.display(), "Starting OPUS");
        let login = format!(
            "/DIRECTLOGINPASSWORD={}@{}",
            config.username, config.password
        );
        process::spawn_detached(
            &config.executable_path,
            &["/LANGUAGE=ENGLISH", login.as_str()],
            config.executable_path.parent(),
        )?;

        let deadline = Instant::now() + START_TIMEOUT;
        while Instant::now() < deadline {
            if self.is_running() {
                return Ok(());
            }
            thread::sleep(START_POLL);
        }
        Err(spectrometer_error("OPUS did not appear within 90 s"))
    }

    /// Graceful close through the pipe; force-kill on a dead pipe or
    /// timeout.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let graceful = self.try_graceful_close();
        if graceful.is_ok() {
            let deadline = Instant::now() + STOP_TIMEOUT;
            while Instant::now() < deadline {
                if !self.is_running() {
                    info!("OPUS closed gracefully");
                    return Ok(());
                }
                thread::sleep(Duration::from_secs(2));
            }
        }
        warn!("OPUS did not close gracefully, killing");
        self.drop_channel();
        process::kill_processes_by_name(&OPUS_PROCESS_NAMES);
        Ok(())
    }

    fn try_graceful_close(&mut self) -> Result<()> {
        self.request_ok("UnloadAll")?;
        // CLOSE_OPUS tears the pipe down with it; the reply may be cut off.
        if let Some(channel) = self.channel.as_mut() {
            let _ = channel.request("CLOSE_OPUS");
        }
        self.drop_channel();
        Ok(())
    }

    /// Macro `id` runs iff its numeric result status is 0.
    pub fn macro_is_running(&mut self, macro_id: i64) -> Result<bool> {
        let reply = self.request_ok(&format!("MACRO_RESULTS {}", macro_id))?;
        let status: i64 = reply
            .get(1)
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| spectrometer_error(format!("MACRO_RESULTS unparsable: {:?}", reply)))?;
        Ok(status == 0)
    }

    fn thread_ids(&mut self, function: &str) -> Result<Vec<i64>> {
        let reply = self.request_ok(&format!("FIND_FUNCTION {}", function))?;
        Ok(reply[1..]
            .iter()
            .filter_map(|line| line.trim().parse().ok())
            .filter(|id| *id != 0)
            .collect())
    }

    /// Whether any measurement macro is active, regardless of who started
    /// it. Thread ids are collected over two polls so a function that is
    /// momentarily between entry points is not missed.
    pub fn some_macro_is_running(&mut self) -> Result<bool> {
        let main_thread: i64 = self
            .request_ok("FIND_FUNCTION 0")?
            .get(1)
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| spectrometer_error("FIND_FUNCTION 0 gave no main thread id"))?;

        let mut macro_threads = std::collections::HashSet::new();
        for poll in 0..2 {
            if poll == 1 {
                thread::sleep(self.poll_gap);
            }
            for entry_point in MACRO_ENTRY_POINTS {
                for id in self.thread_ids(entry_point)? {
                    macro_threads.insert(id);
                }
            }
        }
        macro_threads.remove(&main_thread);
        debug!(threads = macro_threads.len(), "Macro thread scan");
        Ok(!macro_threads.is_empty())
    }

    /// Path of the experiment OPUS currently has loaded.
    pub fn get_loaded_experiment(&mut self) -> Result<PathBuf> {
        let directory = self.read_parameter("XPP")?;
        let filename = self.read_parameter("EXP")?;
        Ok(Path::new(&directory).join(filename))
    }

    fn read_parameter(&mut self, name: &str) -> Result<String> {
        let reply = self.request_ok(&format!("READ_PARAMETER {}", name))?;
        reply
            .get(1)
            .map(|line| line.trim().to_string())
            .ok_or_else(|| spectrometer_error(format!("READ_PARAMETER {} gave no value", name)))
    }

    pub fn load_experiment(&mut self, path: &Path) -> Result<()> {
        self.request_ok(&format!("LOAD_EXPERIMENT {}", path.display()))?;
        info!(experiment = %path.display(), "Experiment loaded");
        Ok(())
    }

    /// Start the macro and return its id.
    pub fn start_macro(&mut self, path: &Path) -> Result<i64> {
        let reply = self.request_ok(&format!("RUN_MACRO {}", path.display()))?;
        let macro_id = reply
            .get(1)
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| spectrometer_error(format!("RUN_MACRO gave no macro id: {:?}", reply)))?;
        info!(macro_path = %path.display(), macro_id, "Macro started");
        Ok(macro_id)
    }

    /// Kill the macro and wait until it reports stopped.
    pub fn stop_macro(&mut self, path: &Path, macro_id: i64) -> Result<()> {
        self.stop_macro_with(path, macro_id, MACRO_STOP_TIMEOUT, Duration::from_secs(2))
    }

    pub fn stop_macro_with(
        &mut self,
        path: &Path,
        macro_id: i64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.request_ok(&format!("KILL_MACRO {}", path.display()))?;
        let deadline = Instant::now() + timeout;
        loop {
            if !self.macro_is_running(macro_id)? {
                info!(macro_id, "Macro stopped");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(spectrometer_error(format!(
                    "macro {} still running after kill",
                    macro_id
                )));
            }
            thread::sleep(poll_interval);
        }
    }

    /// Reachability check of the instrument itself.
    pub fn ping_em27(&self, config: &OpusConfig) -> bool {
        let status = std::process::Command::new("ping")
            .args(["-c", "1", "-W", "2", config.em27_ip.as_str()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        matches!(status, Ok(status) if status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opus::ipc::tests::ScriptedChannel;
    use std::sync::{Arc, Mutex};

    fn driver_with_script(replies: Vec<Vec<&str>>) -> (OpusDriver, Arc<Mutex<Vec<String>>>) {
        let mut all = vec![vec!["OK", "hello"]]; // handshake
        all.extend(replies);
        let channel = ScriptedChannel::new(all);
        let requests = channel.requests.clone();
        let cell = Arc::new(Mutex::new(Some(channel)));
        let factory: ChannelFactory = Box::new(move || {
            cell.lock()
                .unwrap()
                .take()
                .map(|c| Box::new(c) as Box<dyn OpusChannel>)
                .ok_or(PyraError::Spectrometer {
                    details: "factory exhausted".to_string(),
                })
        });
        (
            OpusDriver::with_poll_gap(factory, Duration::from_millis(1)),
            requests,
        )
    }

    #[test]
    fn test_failed_request_reopens_channel() {
        // The first conversation dies after one reply, as it would when
        // OPUS is killed externally; a later relaunch must get a fresh
        // channel instead of the cached dead one.
        let channels = Arc::new(Mutex::new(std::collections::VecDeque::from([
            ScriptedChannel::new(vec![vec!["OK", "hello"], vec!["OK", "0"]]),
            ScriptedChannel::new(vec![vec!["OK", "hello"], vec!["OK", "2"]]),
        ])));
        let factory_calls = Arc::new(Mutex::new(0usize));
        let channels_clone = channels.clone();
        let calls_clone = factory_calls.clone();
        let factory: ChannelFactory = Box::new(move || {
            *calls_clone.lock().unwrap() += 1;
            channels_clone
                .lock()
                .unwrap()
                .pop_front()
                .map(|c| Box::new(c) as Box<dyn OpusChannel>)
                .ok_or(PyraError::Spectrometer {
                    details: "factory exhausted".to_string(),
                })
        });
        let mut driver = OpusDriver::with_poll_gap(factory, Duration::from_millis(1));

        assert!(driver.macro_is_running(9).unwrap());
        // the first channel's script is used up; this request fails and
        // must tear the cached channel down
        assert!(driver.macro_is_running(9).is_err());
        // next call reconnects and succeeds over the second channel
        assert!(!driver.macro_is_running(9).unwrap());
        assert_eq!(*factory_calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_macro_is_running_status_zero() {
        let (mut driver, _) = driver_with_script(vec![vec!["OK", "0"], vec!["OK", "1"]]);
        assert!(driver.macro_is_running(101).unwrap());
        assert!(!driver.macro_is_running(101).unwrap());
    }

    #[test]
    fn test_some_macro_is_running_ignores_main_thread() {
        // main thread 7; both polls report only thread 7 under Timer
        let mut replies = vec![vec!["OK", "7"]];
        for _ in 0..2 {
            for _ in MACRO_ENTRY_POINTS {
                replies.push(vec!["OK", "7"]);
            }
        }
        let (mut driver, _) = driver_with_script(replies);
        assert!(!driver.some_macro_is_running().unwrap());
    }

    #[test]
    fn test_some_macro_is_running_detects_foreign_thread() {
        let mut replies = vec![vec!["OK", "7"]];
        for poll in 0..2 {
            for (index, _) in MACRO_ENTRY_POINTS.iter().enumerate() {
                // MeasureSample reports a second thread on the second poll
                if poll == 1 && index == 1 {
                    replies.push(vec!["OK", "7", "12"]);
                } else {
                    replies.push(vec!["OK"]);
                }
            }
        }
        let (mut driver, _) = driver_with_script(replies);
        assert!(driver.some_macro_is_running().unwrap());
    }

    #[test]
    fn test_get_loaded_experiment_joins_path() {
        let (mut driver, requests) = driver_with_script(vec![
            vec!["OK", "C:/experiments"],
            vec!["OK", "comb.xpm"],
        ]);
        let path = driver.get_loaded_experiment().unwrap();
        assert_eq!(path, Path::new("C:/experiments").join("comb.xpm"));
        let requests = requests.lock().unwrap();
        assert!(requests.iter().any(|r| r == "READ_PARAMETER XPP"));
        assert!(requests.iter().any(|r| r == "READ_PARAMETER EXP"));
    }

    #[test]
    fn test_start_macro_returns_id() {
        let (mut driver, _) = driver_with_script(vec![vec!["OK", "4242"]]);
        let id = driver.start_macro(Path::new("m.mtx")).unwrap();
        assert_eq!(id, 4242);
    }

    #[test]
    fn test_stop_macro_polls_until_stopped() {
        let (mut driver, requests) = driver_with_script(vec![
            vec!["OK"],      // KILL_MACRO
            vec!["OK", "0"], // still running
            vec!["OK", "2"], // stopped
        ]);
        driver
            .stop_macro_with(
                Path::new("m.mtx"),
                9,
                Duration::from_secs(1),
                Duration::from_millis(1),
            )
            .unwrap();
        assert_eq!(requests.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_stop_macro_timeout() {
        let (mut driver, _) = driver_with_script(vec![
            vec!["OK"],
            vec!["OK", "0"],
            vec!["OK", "0"],
            vec!["OK", "0"],
        ]);
        let error = driver
            .stop_macro_with(
                Path::new("m.mtx"),
                9,
                Duration::from_millis(5),
                Duration::from_millis(3),
            )
            .unwrap_err();
        assert_eq!(error.subject(), "spectrometer-error");
    }
}
