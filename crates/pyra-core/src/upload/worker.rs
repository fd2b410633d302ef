// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Uploader worker.
//!
//! Walks every active stream for day-partitioned units strictly older than
//! today, mirrors them to the remote with digest verification and a
//! sidecar manifest, and optionally removes verified sources. The whole
//! pass is preemptible: a config change, test mode, or resumed
//! measurements abort between units and between files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};

use crate::config::{UploadConfig, UploadStreamConfig, UploadVariant};
use crate::context::CoreContext;
use crate::error::{PyraError, Result};
use crate::upload::manifest::{
    MANIFEST_NAME, UploadManifest, digest_bytes, digest_file, digest_file_set,
};
use crate::upload::sftp::RemoteClient;

const ORIGIN: &str = "upload";

/// Pause between successful passes.
const PASS_INTERVAL: Duration = Duration::from_secs(3600);

/// Back-off after a transport failure.
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

fn upload_error(details: impl Into<String>) -> PyraError {
    PyraError::Upload {
        details: details.into(),
    }
}

/// What the unit processor needs from the remote side. [`RemoteClient`]
/// is the SFTP implementation; tests use an in-memory remote.
pub trait RemoteTransport {
    fn exists(&self, remote_path: &Path) -> bool;
    fn mkdir_p(&self, remote_dir: &Path) -> Result<()>;
    fn read_file(&self, remote_path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, remote_path: &Path, bytes: &[u8]) -> Result<()>;
    fn upload_file(&self, local_path: &Path, remote_path: &Path) -> Result<()>;
}

impl RemoteTransport for RemoteClient {
    fn exists(&self, remote_path: &Path) -> bool {
        RemoteClient::exists(self, remote_path)
    }

    fn mkdir_p(&self, remote_dir: &Path) -> Result<()> {
        RemoteClient::mkdir_p(self, remote_dir)
    }

    fn read_file(&self, remote_path: &Path) -> Result<Vec<u8>> {
        RemoteClient::read_file(self, remote_path)
    }

    fn write_file(&self, remote_path: &Path, bytes: &[u8]) -> Result<()> {
        RemoteClient::write_file(self, remote_path, bytes)
    }

    fn upload_file(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        RemoteClient::upload_file(self, local_path, remote_path)
    }
}

/// One day-partitioned thing to mirror: a single file or a day folder.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUnit {
    pub name: String,
    pub local_path: PathBuf,
    pub variant: UploadVariant,
}

/// Extract the calendar date encoded in a unit name.
pub(crate) fn parse_unit_date(name: &str) -> Option<NaiveDate> {
    let digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 8 {
        if let Ok(date) = NaiveDate::parse_from_str(&digits[..8], "%Y%m%d") {
            return Some(date);
        }
    }
    None
}

/// Source children that match the stream's date regex and are strictly
/// before `today`.
pub(crate) fn dated_units(
    stream: &UploadStreamConfig,
    today: NaiveDate,
) -> Result<Vec<TransferUnit>> {
    let pattern = Regex::new(&stream.dated_regex)
        .map_err(|e| upload_error(format!("invalid dated_regex: {}", e)))?;
    let mut units = Vec::new();
    let entries = fs::read_dir(&stream.src_directory).map_err(|e| {
        upload_error(format!(
            "cannot list '{}': {}",
            stream.src_directory.display(),
            e
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| upload_error(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !pattern.is_match(&name) {
            continue;
        }
        let Some(date) = parse_unit_date(&name) else {
            continue;
        };
        if date >= today {
            continue; // today's data is still being written
        }
        let is_dir = entry.path().is_dir();
        let matches_variant = match stream.variant {
            UploadVariant::PerFile => !is_dir,
            UploadVariant::PerDayFolder => is_dir,
        };
        if matches_variant {
            units.push(TransferUnit {
                name,
                local_path: entry.path(),
                variant: stream.variant,
            });
        }
    }
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

/// Files of a unit as `(file name, local path)`, sorted by name.
fn unit_files(unit: &TransferUnit) -> Result<Vec<(String, PathBuf)>> {
    match unit.variant {
        UploadVariant::PerFile => Ok(vec![(unit.name.clone(), unit.local_path.clone())]),
        UploadVariant::PerDayFolder => {
            let mut files = Vec::new();
            for entry in fs::read_dir(&unit.local_path)
                .map_err(|e| upload_error(format!("cannot list unit: {}", e)))?
            {
                let entry = entry.map_err(|e| upload_error(e.to_string()))?;
                if entry.path().is_file() {
                    files.push((
                        entry.file_name().to_string_lossy().to_string(),
                        entry.path(),
                    ));
                }
            }
            files.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(files)
        }
    }
}

fn remote_paths(unit: &TransferUnit, dst_directory: &Path) -> (PathBuf, PathBuf) {
    match unit.variant {
        UploadVariant::PerFile => (
            dst_directory.to_path_buf(),
            dst_directory.join(format!(".{}{}", unit.name, MANIFEST_NAME)),
        ),
        UploadVariant::PerDayFolder => {
            let unit_dir = dst_directory.join(&unit.name);
            let manifest = unit_dir.join(MANIFEST_NAME);
            (unit_dir, manifest)
        }
    }
}

/// Digest of the unit's local content (bytes for a single file, stable
/// file-set digest for a folder).
fn local_digest(unit: &TransferUnit, files: &[(String, PathBuf)]) -> Result<String> {
    match unit.variant {
        UploadVariant::PerFile => digest_file(&files[0].1),
        UploadVariant::PerDayFolder => {
            let mut entries = Vec::with_capacity(files.len());
            for (name, path) in files {
                entries.push((name.clone(), digest_file(path)?));
            }
            Ok(digest_file_set(&entries))
        }
    }
}

/// Same digest, computed from the remote's current content. `None` when
/// any file is missing.
fn remote_digest(
    transport: &dyn RemoteTransport,
    unit: &TransferUnit,
    remote_dir: &Path,
    files: &[(String, PathBuf)],
) -> Option<String> {
    match unit.variant {
        UploadVariant::PerFile => {
            let remote_path = remote_dir.join(&files[0].0);
            transport.read_file(&remote_path).ok().map(|b| digest_bytes(&b))
        }
        UploadVariant::PerDayFolder => {
            let mut entries = Vec::with_capacity(files.len());
            for (name, _) in files {
                let bytes = transport.read_file(&remote_dir.join(name)).ok()?;
                entries.push((name.clone(), digest_bytes(&bytes)));
            }
            Some(digest_file_set(&entries))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    Verified,
    Preempted,
}

/// Mirror one unit. The manifest is `complete=false` for the entire
/// transfer and flips only after the digests match.
pub fn process_unit(
    transport: &dyn RemoteTransport,
    unit: &TransferUnit,
    stream: &UploadStreamConfig,
    preempt: &dyn Fn() -> bool,
) -> Result<UnitOutcome> {
    let files = unit_files(unit)?;
    if files.is_empty() {
        return Ok(UnitOutcome::Verified);
    }
    let (remote_dir, manifest_path) = remote_paths(unit, Path::new(&stream.dst_directory));
    transport.mkdir_p(&remote_dir)?;

    let wanted_digest = local_digest(unit, &files)?;
    let current_digest = remote_digest(transport, unit, &remote_dir, &files);

    if current_digest.as_deref() != Some(wanted_digest.as_str()) {
        let mut manifest =
            UploadManifest::new(files.iter().map(|(name, _)| name.clone()).collect());
        transport.write_file(&manifest_path, &manifest.to_bytes()?)?;

        for (name, local_path) in &files {
            if preempt() {
                info!(unit = %unit.name, "Upload preempted mid-unit");
                return Ok(UnitOutcome::Preempted);
            }
            let remote_path = remote_dir.join(name);
            let local_file_digest = digest_file(local_path)?;
            let remote_matches = transport
                .read_file(&remote_path)
                .map(|bytes| digest_bytes(&bytes) == local_file_digest)
                .unwrap_or(false);
            if !remote_matches {
                transport.upload_file(local_path, &remote_path)?;
            }
        }

        let verified = remote_digest(transport, unit, &remote_dir, &files);
        if verified.as_deref() != Some(wanted_digest.as_str()) {
            return Err(upload_error(format!(
                "unit '{}' does not verify after transfer",
                unit.name
            )));
        }
        manifest.mark_complete();
        transport.write_file(&manifest_path, &manifest.to_bytes()?)?;
        info!(unit = %unit.name, files = files.len(), "Unit uploaded and verified");
    } else if !manifest_is_complete(transport, &manifest_path) {
        // content already matched but an earlier pass was interrupted
        let mut manifest =
            UploadManifest::new(files.iter().map(|(name, _)| name.clone()).collect());
        manifest.mark_complete();
        transport.write_file(&manifest_path, &manifest.to_bytes()?)?;
    }

    if stream.remove_src_after_upload {
        match unit.variant {
            UploadVariant::PerFile => fs::remove_file(&unit.local_path),
            UploadVariant::PerDayFolder => fs::remove_dir_all(&unit.local_path),
        }
        .map_err(|e| upload_error(format!("cannot remove source unit: {}", e)))?;
        info!(unit = %unit.name, "Source unit removed after verified upload");
    }
    Ok(UnitOutcome::Verified)
}

fn manifest_is_complete(transport: &dyn RemoteTransport, manifest_path: &Path) -> bool {
    transport
        .read_file(manifest_path)
        .ok()
        .and_then(|bytes| UploadManifest::from_bytes(&bytes).ok())
        .map(|manifest| manifest.complete)
        .unwrap_or(false)
}

pub struct UploadWorker {
    context: CoreContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl UploadWorker {
    pub fn new(context: CoreContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Starting upload worker");
        loop {
            let context = self.context.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let outcome = task::spawn_blocking(move || run_pass(&context, &shutdown_rx)).await;

            let sleep_interval = match outcome {
                Ok(Ok(())) => {
                    let _ = self.context.clear_exceptions(ORIGIN);
                    PASS_INTERVAL
                }
                Ok(Err(error)) => {
                    warn!(error = %error, "Upload pass failed");
                    let _ = self.context.record_exception(ORIGIN, &error);
                    FAILURE_BACKOFF
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Upload pass panicked");
                    let error = PyraError::Runtime {
                        details: join_error.to_string(),
                    };
                    let _ = self.context.record_exception(ORIGIN, &error);
                    FAILURE_BACKOFF
                }
            };

            let _ = self.context.state_store.update_state(|state| {
                state.activity.upload_is_running = false;
                Ok(())
            });

            // the hour-long pause stays responsive through the select
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
        info!("Upload worker stopped");
    }
}

/// One blocking pass over all active streams.
fn run_pass(context: &CoreContext, shutdown_rx: &watch::Receiver<bool>) -> Result<()> {
    let config = context.load_config()?;
    let Some(upload_config) = config.upload.clone() else {
        return Ok(());
    };
    if config.general.test_mode {
        return Ok(());
    }
    if !upload_config.streams.iter().any(|stream| stream.is_active) {
        return Ok(());
    }

    let preempt = make_preempt_check(context, &upload_config, shutdown_rx);
    if preempt() {
        return Ok(());
    }

    context.state_store.update_state(|state| {
        state.activity.upload_is_running = true;
        Ok(())
    })?;

    let transport = RemoteClient::connect(&upload_config)?;
    let today = Utc::now().date_naive();

    for stream in upload_config.streams.iter().filter(|s| s.is_active) {
        for unit in dated_units(stream, today)? {
            if preempt() {
                info!("Upload pass preempted");
                return Ok(());
            }
            match process_unit(&transport, &unit, stream, &preempt)? {
                UnitOutcome::Verified => {}
                UnitOutcome::Preempted => return Ok(()),
            }
        }
    }
    Ok(())
}

/// Preemption predicate: shutdown, test mode, resumed measurements, or a
/// changed upload config abort the pass.
fn make_preempt_check<'a>(
    context: &'a CoreContext,
    original: &'a UploadConfig,
    shutdown_rx: &'a watch::Receiver<bool>,
) -> impl Fn() -> bool + 'a {
    move || {
        if *shutdown_rx.borrow() {
            return true;
        }
        let Ok(config) = context.load_config() else {
            return true;
        };
        if config.general.test_mode {
            return true;
        }
        if config.upload.as_ref() != Some(original) {
            return true;
        }
        match context.state_store.load() {
            Ok(state) => state.measurements_should_be_running == Some(true),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory remote.
    #[derive(Default)]
    struct MemoryRemote {
        files: RefCell<HashMap<PathBuf, Vec<u8>>>,
        dirs: RefCell<Vec<PathBuf>>,
    }

    impl RemoteTransport for MemoryRemote {
        fn exists(&self, remote_path: &Path) -> bool {
            self.files.borrow().contains_key(remote_path)
                || self.dirs.borrow().iter().any(|d| d == remote_path)
        }

        fn mkdir_p(&self, remote_dir: &Path) -> Result<()> {
            self.dirs.borrow_mut().push(remote_dir.to_path_buf());
            Ok(())
        }

        fn read_file(&self, remote_path: &Path) -> Result<Vec<u8>> {
            self.files
                .borrow()
                .get(remote_path)
                .cloned()
                .ok_or_else(|| PyraError::Upload {
                    details: "no such remote file".to_string(),
                })
        }

        fn write_file(&self, remote_path: &Path, bytes: &[u8]) -> Result<()> {
            self.files
                .borrow_mut()
                .insert(remote_path.to_path_buf(), bytes.to_vec());
            Ok(())
        }

        fn upload_file(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
            let bytes = fs::read(local_path).unwrap();
            self.write_file(remote_path, &bytes)
        }
    }

    fn stream_config(src: &Path, variant: UploadVariant, remove: bool) -> UploadStreamConfig {
        UploadStreamConfig {
            is_active: true,
            src_directory: src.to_path_buf(),
            dst_directory: "/remote/ifgs".to_string(),
            dated_regex: r"^\d{8}".to_string(),
            variant,
            remove_src_after_upload: remove,
        }
    }

    fn never() -> bool {
        false
    }

    #[test]
    fn test_parse_unit_date() {
        assert_eq!(
            parse_unit_date("20240115"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(
            parse_unit_date("ma20240115.ifg"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(parse_unit_date("no-date-here"), None);
    }

    #[test]
    fn test_dated_units_skips_today_and_future() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("20240114")).unwrap();
        fs::create_dir(dir.path().join("20240115")).unwrap();
        fs::create_dir(dir.path().join("20240116")).unwrap();
        fs::create_dir(dir.path().join("not-a-date")).unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerDayFolder, false);
        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let units = dated_units(&stream, today).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "20240114");
    }

    #[test]
    fn test_process_unit_per_day_folder_verified() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("20240114");
        fs::create_dir(&unit_dir).unwrap();
        fs::write(unit_dir.join("a.ifg"), b"spectrum a").unwrap();
        fs::write(unit_dir.join("b.ifg"), b"spectrum b").unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerDayFolder, false);
        let unit = TransferUnit {
            name: "20240114".to_string(),
            local_path: unit_dir,
            variant: UploadVariant::PerDayFolder,
        };
        let remote = MemoryRemote::default();
        let outcome = process_unit(&remote, &unit, &stream, &never).unwrap();
        assert_eq!(outcome, UnitOutcome::Verified);

        let manifest_bytes = remote
            .read_file(&PathBuf::from("/remote/ifgs/20240114").join(MANIFEST_NAME))
            .unwrap();
        let manifest = UploadManifest::from_bytes(&manifest_bytes).unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.file_list, vec!["a.ifg", "b.ifg"]);
        assert_eq!(
            remote
                .read_file(Path::new("/remote/ifgs/20240114/a.ifg"))
                .unwrap(),
            b"spectrum a"
        );
    }

    #[test]
    fn test_process_unit_repairs_mismatched_remote() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20240114.dat"), b"fresh content").unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerFile, false);
        let unit = TransferUnit {
            name: "20240114.dat".to_string(),
            local_path: dir.path().join("20240114.dat"),
            variant: UploadVariant::PerFile,
        };
        let remote = MemoryRemote::default();
        remote
            .write_file(Path::new("/remote/ifgs/20240114.dat"), b"stale content")
            .unwrap();

        process_unit(&remote, &unit, &stream, &never).unwrap();
        assert_eq!(
            remote
                .read_file(Path::new("/remote/ifgs/20240114.dat"))
                .unwrap(),
            b"fresh content"
        );
    }

    #[test]
    fn test_process_unit_removes_source_after_verification() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20240114.dat");
        fs::write(&file, b"content").unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerFile, true);
        let unit = TransferUnit {
            name: "20240114.dat".to_string(),
            local_path: file.clone(),
            variant: UploadVariant::PerFile,
        };
        let remote = MemoryRemote::default();
        process_unit(&remote, &unit, &stream, &never).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_process_unit_preempted_keeps_manifest_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("20240114");
        fs::create_dir(&unit_dir).unwrap();
        fs::write(unit_dir.join("a.ifg"), b"spectrum a").unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerDayFolder, true);
        let unit = TransferUnit {
            name: "20240114".to_string(),
            local_path: unit_dir.clone(),
            variant: UploadVariant::PerDayFolder,
        };
        let remote = MemoryRemote::default();
        let outcome = process_unit(&remote, &unit, &stream, &|| true).unwrap();
        assert_eq!(outcome, UnitOutcome::Preempted);

        let manifest_bytes = remote
            .read_file(&PathBuf::from("/remote/ifgs/20240114").join(MANIFEST_NAME))
            .unwrap();
        let manifest = UploadManifest::from_bytes(&manifest_bytes).unwrap();
        assert!(!manifest.complete, "preempted unit must not verify");
        assert!(unit_dir.exists(), "source must survive a preempted pass");
    }

    #[test]
    fn test_process_unit_skips_upload_when_remote_matches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20240114.dat"), b"content").unwrap();

        let stream = stream_config(dir.path(), UploadVariant::PerFile, false);
        let unit = TransferUnit {
            name: "20240114.dat".to_string(),
            local_path: dir.path().join("20240114.dat"),
            variant: UploadVariant::PerFile,
        };
        let remote = MemoryRemote::default();
        remote
            .write_file(Path::new("/remote/ifgs/20240114.dat"), b"content")
            .unwrap();

        // preempt immediately: if the processor tried to transfer, it
        // would return Preempted instead of Verified
        let outcome = process_unit(&remote, &unit, &stream, &|| true).unwrap();
        assert_eq!(outcome, UnitOutcome::Verified);
    }
}
