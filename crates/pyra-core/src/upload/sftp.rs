// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! SFTP transport for the uploader.
//!
//! Uses native ssh2. One session per uploader iteration; the 5 s connect
//! deadline is the fail-fast contract of the worker.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::Session;
use tracing::debug;

use crate::config::UploadConfig;
use crate::error::{PyraError, Result};

/// Connect deadline for the TCP leg of the session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SSH_PORT: u16 = 22;

fn upload_error(details: impl Into<String>) -> PyraError {
    PyraError::Upload {
        details: details.into(),
    }
}

pub struct RemoteClient {
    // session must outlive sftp; keep both
    _session: Session,
    sftp: ssh2::Sftp,
}

impl RemoteClient {
    /// Open an authenticated SFTP session.
    pub fn connect(config: &UploadConfig) -> Result<Self> {
        let address = format!("{}:{}", config.host, SSH_PORT)
            .to_socket_addrs()
            .map_err(|e| upload_error(format!("cannot resolve '{}': {}", config.host, e)))?
            .next()
            .ok_or_else(|| upload_error(format!("'{}' resolves to nothing", config.host)))?;
        let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
            .map_err(|e| upload_error(format!("cannot reach {}: {}", address, e)))?;

        let mut session =
            Session::new().map_err(|e| upload_error(format!("session setup failed: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| upload_error(format!("SSH handshake failed: {}", e)))?;
        session
            .userauth_password(&config.user, &config.password)
            .map_err(|e| upload_error(format!("authentication failed: {}", e)))?;
        let sftp = session
            .sftp()
            .map_err(|e| upload_error(format!("SFTP subsystem failed: {}", e)))?;
        debug!(host = %config.host, user = %config.user, "SFTP session established");
        Ok(Self {
            _session: session,
            sftp,
        })
    }

    pub fn exists(&self, remote_path: &Path) -> bool {
        self.sftp.stat(remote_path).is_ok()
    }

    /// Create `remote_dir` and all missing parents.
    pub fn mkdir_p(&self, remote_dir: &Path) -> Result<()> {
        let mut current = std::path::PathBuf::new();
        for component in remote_dir.components() {
            current.push(component);
            if current.parent().is_none() {
                continue; // root
            }
            if self.sftp.stat(&current).is_err() {
                self.sftp.mkdir(&current, 0o755).map_err(|e| {
                    upload_error(format!("mkdir '{}' failed: {}", current.display(), e))
                })?;
            }
        }
        Ok(())
    }

    pub fn read_file(&self, remote_path: &Path) -> Result<Vec<u8>> {
        let mut file = self
            .sftp
            .open(remote_path)
            .map_err(|e| upload_error(format!("open '{}' failed: {}", remote_path.display(), e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| upload_error(format!("read '{}' failed: {}", remote_path.display(), e)))?;
        Ok(bytes)
    }

    pub fn write_file(&self, remote_path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = self.sftp.create(remote_path).map_err(|e| {
            upload_error(format!("create '{}' failed: {}", remote_path.display(), e))
        })?;
        file.write_all(bytes).map_err(|e| {
            upload_error(format!("write '{}' failed: {}", remote_path.display(), e))
        })?;
        Ok(())
    }

    /// Upload a local file in full.
    pub fn upload_file(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let bytes = std::fs::read(local_path).map_err(|e| {
            upload_error(format!("cannot read '{}': {}", local_path.display(), e))
        })?;
        self.write_file(remote_path, &bytes)
    }
}
