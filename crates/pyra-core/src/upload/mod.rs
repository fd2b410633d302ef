// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Daily-partitioned SFTP uploads with manifests and digest verification.

pub mod manifest;
pub mod sftp;
mod worker;

pub use manifest::UploadManifest;
pub use sftp::RemoteClient;
pub use worker::{RemoteTransport, TransferUnit, UploadWorker};
