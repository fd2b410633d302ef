// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! AEMET enclosure: HTTP datalogger client, EM27 power plug, worker.

pub mod client;
mod worker;

pub use client::{AemetDatalogger, Em27PowerPlug};
pub use worker::AemetEnclosureWorker;
