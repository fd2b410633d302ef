// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! TUM enclosure: S7 fieldbus client, address tables, driver, worker.

pub mod addresses;
pub mod s7;
pub mod tum;
mod worker;

pub use tum::{PlcInterface, TumEnclosureDriver};
pub use worker::TumEnclosureWorker;
