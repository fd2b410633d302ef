// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! OPUS spectrometer program: command pipe, driver, worker.

pub mod driver;
pub mod ipc;
mod worker;

pub use driver::OpusDriver;
pub use ipc::{OpusChannel, TcpOpusChannel};
pub use worker::OpusWorker;
