// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Helios cloud-cover classifier: camera, frame analysis, hysteresis,
//! worker.

pub mod camera;
pub mod evaluation;
pub mod vision;
mod worker;

pub use camera::{Camera, CameraFactory};
pub use evaluation::HeliosEvaluator;
pub use worker::HeliosWorker;
