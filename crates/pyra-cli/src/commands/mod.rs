// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod core;
pub mod plc;
pub mod probes;
pub mod state;
