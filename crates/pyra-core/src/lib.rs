// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Pyra Core - EM27 Field Station Supervisor
//!
//! This crate runs an EM27/SUN solar spectrometer station unattended. A
//! supervisor spawns one worker per activity; workers communicate only
//! through the persisted config and state documents.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Supervisor                          │
//! │      (worker lifecycle, restarts, error emails)          │
//! └──────────────────────────────────────────────────────────┘
//!     │           │          │          │          │
//!     ▼           ▼          ▼          ▼          ▼
//!  decision    enclosure    opus    camtracker   helios
//!  monitor     (tum/aemet)                       upload
//!     │           │          │          │          │
//!     └───────────┴────┬─────┴──────────┴──────────┘
//!                      ▼
//!        config.json + state.json  (file-locked stores)
//! ```
//!
//! The operator CLI (`pyra-cli`) talks to the same stores, so every
//! mutation goes through the cross-process locks in [`locks`].

pub mod aemet;
pub mod astronomy;
pub mod camtracker;
pub mod config;
pub mod context;
pub mod decision;
pub mod email;
pub mod error;
pub mod helios;
pub mod locks;
pub mod monitor;
pub mod opus;
pub mod plc;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod upload;
pub mod util;

/// The running software version; config documents must carry the same
/// value.
pub const VERSION: &str = "4.2.1";
