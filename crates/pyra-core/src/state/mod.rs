// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Shared runtime state: the persisted document, the exception ledger and
//! the per-day activity history.
//!
//! All mutation goes through [`StateStore::update_state`], a scoped
//! transaction under the cross-process state lock. Readers may load without
//! the write lock and observe either the pre- or post-image of any
//! transaction, never a torn document.

mod activity;
mod exceptions;
mod models;
mod store;

pub use activity::{ActivityHistory, MINUTES_PER_DAY};
pub use exceptions::{ExceptionStateItem, ExceptionsState};
pub use models::{
    ActivityCounters, AemetEnclosureState, OperatingSystemState, OpusState, Position,
    StateDocument, TriState, TumActors, TumConnections, TumControl, TumEnclosureState, TumPower,
    TumSensors, TumStateFlags,
};
pub use store::StateStore;
