// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! The exception ledger.
//!
//! Workers record failures here with their own name as origin. The
//! supervisor diffs `current` against `notified` to decide which emails to
//! send; items with `send_emails = false` stay in the ledger but never make
//! it into a mail.

use serde::{Deserialize, Serialize};

use crate::error::PyraError;

/// One active error item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionStateItem {
    /// Name of the worker that recorded the item.
    pub origin: String,
    /// Stable subject code, see [`PyraError::subject`].
    pub subject: String,
    /// Human-readable details.
    pub details: String,
    /// Whether this item participates in email notifications.
    pub send_emails: bool,
}

/// Active and already-notified exception items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionsState {
    /// Currently active items.
    pub current: Vec<ExceptionStateItem>,
    /// Items an email has already been sent for.
    pub notified: Vec<ExceptionStateItem>,
}

impl ExceptionsState {
    /// Record an error under `origin`, deduplicating identical items.
    pub fn add_exception(&mut self, origin: &str, error: &PyraError, send_emails: bool) {
        let item = ExceptionStateItem {
            origin: origin.to_string(),
            subject: error.subject().to_string(),
            details: error.to_string(),
            send_emails,
        };
        self.add_exception_state_item(item);
    }

    /// Insert a pre-formed item, deduplicating identical items.
    pub fn add_exception_state_item(&mut self, item: ExceptionStateItem) {
        if !self.current.contains(&item) {
            self.current.push(item);
        }
    }

    /// Remove all active items recorded by `origin`.
    pub fn clear_exception_origin(&mut self, origin: &str) {
        self.current.retain(|item| item.origin != origin);
    }

    /// Active items that have not been notified about yet, excluding items
    /// with `send_emails = false`.
    pub fn pending_notifications(&self) -> Vec<ExceptionStateItem> {
        self.current
            .iter()
            .filter(|item| item.send_emails && !self.notified.contains(item))
            .cloned()
            .collect()
    }

    /// True when previously notified items exist but the ledger has drained.
    pub fn is_resolved(&self) -> bool {
        !self.notified.is_empty() && self.current.iter().all(|item| !item.send_emails)
    }

    /// Align the notified set with the active set. Called after the
    /// supervisor dispatched the pending emails.
    pub fn mark_notified(&mut self) {
        self.notified = self
            .current
            .iter()
            .filter(|item| item.send_emails)
            .cloned()
            .collect();
    }
}
