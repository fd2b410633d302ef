// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Per-day activity history.
//!
//! One JSON file per calendar day at `logs/activity/activity-YYYY-MM-DD.json`,
//! holding a fixed 1440-bucket vector per metric. The system monitor is the
//! single writer.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::util::atomic_write_json;

/// Buckets per day, one per minute.
pub const MINUTES_PER_DAY: usize = 1440;

fn zeroes() -> Vec<u32> {
    vec![0; MINUTES_PER_DAY]
}

/// Activity document for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityHistory {
    /// The day this document covers.
    pub date: NaiveDate,
    /// Supervisor was alive during the minute.
    pub is_running: Vec<u32>,
    /// Measurements were running during the minute.
    pub is_measuring: Vec<u32>,
    /// Active exceptions existed during the minute.
    pub has_errors: Vec<u32>,
    /// The uploader was inside an iteration during the minute.
    pub is_uploading: Vec<u32>,
    /// CamTracker starts during the minute.
    pub camtracker_startups: Vec<u32>,
    /// OPUS starts during the minute.
    pub opus_startups: Vec<u32>,
    /// CLI invocations during the minute.
    pub cli_calls: Vec<u32>,
}

impl ActivityHistory {
    /// Empty document for `date`.
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            is_running: zeroes(),
            is_measuring: zeroes(),
            has_errors: zeroes(),
            is_uploading: zeroes(),
            camtracker_startups: zeroes(),
            opus_startups: zeroes(),
            cli_calls: zeroes(),
        }
    }

    /// File path of the document for `date` under `dir`.
    pub fn path_for(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("activity-{}.json", date.format("%Y-%m-%d")))
    }

    /// Load the day's document, creating an empty one lazily.
    ///
    /// A document whose vectors do not have 1440 buckets is treated as
    /// corrupt and replaced.
    pub fn load_or_create(dir: &Path, date: NaiveDate) -> Self {
        let path = Self::path_for(dir, date);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Self::new(date);
        };
        match serde_json::from_str::<Self>(&text) {
            Ok(doc) if doc.date == date && doc.is_consistent() => doc,
            _ => Self::new(date),
        }
    }

    fn is_consistent(&self) -> bool {
        [
            &self.is_running,
            &self.is_measuring,
            &self.has_errors,
            &self.is_uploading,
            &self.camtracker_startups,
            &self.opus_startups,
            &self.cli_calls,
        ]
        .iter()
        .all(|v| v.len() == MINUTES_PER_DAY)
    }

    /// Persist the document under `dir`.
    pub fn dump(&self, dir: &Path) -> std::io::Result<()> {
        atomic_write_json(&Self::path_for(dir, self.date), self)
    }

    /// Record one sample for the minute `hour * 60 + minute` (local time).
    ///
    /// Boolean metrics are set to 1, counters accumulate.
    pub fn sample(
        &mut self,
        minute_index: usize,
        is_running: bool,
        is_measuring: bool,
        has_errors: bool,
        is_uploading: bool,
        camtracker_startups: u32,
        opus_startups: u32,
        cli_calls: u32,
    ) {
        if minute_index >= MINUTES_PER_DAY {
            return;
        }
        if is_running {
            self.is_running[minute_index] = 1;
        }
        if is_measuring {
            self.is_measuring[minute_index] = 1;
        }
        if has_errors {
            self.has_errors[minute_index] = 1;
        }
        if is_uploading {
            self.is_uploading[minute_index] = 1;
        }
        self.camtracker_startups[minute_index] += camtracker_startups;
        self.opus_startups[minute_index] += opus_startups;
        self.cli_calls[minute_index] += cli_calls;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 12).unwrap()
    }

    #[test]
    fn test_sample_touches_exactly_one_bucket() {
        let mut doc = ActivityHistory::new(date());
        let minute = 10 * 60 + 42;
        doc.sample(minute, true, true, false, false, 1, 0, 2);

        for m in 0..MINUTES_PER_DAY {
            if m == minute {
                assert_eq!(doc.is_running[m], 1);
                assert_eq!(doc.is_measuring[m], 1);
                assert_eq!(doc.camtracker_startups[m], 1);
                assert_eq!(doc.cli_calls[m], 2);
            } else {
                assert_eq!(doc.is_running[m], 0);
                assert_eq!(doc.is_measuring[m], 0);
                assert_eq!(doc.camtracker_startups[m], 0);
                assert_eq!(doc.cli_calls[m], 0);
            }
        }
    }

    #[test]
    fn test_counters_accumulate_booleans_saturate() {
        let mut doc = ActivityHistory::new(date());
        doc.sample(5, true, false, true, false, 1, 1, 1);
        doc.sample(5, true, false, true, false, 1, 0, 3);
        assert_eq!(doc.is_running[5], 1);
        assert_eq!(doc.has_errors[5], 1);
        assert_eq!(doc.camtracker_startups[5], 2);
        assert_eq!(doc.opus_startups[5], 1);
        assert_eq!(doc.cli_calls[5], 4);
    }

    #[test]
    fn test_out_of_range_minute_ignored() {
        let mut doc = ActivityHistory::new(date());
        doc.sample(MINUTES_PER_DAY, true, true, true, true, 1, 1, 1);
        assert!(doc.is_running.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_dump_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = ActivityHistory::new(date());
        doc.sample(100, true, false, false, true, 0, 1, 0);
        doc.dump(dir.path()).unwrap();

        let path = ActivityHistory::path_for(dir.path(), date());
        assert!(path.ends_with("activity-2024-07-12.json"));

        let reloaded = ActivityHistory::load_or_create(dir.path(), date());
        assert_eq!(reloaded, doc);
    }

    #[test]
    fn test_load_missing_creates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = ActivityHistory::load_or_create(dir.path(), date());
        assert_eq!(doc, ActivityHistory::new(date()));
    }

    #[test]
    fn test_corrupt_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = ActivityHistory::path_for(dir.path(), date());
        std::fs::write(&path, "{\"date\": \"2024-07-12\"}").unwrap();
        let doc = ActivityHistory::load_or_create(dir.path(), date());
        assert_eq!(doc, ActivityHistory::new(date()));
    }
}
