// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Ring buffer + hysteresis over edge fractions.

use std::collections::VecDeque;

use crate::state::TriState;

/// Lower hysteresis threshold as a share of the upper one.
const LOWER_THRESHOLD_SHARE: f64 = 0.7;

/// Smooths per-frame edge fractions over a ring buffer and applies
/// two-threshold hysteresis so a single cloud passage does not flap the
/// classifier verdict.
#[derive(Debug)]
pub struct HeliosEvaluator {
    fractions: VecDeque<f64>,
    evaluation_size: usize,
    upper_threshold: f64,
    verdict: TriState,
}

impl HeliosEvaluator {
    pub fn new(evaluation_size: usize, edge_detection_threshold: f64) -> Self {
        Self {
            fractions: VecDeque::with_capacity(evaluation_size),
            evaluation_size: evaluation_size.max(1),
            upper_threshold: edge_detection_threshold,
            verdict: TriState::Inconclusive,
        }
    }

    /// Drop all history, e.g. after a camera re-init or a night pause.
    pub fn reset(&mut self) {
        self.fractions.clear();
        self.verdict = TriState::Inconclusive;
    }

    /// Reconfigure thresholds; history survives a pure threshold change.
    pub fn update_config(&mut self, evaluation_size: usize, edge_detection_threshold: f64) {
        self.evaluation_size = evaluation_size.max(1);
        self.upper_threshold = edge_detection_threshold;
        while self.fractions.len() > self.evaluation_size {
            self.fractions.pop_front();
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.fractions.is_empty() {
            return None;
        }
        Some(self.fractions.iter().sum::<f64>() / self.fractions.len() as f64)
    }

    /// Feed one edge fraction, return the (possibly unchanged) verdict.
    pub fn push(&mut self, edge_fraction: f64) -> TriState {
        if self.fractions.len() == self.evaluation_size {
            self.fractions.pop_front();
        }
        self.fractions.push_back(edge_fraction);

        let mean = self.mean().unwrap_or(0.0);
        let ring_full = self.fractions.len() == self.evaluation_size;
        let upper = self.upper_threshold;
        let lower = upper * LOWER_THRESHOLD_SHARE;

        self.verdict = match self.verdict {
            TriState::Inconclusive => {
                if mean >= upper {
                    TriState::Yes
                } else if ring_full {
                    TriState::No
                } else {
                    TriState::Inconclusive
                }
            }
            TriState::Yes => {
                if mean <= lower {
                    TriState::No
                } else {
                    TriState::Yes
                }
            }
            TriState::No => {
                if mean >= upper {
                    TriState::Yes
                } else {
                    TriState::No
                }
            }
        };
        self.verdict
    }

    pub fn verdict(&self) -> TriState {
        self.verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_inconclusive_until_ring_full() {
        let mut evaluator = HeliosEvaluator::new(4, 0.4);
        assert_eq!(evaluator.push(0.1), TriState::Inconclusive);
        assert_eq!(evaluator.push(0.1), TriState::Inconclusive);
        assert_eq!(evaluator.push(0.1), TriState::Inconclusive);
        // ring full, mean below upper
        assert_eq!(evaluator.push(0.1), TriState::No);
    }

    #[test]
    fn test_good_before_ring_full_on_high_mean() {
        let mut evaluator = HeliosEvaluator::new(10, 0.4);
        assert_eq!(evaluator.push(0.5), TriState::Yes);
    }

    #[test]
    fn test_hysteresis_band_holds_verdict() {
        let mut evaluator = HeliosEvaluator::new(1, 0.4);
        assert_eq!(evaluator.push(0.5), TriState::Yes);
        // between lower (0.28) and upper (0.4): verdict sticks
        assert_eq!(evaluator.push(0.35), TriState::Yes);
        assert_eq!(evaluator.push(0.29), TriState::Yes);
        // at or below lower: flips
        assert_eq!(evaluator.push(0.28), TriState::No);
        // back between thresholds: still bad
        assert_eq!(evaluator.push(0.35), TriState::No);
        // at upper: good again
        assert_eq!(evaluator.push(0.4), TriState::Yes);
    }

    #[test]
    fn test_mean_over_ring() {
        let mut evaluator = HeliosEvaluator::new(2, 0.9);
        evaluator.push(0.2);
        evaluator.push(0.4);
        assert!((evaluator.mean().unwrap() - 0.3).abs() < 1e-9);
        // ring evicts the oldest value
        evaluator.push(0.6);
        assert!((evaluator.mean().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut evaluator = HeliosEvaluator::new(1, 0.4);
        evaluator.push(0.5);
        evaluator.reset();
        assert_eq!(evaluator.verdict(), TriState::Inconclusive);
        assert_eq!(evaluator.mean(), None);
    }
}
