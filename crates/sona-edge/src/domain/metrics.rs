//! Quality summary exposed to downstream consumers.
//!
//! Avatar, voice and scheduling consumers read [`ModelMetrics`]; they never
//! see raw weights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::weights::Precision;
use crate::convergence::ConvergenceStatus;

/// Per-user model quality summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    /// Estimated task accuracy, in `[0, 1]`.
    pub accuracy: f64,
    /// Mean sanitized pattern strength of the last cycle.
    pub confidence: f64,
    /// Agreement between patterns of the last cycle.
    pub consistency: f64,
    /// Moving average of per-cycle accuracy improvement.
    pub adaptation_rate: f64,
    /// Accuracy improvement of the last cycle.
    pub last_accuracy_improvement: f64,
    /// Completed training cycles.
    pub training_cycles: u64,
    /// Outcome of the last cycle.
    pub last_status: Option<ConvergenceStatus>,
    /// Footprint of the persisted model.
    pub memory_footprint_mb: f64,
    /// Precision of the persisted model.
    pub precision: Precision,
    /// Time of the last change.
    pub updated_at: Option<DateTime<Utc>>,
    /// Set when this summary is a conservative stand-in.
    pub fallback: bool,
}

impl Default for ModelMetrics {
    fn default() -> Self {
        Self::neutral()
    }
}

impl ModelMetrics {
    /// Summary for a user with no history.
    pub fn neutral() -> Self {
        ModelMetrics {
            accuracy: 0.5,
            confidence: 0.5,
            consistency: 0.5,
            adaptation_rate: 0.0,
            last_accuracy_improvement: 0.0,
            training_cycles: 0,
            last_status: None,
            memory_footprint_mb: 0.0,
            precision: Precision::F32,
            updated_at: None,
            fallback: false,
        }
    }

    /// Neutral summary marked as a fallback.
    pub fn fallback() -> Self {
        ModelMetrics { fallback: true, ..Self::neutral() }
    }

    /// Fold the outcome of one training cycle into the summary.
    ///
    /// Accuracy moves toward `ceiling` in proportion to the improvement,
    /// weighted by how consistent the batch was.
    pub fn record_cycle(&mut self, cycle: &CycleSummary, ceiling: f64) {
        let gain = (ceiling - self.accuracy).max(0.0) * cycle.accuracy_improvement * cycle.consistency;
        self.accuracy = (self.accuracy + 0.5 * gain).clamp(0.0, ceiling.max(self.accuracy));
        self.confidence = cycle.confidence;
        self.consistency = cycle.consistency;
        self.adaptation_rate = if self.training_cycles == 0 {
            cycle.accuracy_improvement
        } else {
            0.8 * self.adaptation_rate + 0.2 * cycle.accuracy_improvement
        };
        self.last_accuracy_improvement = cycle.accuracy_improvement;
        self.training_cycles += 1;
        self.last_status = Some(cycle.status);
        self.memory_footprint_mb = cycle.memory_footprint_mb;
        self.precision = cycle.precision;
        self.updated_at = Some(Utc::now());
        self.fallback = false;
    }
}

/// Inputs to [`ModelMetrics::record_cycle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    /// `1 - final/initial` gradient norm, in `[0, 1]`.
    pub accuracy_improvement: f64,
    /// Mean sanitized strength.
    pub confidence: f64,
    /// Pattern agreement, in `[0, 1]`.
    pub consistency: f64,
    /// Convergence outcome.
    pub status: ConvergenceStatus,
    /// Footprint after the cycle.
    pub memory_footprint_mb: f64,
    /// Precision after the cycle.
    pub precision: Precision,
}

impl std::fmt::Display for ModelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accuracy={:.3} confidence={:.3} consistency={:.3} cycles={} footprint={:.4}MB{}",
            self.accuracy,
            self.confidence,
            self.consistency,
            self.training_cycles,
            self.memory_footprint_mb,
            if self.fallback { " (fallback)" } else { "" }
        )
    }
}
