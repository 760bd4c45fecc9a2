//! Convergence classification of training cycles.
//!
//! Each update step reports its gradient norm. Rules, first match wins:
//!
//! 1. score below `threshold` ⇒ [`ConvergenceStatus::Converged`]
//! 2. score above `divergence_ratio × previous` ⇒ [`ConvergenceStatus::Diverged`]
//! 3. more than `stall_cap` iterations since the last convergence ⇒ [`ConvergenceStatus::Stalled`]
//! 4. otherwise [`ConvergenceStatus::Converging`]
//!
//! The classification is advisory. It never blocks persistence.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ConvergenceConfig;

/// Outcome label of a training cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvergenceStatus {
    /// Gradient norm fell below the threshold.
    Converged,
    /// Still improving.
    Converging,
    /// No convergence for too many iterations.
    Stalled,
    /// Gradient norm jumped.
    Diverged,
}

impl ConvergenceStatus {
    /// True for outcomes that end a cycle early.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConvergenceStatus::Converged | ConvergenceStatus::Diverged)
    }
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConvergenceStatus::Converged => "CONVERGED",
            ConvergenceStatus::Converging => "CONVERGING",
            ConvergenceStatus::Stalled => "STALLED",
            ConvergenceStatus::Diverged => "DIVERGED",
        };
        f.write_str(s)
    }
}

/// Convergence state of one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceTracker {
    previous_score: Option<f64>,
    iterations_since_converged: u64,
    last_status: Option<ConvergenceStatus>,
}

impl ConvergenceTracker {
    /// Start a new cycle. The previous score is cycle-scoped; the stall
    /// counter is not.
    pub fn begin_cycle(&mut self) {
        self.previous_score = None;
    }

    /// Classify one iteration's score.
    pub fn observe(&mut self, score: f64, config: &ConvergenceConfig) -> ConvergenceStatus {
        let status = if score < config.threshold {
            self.iterations_since_converged = 0;
            ConvergenceStatus::Converged
        } else {
            self.iterations_since_converged += 1;
            match self.previous_score {
                Some(prev) if score > config.divergence_ratio * prev => ConvergenceStatus::Diverged,
                _ if self.iterations_since_converged > config.stall_cap => ConvergenceStatus::Stalled,
                _ => ConvergenceStatus::Converging,
            }
        };
        self.previous_score = Some(score);
        self.last_status = Some(status);
        status
    }

    /// Iterations since the last convergence.
    pub fn iterations_since_converged(&self) -> u64 {
        self.iterations_since_converged
    }

    /// Most recent classification.
    pub fn last_status(&self) -> Option<ConvergenceStatus> {
        self.last_status
    }
}

/// Per-user convergence classifier.
pub struct ConvergenceClassifier {
    config: ConvergenceConfig,
    trackers: DashMap<String, ConvergenceTracker>,
}

impl ConvergenceClassifier {
    /// Create a classifier.
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config, trackers: DashMap::new() }
    }

    /// Start a new cycle for `user_id`.
    pub fn begin_cycle(&self, user_id: &str) {
        self.trackers.entry(user_id.to_string()).or_default().begin_cycle();
    }

    /// Classify one iteration for `user_id`.
    pub fn observe(&self, user_id: &str, score: f64) -> ConvergenceStatus {
        self.trackers.entry(user_id.to_string()).or_default().observe(score, &self.config)
    }

    /// Snapshot of a user's tracker.
    pub fn tracker(&self, user_id: &str) -> ConvergenceTracker {
        self.trackers.get(user_id).map(|t| t.clone()).unwrap_or_default()
    }

    /// Forget a user.
    pub fn reset(&self, user_id: &str) {
        self.trackers.remove(user_id);
    }

    /// Active thresholds.
    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }
}
