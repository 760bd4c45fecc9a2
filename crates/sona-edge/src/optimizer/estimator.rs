//! Deterministic performance model.
//!
//! Latency, memory and accuracy are derived from the weights' effective
//! parameter count, precision and runtime profile, scaled by live clock,
//! utilization and throttling. Technique effects are measured by estimating
//! before and after each transformation.

use serde::{Deserialize, Serialize};

use crate::domain::{ModelWeights, Precision};
use crate::telemetry::HardwareSnapshot;

/// Per-layer dispatch cost.
const DISPATCH_MS_PER_LAYER: f64 = 0.5;
/// Compute cost per effective f32 parameter at 1 GHz.
const COMPUTE_MS_PER_PARAM: f64 = 2e-3;
/// Clock assumed when the snapshot reports none.
const FALLBACK_CLOCK_GHZ: f64 = 1.0;

/// Estimated performance of a model on the current hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEstimate {
    /// Inference latency.
    pub latency_ms: f64,
    /// Resident memory, weights plus activations.
    pub memory_mb: f64,
    /// Task accuracy, `[0, 1]`.
    pub accuracy: f64,
}

/// Stateless estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceEstimator;

impl PerformanceEstimator {
    /// Estimate `weights` on `snapshot`, starting from `base_accuracy`.
    pub fn estimate(&self, weights: &ModelWeights, snapshot: &HardwareSnapshot, base_accuracy: f64) -> PerformanceEstimate {
        PerformanceEstimate {
            latency_ms: self.latency_ms(weights, snapshot),
            memory_mb: self.memory_mb(weights),
            accuracy: self.accuracy(weights, base_accuracy),
        }
    }

    fn latency_ms(&self, w: &ModelWeights, s: &HardwareSnapshot) -> f64 {
        let rt = &w.runtime;
        let effective_params = if w.density() < 0.5 { w.nonzero_parameters() } else { w.total_parameters() };
        let clock = if s.clock_ghz > 0.0 { s.clock_ghz } else { FALLBACK_CLOCK_GHZ };

        let mut dispatch = DISPATCH_MS_PER_LAYER * w.layer_count() as f64;
        if rt.fused_kernels {
            dispatch *= 0.6;
        }
        let mut compute = effective_params as f64 * COMPUTE_MS_PER_PARAM * w.precision.compute_factor() / clock;
        if rt.early_exit {
            compute *= 0.8;
        }
        let mut latency = (dispatch + compute) * rt.ensemble_members.max(1) as f64;
        latency *= 1.0 + 0.5 * s.cpu_util.clamp(0.0, 1.0);
        if rt.gpu_memory_optimized {
            latency *= 0.95;
        }
        if rt.thermal_governor {
            latency *= 1.1;
        }
        if s.thermal_throttling {
            latency *= 1.5;
        }
        latency
    }

    fn memory_mb(&self, w: &ModelWeights) -> f64 {
        let widest = w.layers.iter().map(|l| l.output_dim.max(l.input_dim)).max().unwrap_or(0);
        let resident_layers = if w.runtime.gradient_checkpointing { 1 } else { w.layer_count() };
        let mut activations = (widest * resident_layers) as f64 * 4.0 / (1024.0 * 1024.0);
        if w.runtime.gpu_memory_optimized {
            activations *= 0.5;
        }
        w.memory_footprint_mb() + activations
    }

    fn accuracy(&self, w: &ModelWeights, base: f64) -> f64 {
        let rt = &w.runtime;
        let precision_penalty = match w.precision {
            Precision::F32 => 0.0,
            Precision::F16 => 0.002,
            Precision::Int8 => 0.01,
            Precision::Int4 => 0.04,
        };
        let sparsity = 1.0 - w.density();
        let mut acc = base - precision_penalty - 0.15 * sparsity * sparsity;
        if rt.early_exit {
            acc -= 0.005;
        }
        acc += 0.01 * (rt.ensemble_members.max(1) - 1).min(2) as f64;
        if rt.augmented {
            acc += 0.01;
        }
        if rt.tuned {
            acc += 0.01;
        }
        acc.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_precision_is_faster_smaller_and_less_accurate() {
        let est = PerformanceEstimator;
        let snap = HardwareSnapshot::nominal();
        let full = ModelWeights::default_architecture(1);
        let mut int8 = full.clone();
        int8.precision = Precision::Int8;

        let a = est.estimate(&full, &snap, 0.8);
        let b = est.estimate(&int8, &snap, 0.8);
        assert!(b.latency_ms < a.latency_ms);
        assert!(b.memory_mb < a.memory_mb);
        assert!(b.accuracy < a.accuracy);
    }

    #[test]
    fn throttling_slows_inference() {
        let est = PerformanceEstimator;
        let w = ModelWeights::default_architecture(1);
        let mut hot = HardwareSnapshot::nominal();
        hot.thermal_throttling = true;
        assert!(est.estimate(&w, &hot, 0.8).latency_ms > est.estimate(&w, &HardwareSnapshot::nominal(), 0.8).latency_ms);
    }

    #[test]
    fn estimate_is_deterministic() {
        let est = PerformanceEstimator;
        let w = ModelWeights::default_architecture(1);
        let snap = HardwareSnapshot::nominal();
        assert_eq!(est.estimate(&w, &snap, 0.7), est.estimate(&w, &snap, 0.7));
    }
}
