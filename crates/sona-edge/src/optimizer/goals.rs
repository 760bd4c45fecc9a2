//! Optimization goals and their clamping to the platform envelope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::estimator::PerformanceEstimate;
use crate::config::{OptimizerConfig, PlatformConfig, TelemetryConfig};
use crate::telemetry::HardwareSnapshot;

/// Throttling tightens the latency target by this factor.
const THROTTLE_LATENCY_FACTOR: f64 = 0.8;
/// High memory pressure shrinks the memory target by this factor.
const PRESSURE_MEMORY_FACTOR: f64 = 0.75;

/// What the caller wants from an optimization run. Unset targets default to
/// the model's current performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationGoals {
    /// Latency target.
    pub max_latency_ms: Option<f64>,
    /// Memory target.
    pub max_memory_mb: Option<f64>,
    /// Accuracy to preserve.
    pub min_accuracy: Option<f64>,
    /// Prefer energy-saving techniques.
    #[serde(default)]
    pub energy_efficient: bool,
}

impl OptimizationGoals {
    /// Emergency profile for thermal alerts: tightest latency, half the memory
    /// ceiling, energy-efficient.
    pub fn emergency(platform: &PlatformConfig) -> Self {
        OptimizationGoals {
            max_latency_ms: Some(platform.latency_floor_ms),
            max_memory_mb: Some(platform.memory_ceiling_mb / 2.0),
            min_accuracy: Some(platform.accuracy_floor),
            energy_efficient: true,
        }
    }

    /// Memory-focused profile for memory-pressure alerts.
    pub fn memory_focused(platform: &PlatformConfig) -> Self {
        OptimizationGoals {
            max_latency_ms: None,
            max_memory_mb: Some(platform.memory_ceiling_mb / 4.0),
            min_accuracy: Some(platform.accuracy_floor),
            energy_efficient: false,
        }
    }

    /// Stable digest of the goals, used as a cache key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let field = |v: Option<f64>| v.map(f64::to_bits).unwrap_or(u64::MAX).to_le_bytes();
        hasher.update(field(self.max_latency_ms));
        hasher.update(field(self.max_memory_mb));
        hasher.update(field(self.min_accuracy));
        hasher.update([self.energy_efficient as u8]);
        hasher.finalize()[..12].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Goals as actually used, after clamping and hardware adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveGoals {
    /// Latency target.
    pub max_latency_ms: f64,
    /// Memory target.
    pub max_memory_mb: f64,
    /// Accuracy floor.
    pub min_accuracy: f64,
    /// Energy-saving mode.
    pub energy_efficient: bool,
    /// A caller target was outside the platform envelope.
    pub clamped: bool,
    /// Human-readable record of every change.
    pub adjustments: Vec<String>,
}

/// Clamp caller goals to what the platform can deliver and fold in live
/// hardware state.
///
/// Unreachable targets are never an error: they are clamped and recorded.
pub fn clamp_goals(
    goals: &OptimizationGoals,
    snapshot: &HardwareSnapshot,
    baseline: &PerformanceEstimate,
    platform: &PlatformConfig,
    telemetry: &TelemetryConfig,
    optimizer: &OptimizerConfig,
) -> EffectiveGoals {
    let mut adjustments = Vec::new();
    let mut clamped = false;

    let mut max_latency_ms = goals.max_latency_ms.unwrap_or(baseline.latency_ms);
    if max_latency_ms < platform.latency_floor_ms {
        adjustments.push(format!(
            "latency target {max_latency_ms:.2}ms raised to platform floor {:.2}ms",
            platform.latency_floor_ms
        ));
        max_latency_ms = platform.latency_floor_ms;
        clamped = true;
    }

    let mut max_memory_mb = goals.max_memory_mb.unwrap_or(baseline.memory_mb);
    if max_memory_mb > platform.memory_ceiling_mb {
        adjustments.push(format!(
            "memory target {max_memory_mb:.1}MB lowered to ceiling {:.1}MB",
            platform.memory_ceiling_mb
        ));
        max_memory_mb = platform.memory_ceiling_mb;
        clamped = true;
    }
    if max_memory_mb <= 0.0 {
        adjustments.push("non-positive memory target replaced by ceiling".to_string());
        max_memory_mb = platform.memory_ceiling_mb;
        clamped = true;
    }

    let requested_accuracy = goals.min_accuracy.unwrap_or(platform.accuracy_floor);
    let min_accuracy = requested_accuracy.clamp(platform.accuracy_floor, platform.max_attainable_accuracy);
    if min_accuracy != requested_accuracy {
        adjustments.push(format!("accuracy target {requested_accuracy:.3} clamped to {min_accuracy:.3}"));
        clamped = true;
    }

    let mut energy_efficient = goals.energy_efficient;
    if snapshot.thermal_throttling {
        energy_efficient = true;
        let tightened = (max_latency_ms * THROTTLE_LATENCY_FACTOR).max(platform.latency_floor_ms);
        adjustments.push(format!("throttling: energy-efficient forced, latency {max_latency_ms:.2}ms -> {tightened:.2}ms"));
        max_latency_ms = tightened;
    }
    if snapshot.memory_pressure > telemetry.memory_alert_pressure {
        let shrunk = max_memory_mb * PRESSURE_MEMORY_FACTOR;
        adjustments.push(format!(
            "memory pressure {:.2}: memory target {max_memory_mb:.2}MB -> {shrunk:.2}MB",
            snapshot.memory_pressure
        ));
        max_memory_mb = shrunk;
    }
    if snapshot.power_w >= platform.power_budget_w * optimizer.power_margin && !energy_efficient {
        energy_efficient = true;
        adjustments.push(format!(
            "power {:.1}W near budget {:.1}W: energy-efficient forced",
            snapshot.power_w, platform.power_budget_w
        ));
    }

    EffectiveGoals { max_latency_ms, max_memory_mb, min_accuracy, energy_efficient, clamped, adjustments }
}
