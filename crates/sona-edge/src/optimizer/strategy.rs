//! Strategy selection from performance gaps and live hardware state.

use serde::{Deserialize, Serialize};

use super::estimator::PerformanceEstimate;
use super::goals::EffectiveGoals;
use super::techniques::Technique;
use crate::config::{OptimizerConfig, PlatformConfig, TelemetryConfig};
use crate::telemetry::HardwareSnapshot;

// Priority score weights. Accuracy dominates, throttling comes second.
const ACCURACY_WEIGHT: f64 = 0.35;
const THROTTLING_WEIGHT: f64 = 0.25;
const LATENCY_WEIGHT: f64 = 0.2;
const MEMORY_WEIGHT: f64 = 0.15;
const HEADROOM_WEIGHT: f64 = 0.05;

/// Strategy priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Routine tuning.
    Low,
    /// Noticeable gap.
    Medium,
    /// Large gap or hot hardware.
    High,
    /// Immediate action required.
    Critical,
}

impl Priority {
    /// Map a score in `[0, 1]` to a priority.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.6 {
            Priority::Critical
        } else if score >= 0.4 {
            Priority::High
        } else if score >= 0.2 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Relative distance between current performance and the goals, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceGaps {
    pub latency: f64,
    pub memory: f64,
    pub accuracy: f64,
}

impl PerformanceGaps {
    /// Gaps of `baseline` against `goals`.
    pub fn measure(baseline: &PerformanceEstimate, goals: &EffectiveGoals) -> Self {
        let over = |current: f64, target: f64| {
            if current > target && current > 0.0 {
                ((current - target) / current).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        let accuracy = if baseline.accuracy < goals.min_accuracy && goals.min_accuracy > 0.0 {
            ((goals.min_accuracy - baseline.accuracy) / goals.min_accuracy).clamp(0.0, 1.0)
        } else {
            0.0
        };
        PerformanceGaps {
            latency: over(baseline.latency_ms, goals.max_latency_ms),
            memory: over(baseline.memory_mb, goals.max_memory_mb),
            accuracy,
        }
    }
}

/// Hardware conditions that add techniques and raise priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareUrgency {
    /// Hottest sensor as a fraction of its maximum.
    pub thermal_ratio: f64,
    pub memory_pressure: f64,
    pub throttling: bool,
    /// Thermal alert condition (near max or throttling).
    pub thermal_alert: bool,
    /// Memory alert condition.
    pub memory_alert: bool,
    pub gpu_saturated: bool,
}

impl HardwareUrgency {
    pub fn assess(
        snapshot: &HardwareSnapshot,
        platform: &PlatformConfig,
        telemetry: &TelemetryConfig,
        optimizer: &OptimizerConfig,
    ) -> Self {
        let thermal_ratio = (snapshot.cpu_temp_c / platform.max_cpu_temp_c).max(snapshot.gpu_temp_c / platform.max_gpu_temp_c);
        HardwareUrgency {
            thermal_ratio,
            memory_pressure: snapshot.memory_pressure,
            throttling: snapshot.thermal_throttling,
            thermal_alert: snapshot.thermal_throttling || thermal_ratio >= telemetry.thermal_alert_ratio,
            memory_alert: snapshot.memory_pressure > telemetry.memory_alert_pressure,
            gpu_saturated: snapshot.gpu_util >= optimizer.gpu_saturation,
        }
    }

    /// Remaining-headroom pressure in `[0, 1]`.
    fn headroom_pressure(&self) -> f64 {
        self.thermal_ratio.max(self.memory_pressure).clamp(0.0, 1.0)
    }
}

/// Peak resources the strategy is expected to need.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Working copy of the model plus estimator scratch.
    pub peak_memory_mb: f64,
    pub cpu_share: f64,
}

/// Temperatures the run must respect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalConstraints {
    pub max_cpu_temp_c: f64,
    pub max_gpu_temp_c: f64,
    /// CPU temperature at which a cooldown is inserted between techniques.
    pub cooldown_at_c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerConstraints {
    pub budget_w: f64,
    pub energy_efficient: bool,
}

/// Ordered technique plan for one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStrategy {
    pub techniques: Vec<Technique>,
    pub priority: Priority,
    /// Weighted score behind `priority`.
    pub score: f64,
    pub gaps: PerformanceGaps,
    pub urgency: HardwareUrgency,
    pub estimated_duration_ms: u64,
    pub resource_requirements: ResourceRequirements,
    pub thermal_constraints: ThermalConstraints,
    pub power_constraints: PowerConstraints,
}

/// Build the strategy for `goals` given the current `baseline` and hardware.
pub fn select_strategy(
    goals: &EffectiveGoals,
    baseline: &PerformanceEstimate,
    snapshot: &HardwareSnapshot,
    platform: &PlatformConfig,
    telemetry: &TelemetryConfig,
    optimizer: &OptimizerConfig,
) -> OptimizationStrategy {
    let gaps = PerformanceGaps::measure(baseline, goals);
    let urgency = HardwareUrgency::assess(snapshot, platform, telemetry, optimizer);

    let mut techniques: Vec<Technique> = Vec::new();
    let mut add = |set: &[Technique]| {
        for t in set {
            if !techniques.contains(t) {
                techniques.push(*t);
            }
        }
    };

    if gaps.latency > 0.0 {
        add(&[Technique::Pruning, Technique::Quantization, Technique::ArchitectureOptimization]);
    }
    if gaps.memory > 0.0 {
        add(&[Technique::Compression, Technique::Quantization, Technique::FeatureSelection]);
    }
    if gaps.accuracy > 0.0 {
        add(&[Technique::Ensembling, Technique::DataAugmentation, Technique::HyperparameterTuning]);
    }
    if urgency.thermal_alert {
        add(&[Technique::ThermalOptimization, Technique::DynamicInference, Technique::KnowledgeDistillation]);
    }
    if urgency.memory_alert {
        add(&[Technique::AggressiveCompression, Technique::GradientCheckpointing]);
    }
    if urgency.gpu_saturated {
        add(&[Technique::GpuMemoryOptimization, Technique::TensorFusion]);
    }
    if goals.energy_efficient {
        techniques.retain(|t| *t != Technique::Ensembling);
    }

    let throttling = if urgency.throttling { 1.0 } else { 0.0 };
    let score = (ACCURACY_WEIGHT * gaps.accuracy
        + THROTTLING_WEIGHT * throttling
        + LATENCY_WEIGHT * gaps.latency
        + MEMORY_WEIGHT * gaps.memory
        + HEADROOM_WEIGHT * urgency.headroom_pressure())
    .clamp(0.0, 1.0);

    let estimated_duration_ms = techniques.iter().map(Technique::estimated_cost_ms).sum();

    OptimizationStrategy {
        priority: Priority::from_score(score),
        score,
        gaps,
        urgency,
        estimated_duration_ms,
        resource_requirements: ResourceRequirements {
            peak_memory_mb: baseline.memory_mb * 2.0,
            cpu_share: if goals.energy_efficient { 0.5 } else { 1.0 },
        },
        thermal_constraints: ThermalConstraints {
            max_cpu_temp_c: platform.max_cpu_temp_c,
            max_gpu_temp_c: platform.max_gpu_temp_c,
            cooldown_at_c: platform.max_cpu_temp_c * optimizer.cooldown_ratio,
        },
        power_constraints: PowerConstraints {
            budget_w: platform.power_budget_w,
            energy_efficient: goals.energy_efficient,
        },
        techniques,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goals(latency: f64, memory: f64, accuracy: f64, energy: bool) -> EffectiveGoals {
        EffectiveGoals {
            max_latency_ms: latency,
            max_memory_mb: memory,
            min_accuracy: accuracy,
            energy_efficient: energy,
            clamped: false,
            adjustments: Vec::new(),
        }
    }

    fn baseline() -> PerformanceEstimate {
        PerformanceEstimate { latency_ms: 4.0, memory_mb: 1.0, accuracy: 0.7 }
    }

    fn select(goals: &EffectiveGoals, snapshot: &HardwareSnapshot) -> OptimizationStrategy {
        select_strategy(
            goals,
            &baseline(),
            snapshot,
            &PlatformConfig::default(),
            &TelemetryConfig::default(),
            &OptimizerConfig::default(),
        )
    }

    #[test]
    fn no_gaps_on_nominal_hardware_is_empty_and_low() {
        let s = select(&goals(10.0, 10.0, 0.6, false), &HardwareSnapshot::nominal());
        assert!(s.techniques.is_empty());
        assert_eq!(s.priority, Priority::Low);
        assert_eq!(s.estimated_duration_ms, 0);
    }

    #[test]
    fn latency_and_memory_gaps_share_quantization_once() {
        let s = select(&goals(2.0, 0.5, 0.6, false), &HardwareSnapshot::nominal());
        assert_eq!(
            s.techniques,
            vec![
                Technique::Pruning,
                Technique::Quantization,
                Technique::ArchitectureOptimization,
                Technique::Compression,
                Technique::FeatureSelection,
            ]
        );
    }

    #[test]
    fn energy_efficiency_drops_ensembling() {
        let s = select(&goals(10.0, 10.0, 0.9, true), &HardwareSnapshot::nominal());
        assert_eq!(s.techniques, vec![Technique::DataAugmentation, Technique::HyperparameterTuning]);
        assert!(s.power_constraints.energy_efficient);
    }

    #[test]
    fn hardware_state_adds_techniques() {
        let mut snap = HardwareSnapshot::nominal();
        snap.cpu_temp_c = 79.0;
        snap.memory_pressure = 0.9;
        snap.gpu_util = 0.95;
        let s = select(&goals(10.0, 10.0, 0.6, false), &snap);
        for t in [
            Technique::ThermalOptimization,
            Technique::DynamicInference,
            Technique::KnowledgeDistillation,
            Technique::AggressiveCompression,
            Technique::GradientCheckpointing,
            Technique::GpuMemoryOptimization,
            Technique::TensorFusion,
        ] {
            assert!(s.techniques.contains(&t), "missing {t}");
        }
    }

    #[test]
    fn accuracy_gap_outweighs_equal_latency_gap() {
        let snap = HardwareSnapshot::nominal();
        let (p, t, o) = (PlatformConfig::default(), TelemetryConfig::default(), OptimizerConfig::default());
        let weak = PerformanceEstimate { latency_ms: 2.0, memory_mb: 1.0, accuracy: 0.4 };
        let slow = PerformanceEstimate { latency_ms: 4.0, memory_mb: 1.0, accuracy: 0.9 };
        let accuracy = select_strategy(&goals(2.0, 10.0, 0.8, false), &weak, &snap, &p, &t, &o);
        let latency = select_strategy(&goals(2.0, 10.0, 0.8, false), &slow, &snap, &p, &t, &o);
        assert!((accuracy.gaps.accuracy - 0.5).abs() < 1e-12);
        assert!((latency.gaps.latency - 0.5).abs() < 1e-12);
        assert!(accuracy.score > latency.score);
    }

    #[test]
    fn throttling_raises_priority() {
        let g = goals(2.0, 10.0, 0.6, true);
        let calm = select(&g, &HardwareSnapshot::nominal());
        let mut hot = HardwareSnapshot::nominal();
        hot.thermal_throttling = true;
        let throttled = select(&g, &hot);
        assert!(throttled.priority > calm.priority);
        assert!((throttled.score - calm.score - THROTTLING_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn priority_thresholds() {
        assert_eq!(Priority::from_score(0.0), Priority::Low);
        assert_eq!(Priority::from_score(0.2), Priority::Medium);
        assert_eq!(Priority::from_score(0.45), Priority::High);
        assert_eq!(Priority::from_score(0.9), Priority::Critical);
    }
}
