//! Hard safety thresholds.

use serde::{Deserialize, Serialize};

use super::HardwareSnapshot;
use crate::config::{OptimizerConfig, PlatformConfig};

/// A hard threshold the snapshot violates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyViolation {
    /// CPU at or above its maximum temperature.
    CpuTemperature { value: f64, max: f64 },
    /// GPU at or above its maximum temperature.
    GpuTemperature { value: f64, max: f64 },
    /// Power draw at or above budget.
    Power { value: f64, budget: f64 },
    /// Memory pressure at or above the hard limit.
    MemoryPressure { value: f64, limit: f64 },
    /// Hardware is throttling.
    Throttling,
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyViolation::CpuTemperature { value, max } => write!(f, "cpu temperature {value:.1}°C >= {max:.1}°C"),
            SafetyViolation::GpuTemperature { value, max } => write!(f, "gpu temperature {value:.1}°C >= {max:.1}°C"),
            SafetyViolation::Power { value, budget } => write!(f, "power {value:.1}W >= budget {budget:.1}W"),
            SafetyViolation::MemoryPressure { value, limit } => write!(f, "memory pressure {value:.2} >= {limit:.2}"),
            SafetyViolation::Throttling => write!(f, "thermal throttling active"),
        }
    }
}

/// Hard gate evaluated before and during optimization.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    max_cpu_temp_c: f64,
    max_gpu_temp_c: f64,
    power_budget_w: f64,
    hard_pressure: f64,
}

impl SafetyGate {
    /// Gate for a platform envelope.
    pub fn new(platform: &PlatformConfig, optimizer: &OptimizerConfig) -> Self {
        Self {
            max_cpu_temp_c: platform.max_cpu_temp_c,
            max_gpu_temp_c: platform.max_gpu_temp_c,
            power_budget_w: platform.power_budget_w,
            hard_pressure: optimizer.hard_pressure,
        }
    }

    /// First violated threshold, if any.
    pub fn check(&self, s: &HardwareSnapshot) -> Option<SafetyViolation> {
        if s.cpu_temp_c >= self.max_cpu_temp_c {
            return Some(SafetyViolation::CpuTemperature { value: s.cpu_temp_c, max: self.max_cpu_temp_c });
        }
        if s.gpu_temp_c >= self.max_gpu_temp_c {
            return Some(SafetyViolation::GpuTemperature { value: s.gpu_temp_c, max: self.max_gpu_temp_c });
        }
        if s.power_w >= self.power_budget_w {
            return Some(SafetyViolation::Power { value: s.power_w, budget: self.power_budget_w });
        }
        if s.memory_pressure >= self.hard_pressure {
            return Some(SafetyViolation::MemoryPressure { value: s.memory_pressure, limit: self.hard_pressure });
        }
        if s.thermal_throttling {
            return Some(SafetyViolation::Throttling);
        }
        None
    }
}
