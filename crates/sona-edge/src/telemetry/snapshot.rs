//! Hardware state snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading of the SoC's thermal, power, memory and utilization state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Hottest CPU zone, °C.
    pub cpu_temp_c: f64,
    /// GPU zone, °C.
    pub gpu_temp_c: f64,
    /// CPU utilization, `[0, 1]`.
    pub cpu_util: f64,
    /// GPU utilization, `[0, 1]`.
    pub gpu_util: f64,
    /// System memory in use.
    pub memory_used_mb: f64,
    /// Fraction of system memory in use, `[0, 1]`.
    pub memory_pressure: f64,
    /// GPU memory in use.
    pub gpu_memory_used_mb: f64,
    /// Board power draw.
    pub power_w: f64,
    /// Hardware has reduced clocks to shed heat.
    pub thermal_throttling: bool,
    /// Current CPU clock.
    pub clock_ghz: f64,
    /// Fan speed.
    pub fan_rpm: f64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// A cool, lightly loaded device.
    pub fn nominal() -> Self {
        HardwareSnapshot {
            cpu_temp_c: 55.0,
            gpu_temp_c: 52.0,
            cpu_util: 0.30,
            gpu_util: 0.20,
            memory_used_mb: 2_048.0,
            memory_pressure: 0.40,
            gpu_memory_used_mb: 256.0,
            power_w: 8.0,
            thermal_throttling: false,
            clock_ghz: 1.9,
            fan_rpm: 2_200.0,
            timestamp: Utc::now(),
        }
    }

    /// Change from `self` to `after`.
    pub fn delta_to(&self, after: &HardwareSnapshot) -> HardwareDelta {
        HardwareDelta {
            cpu_temp_c: after.cpu_temp_c - self.cpu_temp_c,
            gpu_temp_c: after.gpu_temp_c - self.gpu_temp_c,
            cpu_util: after.cpu_util - self.cpu_util,
            gpu_util: after.gpu_util - self.gpu_util,
            memory_pressure: after.memory_pressure - self.memory_pressure,
            power_w: after.power_w - self.power_w,
        }
    }
}

/// Difference between two snapshots (`post − pre`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareDelta {
    /// CPU temperature change.
    pub cpu_temp_c: f64,
    /// GPU temperature change.
    pub gpu_temp_c: f64,
    /// CPU utilization change.
    pub cpu_util: f64,
    /// GPU utilization change.
    pub gpu_util: f64,
    /// Memory pressure change.
    pub memory_pressure: f64,
    /// Power change.
    pub power_w: f64,
}
