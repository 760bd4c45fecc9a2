//! Engine configuration.
//!
//! [`EngineConfig`] holds every tunable of the personalization core: the
//! platform envelope, privacy budget, trainer hyper-parameters, convergence
//! thresholds, telemetry cadence and optimizer policy. It serializes to JSON so
//! a device image can ship its own envelope.
//!
//! # Example
//!
//! ```rust
//! use sona_edge::config::EngineConfig;
//!
//! let cfg = EngineConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.platform.memory_ceiling_mb, 512.0);
//! assert_eq!(cfg.trainer.max_steps, 150);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Complete configuration for an [`AdaptiveLearningEngine`].
///
/// [`AdaptiveLearningEngine`]: crate::engine::AdaptiveLearningEngine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hardware envelope of the device.
    pub platform: PlatformConfig,
    /// Differential-privacy parameters.
    pub privacy: PrivacyConfig,
    /// Incremental trainer hyper-parameters.
    pub trainer: TrainerConfig,
    /// Convergence classifier thresholds.
    pub convergence: ConvergenceConfig,
    /// Telemetry sampler cadence and alert thresholds.
    pub telemetry: TelemetryConfig,
    /// Optimization controller policy.
    pub optimizer: OptimizerConfig,
    /// Lifecycle event bus.
    pub events: EventConfig,
}

/// Physical limits of the target SoC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Hard ceiling for a user's model footprint. Default: **512 MB**.
    pub memory_ceiling_mb: f64,
    /// CPU temperature at which all optimization is refused. Default: **85 °C**.
    pub max_cpu_temp_c: f64,
    /// GPU temperature at which all optimization is refused. Default: **85 °C**.
    pub max_gpu_temp_c: f64,
    /// Sustained power budget. Default: **15 W**.
    pub power_budget_w: f64,
    /// Lowest latency the hardware can physically reach. Default: **2 ms**.
    pub latency_floor_ms: f64,
    /// Lowest accuracy a goal may ask to preserve. Default: **0.5**.
    pub accuracy_floor: f64,
    /// Highest accuracy a goal may demand. Default: **0.95**.
    pub max_attainable_accuracy: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            memory_ceiling_mb: 512.0,
            max_cpu_temp_c: 85.0,
            max_gpu_temp_c: 85.0,
            power_budget_w: 15.0,
            latency_floor_ms: 2.0,
            accuracy_floor: 0.5,
            max_attainable_accuracy: 0.95,
        }
    }
}

/// Differential-privacy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Epsilon spent by one training session. Default: **1.0**.
    pub session_epsilon: f64,
    /// Lifetime epsilon budget per user. Default: **50.0**.
    pub total_budget: f64,
    /// Frequency noise scale relative to the strength scale. Default: **0.1**.
    pub frequency_noise_ratio: f64,
    /// Disable only for deterministic testing. Default: **true**.
    pub noise_enabled: bool,
    /// Fixed RNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        PrivacyConfig {
            session_epsilon: 1.0,
            total_budget: 50.0,
            frequency_noise_ratio: 0.1,
            noise_enabled: true,
            seed: None,
        }
    }
}

/// How EWC importance evolves between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ImportanceMode {
    /// Recompute importance from current weights every cycle.
    Fresh,
    /// Exponential moving average across cycles, kept in memory only.
    Accumulate {
        /// Weight of the previous estimate, in `[0, 1)`.
        decay: f64,
    },
}

impl Default for ImportanceMode {
    fn default() -> Self {
        ImportanceMode::Fresh
    }
}

/// Incremental trainer hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Base step size before strength scaling. Default: **0.4**.
    pub base_learning_rate: f64,
    /// Cap on the strength-scaled step size. Default: **0.8**.
    pub max_learning_rate: f64,
    /// EWC penalty strength. Default: **1.0**.
    pub regularization_strength: f64,
    /// Update steps per full training cycle. Default: **150**.
    pub max_steps: usize,
    /// Update steps per light `update` call. Default: **10**.
    pub update_max_steps: usize,
    /// Patterns per mini-batch. Default: **8**.
    pub batch_size: usize,
    /// EWC importance evolution. Default: **fresh**.
    pub importance_mode: ImportanceMode,
    /// Seed for default weight initialization. Default: **42**.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            base_learning_rate: 0.4,
            max_learning_rate: 0.8,
            regularization_strength: 1.0,
            max_steps: 150,
            update_max_steps: 10,
            batch_size: 8,
            importance_mode: ImportanceMode::Fresh,
            seed: 42,
        }
    }
}

/// Convergence classifier thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Gradient norm below which a cycle is converged. Default: **1e-3**.
    pub threshold: f64,
    /// Growth factor over the previous score that counts as divergence. Default: **1.1**.
    pub divergence_ratio: f64,
    /// Iterations without convergence before a user is stalled. Default: **100**.
    pub stall_cap: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig { threshold: 1e-3, divergence_ratio: 1.1, stall_cap: 100 }
    }
}

/// Telemetry sampler cadence and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Nominal sampling period. Default: **5000 ms**.
    pub base_interval_ms: u64,
    /// Fastest sampling period while alerting. Default: **1000 ms**.
    pub min_interval_ms: u64,
    /// Slowest sampling period while idle. Default: **10000 ms**.
    pub max_interval_ms: u64,
    /// Snapshots kept in the ring. Default: **100**.
    pub ring_capacity: usize,
    /// Fraction of max temperature that raises a thermal alert. Default: **0.9**.
    pub thermal_alert_ratio: f64,
    /// Memory pressure above which an alert is raised. Default: **0.8**.
    pub memory_alert_pressure: f64,
    /// Alert channel capacity. Default: **64**.
    pub alert_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            base_interval_ms: 5_000,
            min_interval_ms: 1_000,
            max_interval_ms: 10_000,
            ring_capacity: 100,
            thermal_alert_ratio: 0.9,
            memory_alert_pressure: 0.8,
            alert_capacity: 64,
        }
    }
}

impl TelemetryConfig {
    /// Nominal sampling period as a [`Duration`].
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

/// Optimization controller policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// CPU temperature ratio that triggers a cooldown between techniques. Default: **0.8**.
    pub cooldown_ratio: f64,
    /// Cooldown pause length. Default: **250 ms**.
    pub cooldown_ms: u64,
    /// Memory pressure that switches to aggressive technique variants. Default: **0.85**.
    pub aggressive_pressure: f64,
    /// CPU temperature ratio that switches to aggressive variants. Default: **0.9**.
    pub aggressive_thermal_ratio: f64,
    /// Memory pressure that is a hard safety violation. Default: **0.95**.
    pub hard_pressure: f64,
    /// Fraction of the power budget treated as "near budget". Default: **0.9**.
    pub power_margin: f64,
    /// GPU utilization treated as saturation. Default: **0.9**.
    pub gpu_saturation: f64,
    /// Result cache lifetime. Default: **300 s**.
    pub cache_ttl_secs: u64,
    /// Result cache capacity. Default: **256**.
    pub cache_capacity: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            cooldown_ratio: 0.8,
            cooldown_ms: 250,
            aggressive_pressure: 0.85,
            aggressive_thermal_ratio: 0.9,
            hard_pressure: 0.95,
            power_margin: 0.9,
            gpu_saturation: 0.9,
            cache_ttl_secs: 300,
            cache_capacity: 256,
        }
    }
}

/// Lifecycle event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast channel capacity. Default: **256**.
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig { capacity: 256 }
    }
}

// ---------------------------------------------------------------------------
// Loading / validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a JSON file at `path`.
    ///
    /// Missing sections and fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and
    /// [`ConfigError::InvalidValue`] if a value fails validation.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: EngineConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.platform;
        positive("platform.memory_ceiling_mb", p.memory_ceiling_mb)?;
        positive("platform.max_cpu_temp_c", p.max_cpu_temp_c)?;
        positive("platform.max_gpu_temp_c", p.max_gpu_temp_c)?;
        positive("platform.power_budget_w", p.power_budget_w)?;
        positive("platform.latency_floor_ms", p.latency_floor_ms)?;
        if !(p.max_attainable_accuracy > 0.0 && p.max_attainable_accuracy <= 1.0) {
            return Err(ConfigError::invalid_value(
                "platform.max_attainable_accuracy",
                "must be in (0, 1]",
            ));
        }
        if !(p.accuracy_floor >= 0.0 && p.accuracy_floor < p.max_attainable_accuracy) {
            return Err(ConfigError::invalid_value(
                "platform.accuracy_floor",
                format!("must be in [0, {})", p.max_attainable_accuracy),
            ));
        }

        let pr = &self.privacy;
        positive("privacy.session_epsilon", pr.session_epsilon)?;
        if pr.total_budget < pr.session_epsilon {
            return Err(ConfigError::invalid_value(
                "privacy.total_budget",
                "must cover at least one session",
            ));
        }
        if !(pr.frequency_noise_ratio >= 0.0 && pr.frequency_noise_ratio <= 1.0) {
            return Err(ConfigError::invalid_value("privacy.frequency_noise_ratio", "must be in [0, 1]"));
        }

        let t = &self.trainer;
        positive("trainer.base_learning_rate", t.base_learning_rate)?;
        if !(t.max_learning_rate >= t.base_learning_rate && t.max_learning_rate <= 1.0) {
            return Err(ConfigError::invalid_value(
                "trainer.max_learning_rate",
                "must be in [base_learning_rate, 1]",
            ));
        }
        if !(t.regularization_strength >= 0.0 && t.regularization_strength.is_finite()) {
            return Err(ConfigError::invalid_value("trainer.regularization_strength", "must be >= 0"));
        }
        if t.max_steps == 0 {
            return Err(ConfigError::invalid_value("trainer.max_steps", "must be > 0"));
        }
        if t.update_max_steps == 0 {
            return Err(ConfigError::invalid_value("trainer.update_max_steps", "must be > 0"));
        }
        if t.batch_size == 0 {
            return Err(ConfigError::invalid_value("trainer.batch_size", "must be > 0"));
        }
        if let ImportanceMode::Accumulate { decay } = t.importance_mode {
            if !(0.0..1.0).contains(&decay) {
                return Err(ConfigError::invalid_value("trainer.importance_mode.decay", "must be in [0, 1)"));
            }
        }

        let c = &self.convergence;
        positive("convergence.threshold", c.threshold)?;
        if c.divergence_ratio <= 1.0 {
            return Err(ConfigError::invalid_value("convergence.divergence_ratio", "must be > 1"));
        }
        if c.stall_cap == 0 {
            return Err(ConfigError::invalid_value("convergence.stall_cap", "must be > 0"));
        }

        let tm = &self.telemetry;
        if tm.min_interval_ms < 1_000 || tm.max_interval_ms > 10_000 {
            return Err(ConfigError::invalid_value(
                "telemetry.*_interval_ms",
                "sampling period must stay within [1000, 10000] ms",
            ));
        }
        if !(tm.min_interval_ms <= tm.base_interval_ms && tm.base_interval_ms <= tm.max_interval_ms) {
            return Err(ConfigError::invalid_value(
                "telemetry.base_interval_ms",
                "must lie between min_interval_ms and max_interval_ms",
            ));
        }
        if tm.ring_capacity == 0 {
            return Err(ConfigError::invalid_value("telemetry.ring_capacity", "must be > 0"));
        }
        if tm.alert_capacity == 0 {
            return Err(ConfigError::invalid_value("telemetry.alert_capacity", "must be > 0"));
        }
        ratio("telemetry.thermal_alert_ratio", tm.thermal_alert_ratio)?;
        ratio("telemetry.memory_alert_pressure", tm.memory_alert_pressure)?;

        let o = &self.optimizer;
        ratio("optimizer.cooldown_ratio", o.cooldown_ratio)?;
        ratio("optimizer.aggressive_pressure", o.aggressive_pressure)?;
        ratio("optimizer.aggressive_thermal_ratio", o.aggressive_thermal_ratio)?;
        ratio("optimizer.hard_pressure", o.hard_pressure)?;
        ratio("optimizer.power_margin", o.power_margin)?;
        ratio("optimizer.gpu_saturation", o.gpu_saturation)?;
        if o.cache_capacity == 0 {
            return Err(ConfigError::invalid_value("optimizer.cache_capacity", "must be > 0"));
        }

        if self.events.capacity == 0 {
            return Err(ConfigError::invalid_value("events.capacity", "must be > 0"));
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be > 0, got {value}")))
    }
}

fn ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be in (0, 1], got {value}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
