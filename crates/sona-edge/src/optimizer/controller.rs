//! Hardware-aware optimization controller.
//!
//! One run checks the safety gate, consults the result cache, clamps the
//! caller's goals to the platform envelope, selects a technique strategy and
//! then executes techniques one at a time, re-sampling hardware at every
//! boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cache::OptimizationCache;
use super::estimator::{PerformanceEstimate, PerformanceEstimator};
use super::goals::{clamp_goals, EffectiveGoals, OptimizationGoals};
use super::strategy::{select_strategy, OptimizationStrategy};
use super::techniques::Technique;
use crate::config::{OptimizerConfig, PlatformConfig, TelemetryConfig};
use crate::domain::ModelWeights;
use crate::error::{AdaptError, AdaptResult};
use crate::privacy::user_tag;
use crate::telemetry::{HardwareDelta, HardwareProbe, HardwareSnapshot, SafetyGate};

/// What happened to one planned technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Applied and kept.
    Applied,
    /// Applied, then rolled back because it broke the accuracy floor or the
    /// memory ceiling.
    Reverted,
    /// Not applied: the same technique already ran in this run.
    Skipped,
}

/// Per-technique log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub technique: Technique,
    /// Planned technique when an aggressive variant was substituted.
    pub substituted_for: Option<Technique>,
    pub outcome: StepOutcome,
    pub size_before_mb: f64,
    pub size_after_mb: f64,
    pub latency_before_ms: f64,
    pub latency_after_ms: f64,
    pub accuracy_before: f64,
    pub accuracy_after: f64,
    /// CPU temperature sampled at the start of the step.
    pub cpu_temp_c: f64,
    /// Whether a cooldown pause followed the step.
    pub cooled_down: bool,
}

/// Report of one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Pseudonymous user tag.
    pub user_tag: String,
    pub size_before_mb: f64,
    pub size_after_mb: f64,
    /// Latency improvement relative to the baseline, percent.
    pub performance_improvement_pct: f64,
    pub memory_reduction_mb: f64,
    pub accuracy_before: f64,
    pub accuracy_after: f64,
    pub latency_before_ms: f64,
    pub latency_after_ms: f64,
    pub execution_time_ms: u64,
    /// Hardware change over the run (`post − pre`).
    pub hardware_impact: HardwareDelta,
    pub strategy: OptimizationStrategy,
    pub steps: Vec<StepRecord>,
    pub effective_goals: EffectiveGoals,
    /// Some caller target was outside the platform envelope.
    pub goals_clamped: bool,
    /// The final estimate meets every effective goal.
    pub goals_met: bool,
    /// Reason remaining techniques were abandoned, for partial results.
    pub aborted: Option<String>,
    pub from_cache: bool,
    /// Number of techniques applied and kept.
    pub techniques_executed: usize,
    pub completed_at: DateTime<Utc>,
}

impl OptimizationResult {
    /// True when every planned technique was attempted.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Result plus the optimized model, when anything changed.
#[derive(Debug, Clone)]
pub struct OptimizationRun {
    pub result: OptimizationResult,
    /// `None` for cache hits and runs that kept no technique.
    pub weights: Option<ModelWeights>,
}

/// Optimization controller.
pub struct OptimizationController {
    platform: PlatformConfig,
    telemetry: TelemetryConfig,
    config: OptimizerConfig,
    gate: SafetyGate,
    estimator: PerformanceEstimator,
    cache: OptimizationCache,
    probe: Arc<dyn HardwareProbe>,
}

impl OptimizationController {
    /// Create a controller that re-samples hardware through `probe`.
    pub fn new(
        platform: PlatformConfig,
        telemetry: TelemetryConfig,
        config: OptimizerConfig,
        probe: Arc<dyn HardwareProbe>,
    ) -> Self {
        Self {
            gate: SafetyGate::new(&platform, &config),
            cache: OptimizationCache::new(Duration::from_secs(config.cache_ttl_secs), config.cache_capacity),
            estimator: PerformanceEstimator,
            platform,
            telemetry,
            config,
            probe,
        }
    }

    /// Optimize `weights` for `goals` on hardware currently in `snapshot`.
    ///
    /// Fails with [`AdaptError::HardwareConstrained`] before any technique
    /// runs when `snapshot` already breaks a hard threshold. A breach during
    /// execution is not an error: the run stops and the partial result is
    /// returned with `aborted` set.
    pub async fn optimize(
        &self,
        user_id: &str,
        weights: &ModelWeights,
        base_accuracy: f64,
        goals: &OptimizationGoals,
        snapshot: &HardwareSnapshot,
    ) -> AdaptResult<OptimizationRun> {
        let tag = user_tag(user_id);
        // Checked before the cache: a hot device never gets a cached answer.
        if let Some(violation) = self.gate.check(snapshot) {
            tracing::warn!(user = %tag, %violation, "Optimization refused by safety gate");
            return Err(AdaptError::hardware_constrained(violation.to_string(), snapshot));
        }

        let fingerprint = goals.fingerprint();
        if let Some(mut cached) = self.cache.get(&tag, &fingerprint) {
            tracing::debug!(user = %tag, goals = %fingerprint, "Optimization cache hit");
            cached.from_cache = true;
            return Ok(OptimizationRun { result: cached, weights: None });
        }

        let started = Instant::now();
        let baseline = self.estimator.estimate(weights, snapshot, base_accuracy);
        let effective = clamp_goals(goals, snapshot, &baseline, &self.platform, &self.telemetry, &self.config);
        let strategy = select_strategy(&effective, &baseline, snapshot, &self.platform, &self.telemetry, &self.config);

        tracing::info!(
            user = %tag,
            priority = %strategy.priority,
            techniques = strategy.techniques.len(),
            clamped = effective.clamped,
            "Starting optimization"
        );

        let mut current = weights.clone();
        let mut steps = Vec::with_capacity(strategy.techniques.len());
        let mut aborted = None;
        let mut post = snapshot.clone();
        let cooldown_at = self.platform.max_cpu_temp_c * self.config.cooldown_ratio;

        for (idx, planned) in strategy.techniques.iter().copied().enumerate() {
            let live = self.probe.sample().await?;
            post = live.clone();
            if let Some(violation) = self.gate.check(&live) {
                tracing::warn!(user = %tag, %violation, remaining = strategy.techniques.len() - idx, "Aborting optimization");
                aborted = Some(violation.to_string());
                break;
            }

            let technique = self.substitute(planned, &live);
            let mut record = self.run_step(&mut current, technique, &steps, &live, base_accuracy, &effective);
            if technique != planned {
                record.substituted_for = Some(planned);
            }

            let more = idx + 1 < strategy.techniques.len();
            if more && live.cpu_temp_c >= cooldown_at {
                tracing::debug!(user = %tag, cpu_temp = live.cpu_temp_c, "Cooling down between techniques");
                tokio::time::sleep(Duration::from_millis(self.config.cooldown_ms)).await;
                record.cooled_down = true;
            }
            steps.push(record);
        }

        if aborted.is_none() && !strategy.techniques.is_empty() {
            post = self.probe.sample().await?;
        }

        let after = self.estimator.estimate(&current, snapshot, base_accuracy);
        let techniques_executed = steps.iter().filter(|s| s.outcome == StepOutcome::Applied).count();
        let result = self.assemble(
            &tag,
            weights,
            &current,
            &baseline,
            &after,
            started,
            snapshot.delta_to(&post),
            strategy,
            steps,
            effective,
            aborted,
            techniques_executed,
        );

        tracing::info!(
            user = %tag,
            executed = techniques_executed,
            improvement_pct = result.performance_improvement_pct,
            memory_reduction_mb = result.memory_reduction_mb,
            goals_met = result.goals_met,
            aborted = result.aborted.is_some(),
            "Optimization finished"
        );

        if result.is_complete() {
            self.cache.insert(&tag, &fingerprint, result.clone());
        }

        let weights = if techniques_executed > 0 {
            current.version += 1;
            current.updated_at = Utc::now();
            Some(current)
        } else {
            None
        };
        Ok(OptimizationRun { result, weights })
    }

    /// Aggressive variant when hardware has worsened past the internal
    /// thresholds.
    fn substitute(&self, planned: Technique, live: &HardwareSnapshot) -> Technique {
        let stressed = live.memory_pressure > self.config.aggressive_pressure
            || live.cpu_temp_c >= self.platform.max_cpu_temp_c * self.config.aggressive_thermal_ratio;
        match planned.aggressive_variant() {
            Some(aggressive) if stressed => aggressive,
            _ => planned,
        }
    }

    fn run_step(
        &self,
        current: &mut ModelWeights,
        technique: Technique,
        done: &[StepRecord],
        live: &HardwareSnapshot,
        base_accuracy: f64,
        goals: &EffectiveGoals,
    ) -> StepRecord {
        let before = self.estimator.estimate(current, live, base_accuracy);
        let mut record = StepRecord {
            technique,
            substituted_for: None,
            outcome: StepOutcome::Skipped,
            size_before_mb: current.memory_footprint_mb(),
            size_after_mb: current.memory_footprint_mb(),
            latency_before_ms: before.latency_ms,
            latency_after_ms: before.latency_ms,
            accuracy_before: before.accuracy,
            accuracy_after: before.accuracy,
            cpu_temp_c: live.cpu_temp_c,
            cooled_down: false,
        };
        if done.iter().any(|s| s.technique == technique && s.outcome != StepOutcome::Skipped) {
            return record;
        }

        let mut candidate = current.clone();
        technique.apply(&mut candidate);
        let after = self.estimator.estimate(&candidate, live, base_accuracy);
        let size_after = candidate.memory_footprint_mb();

        let breaks_accuracy = after.accuracy < before.accuracy && after.accuracy < goals.min_accuracy;
        let breaks_ceiling = size_after > self.platform.memory_ceiling_mb;
        record.size_after_mb = size_after;
        record.latency_after_ms = after.latency_ms;
        record.accuracy_after = after.accuracy;
        if breaks_accuracy || breaks_ceiling {
            tracing::debug!(%technique, accuracy = after.accuracy, size_mb = size_after, "Technique reverted");
            record.outcome = StepOutcome::Reverted;
        } else {
            tracing::debug!(%technique, latency_ms = after.latency_ms, size_mb = size_after, "Technique applied");
            record.outcome = StepOutcome::Applied;
            *current = candidate;
        }
        record
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        tag: &str,
        original: &ModelWeights,
        optimized: &ModelWeights,
        baseline: &PerformanceEstimate,
        after: &PerformanceEstimate,
        started: Instant,
        hardware_impact: HardwareDelta,
        strategy: OptimizationStrategy,
        steps: Vec<StepRecord>,
        effective: EffectiveGoals,
        aborted: Option<String>,
        techniques_executed: usize,
    ) -> OptimizationResult {
        let size_before_mb = original.memory_footprint_mb();
        let size_after_mb = optimized.memory_footprint_mb();
        let performance_improvement_pct = if baseline.latency_ms > 0.0 {
            (baseline.latency_ms - after.latency_ms) / baseline.latency_ms * 100.0
        } else {
            0.0
        };
        let goals_met = after.latency_ms <= effective.max_latency_ms
            && after.memory_mb <= effective.max_memory_mb
            && after.accuracy >= effective.min_accuracy;

        OptimizationResult {
            user_tag: tag.to_string(),
            size_before_mb,
            size_after_mb,
            performance_improvement_pct,
            memory_reduction_mb: size_before_mb - size_after_mb,
            accuracy_before: baseline.accuracy,
            accuracy_after: after.accuracy,
            latency_before_ms: baseline.latency_ms,
            latency_after_ms: after.latency_ms,
            execution_time_ms: started.elapsed().as_millis() as u64,
            hardware_impact,
            strategy,
            steps,
            goals_clamped: effective.clamped,
            goals_met,
            effective_goals: effective,
            aborted,
            from_cache: false,
            techniques_executed,
            completed_at: Utc::now(),
        }
    }

    /// Drop cached results for a user whose model changed.
    pub fn invalidate(&self, user_id: &str) {
        self.cache.invalidate_user(&user_tag(user_id));
    }

    pub fn cache(&self) -> &OptimizationCache {
        &self.cache
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn estimator(&self) -> &PerformanceEstimator {
        &self.estimator
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telemetry::{HardwareSampler, ScriptedSource};

    pub(crate) fn sample_result(tag: &str) -> OptimizationResult {
        let strategy = select_strategy(
            &EffectiveGoals {
                max_latency_ms: 10.0,
                max_memory_mb: 10.0,
                min_accuracy: 0.5,
                energy_efficient: false,
                clamped: false,
                adjustments: Vec::new(),
            },
            &PerformanceEstimate { latency_ms: 1.0, memory_mb: 1.0, accuracy: 0.9 },
            &HardwareSnapshot::nominal(),
            &PlatformConfig::default(),
            &TelemetryConfig::default(),
            &OptimizerConfig::default(),
        );
        OptimizationResult {
            user_tag: tag.to_string(),
            size_before_mb: 1.0,
            size_after_mb: 1.0,
            performance_improvement_pct: 0.0,
            memory_reduction_mb: 0.0,
            accuracy_before: 0.9,
            accuracy_after: 0.9,
            latency_before_ms: 1.0,
            latency_after_ms: 1.0,
            execution_time_ms: 0,
            hardware_impact: HardwareDelta::default(),
            effective_goals: EffectiveGoals {
                max_latency_ms: 10.0,
                max_memory_mb: 10.0,
                min_accuracy: 0.5,
                energy_efficient: false,
                clamped: false,
                adjustments: Vec::new(),
            },
            strategy,
            steps: Vec::new(),
            goals_clamped: false,
            goals_met: true,
            aborted: None,
            from_cache: false,
            techniques_executed: 0,
            completed_at: Utc::now(),
        }
    }

    fn controller(source: Arc<ScriptedSource>) -> OptimizationController {
        let platform = PlatformConfig::default();
        let telemetry = TelemetryConfig::default();
        let probe = Arc::new(HardwareSampler::new(telemetry.clone(), &platform, source));
        OptimizationController::new(platform, telemetry, OptimizerConfig::default(), probe)
    }

    fn latency_goals() -> OptimizationGoals {
        OptimizationGoals { max_latency_ms: Some(2.0), ..Default::default() }
    }

    #[tokio::test]
    async fn hot_snapshot_refused_without_sampling() {
        let src = Arc::new(ScriptedSource::nominal());
        let c = controller(src.clone());
        let mut hot = HardwareSnapshot::nominal();
        hot.cpu_temp_c = 85.0;

        let err = c
            .optimize("alice", &ModelWeights::default_architecture(1), 0.8, &latency_goals(), &hot)
            .await
            .unwrap_err();
        assert!(matches!(err, AdaptError::HardwareConstrained { .. }));
        assert!(err.is_retryable());
        assert_eq!(src.reads(), 0);
    }

    #[tokio::test]
    async fn latency_goal_prunes_and_quantizes() {
        let src = Arc::new(ScriptedSource::nominal());
        let c = controller(src.clone());
        let w = ModelWeights::default_architecture(1);

        let run = c.optimize("alice", &w, 0.8, &latency_goals(), &HardwareSnapshot::nominal()).await.unwrap();
        let r = &run.result;
        assert!(r.is_complete());
        assert!(r.techniques_executed >= 2);
        assert!(r.latency_after_ms < r.latency_before_ms);
        assert!(r.size_after_mb < r.size_before_mb);
        assert!(r.performance_improvement_pct > 0.0);
        // One probe read per technique plus the closing sample.
        assert_eq!(src.reads() as usize, r.strategy.techniques.len() + 1);

        let optimized = run.weights.unwrap();
        assert_eq!(optimized.version, w.version + 1);
    }

    #[tokio::test]
    async fn lossy_steps_reverted_below_accuracy_floor() {
        let c = controller(Arc::new(ScriptedSource::nominal()));
        let run = c
            .optimize("bob", &ModelWeights::default_architecture(1), 0.5, &latency_goals(), &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let pruning = run.result.steps.iter().find(|s| s.technique == Technique::Pruning).unwrap();
        assert_eq!(pruning.outcome, StepOutcome::Reverted);
        let quantization = run.result.steps.iter().find(|s| s.technique == Technique::Quantization).unwrap();
        assert_eq!(quantization.outcome, StepOutcome::Reverted);
        assert_eq!(run.result.accuracy_after, run.result.accuracy_before);
    }

    #[tokio::test]
    async fn latency_goal_on_fresh_model_skips_accuracy_techniques() {
        let c = controller(Arc::new(ScriptedSource::nominal()));
        let run = c
            .optimize("bob", &ModelWeights::default_architecture(1), 0.5, &latency_goals(), &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let strategy = &run.result.strategy;
        assert_eq!(strategy.gaps.accuracy, 0.0);
        for accuracy_technique in [Technique::Ensembling, Technique::DataAugmentation, Technique::HyperparameterTuning] {
            assert!(!strategy.techniques.contains(&accuracy_technique), "{accuracy_technique} selected");
        }
    }

    #[tokio::test]
    async fn cached_result_not_served_to_hot_device() {
        let src = Arc::new(ScriptedSource::nominal());
        let c = controller(src.clone());
        let w = ModelWeights::default_architecture(1);
        c.optimize("erin", &w, 0.8, &latency_goals(), &HardwareSnapshot::nominal()).await.unwrap();
        assert_eq!(c.cache().len(), 1);
        let reads = src.reads();

        let mut hot = HardwareSnapshot::nominal();
        hot.cpu_temp_c = 95.0;
        let err = c.optimize("erin", &w, 0.8, &latency_goals(), &hot).await.unwrap_err();
        assert!(matches!(err, AdaptError::HardwareConstrained { .. }));
        assert_eq!(src.reads(), reads);

        // Cooled down again, the cached entry is still there.
        let again = c.optimize("erin", &w, 0.8, &latency_goals(), &HardwareSnapshot::nominal()).await.unwrap();
        assert!(again.result.from_cache);
    }

    #[tokio::test]
    async fn mid_run_breach_returns_partial_result() {
        let src = Arc::new(ScriptedSource::nominal());
        let c = controller(src.clone());
        let mut hot = HardwareSnapshot::nominal();
        hot.power_w = 20.0;
        src.push(HardwareSnapshot::nominal());
        src.push(hot);

        let run = c
            .optimize("carol", &ModelWeights::default_architecture(1), 0.8, &latency_goals(), &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let r = &run.result;
        assert!(r.aborted.as_deref().unwrap_or_default().contains("power"));
        assert_eq!(r.steps.len(), 1);
        assert!(r.hardware_impact.power_w > 0.0);
        // Partial results are not cached.
        assert!(c.cache().is_empty());
    }

    #[tokio::test]
    async fn pressure_substitutes_aggressive_variant() {
        let src = Arc::new(ScriptedSource::nominal());
        src.update(|s| s.memory_pressure = 0.9);
        let c = controller(src);

        let run = c
            .optimize("dave", &ModelWeights::default_architecture(1), 0.8, &latency_goals(), &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let step = run.result.steps.iter().find(|s| s.substituted_for == Some(Technique::Pruning)).unwrap();
        assert_eq!(step.technique, Technique::AggressivePruning);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_cpu_inserts_cooldowns() {
        let src = Arc::new(ScriptedSource::nominal());
        src.update(|s| s.cpu_temp_c = 70.0);
        let c = controller(src);

        let run = c
            .optimize("erin", &ModelWeights::default_architecture(1), 0.8, &latency_goals(), &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let steps = &run.result.steps;
        assert!(steps.len() >= 2);
        assert!(steps[..steps.len() - 1].iter().all(|s| s.cooled_down));
        assert!(!steps[steps.len() - 1].cooled_down);
    }

    #[tokio::test]
    async fn second_call_hits_cache_until_invalidated() {
        let src = Arc::new(ScriptedSource::nominal());
        let c = controller(src.clone());
        let w = ModelWeights::default_architecture(1);
        let snap = HardwareSnapshot::nominal();

        c.optimize("frank", &w, 0.8, &latency_goals(), &snap).await.unwrap();
        let reads = src.reads();
        let cached = c.optimize("frank", &w, 0.8, &latency_goals(), &snap).await.unwrap();
        assert!(cached.result.from_cache);
        assert!(cached.weights.is_none());
        assert_eq!(src.reads(), reads);

        c.invalidate("frank");
        let fresh = c.optimize("frank", &w, 0.8, &latency_goals(), &snap).await.unwrap();
        assert!(!fresh.result.from_cache);
    }

    #[tokio::test]
    async fn unreachable_accuracy_is_clamped_not_refused() {
        let c = controller(Arc::new(ScriptedSource::nominal()));
        let goals = OptimizationGoals { min_accuracy: Some(0.99), ..Default::default() };
        let run = c
            .optimize("gina", &ModelWeights::default_architecture(1), 0.5, &goals, &HardwareSnapshot::nominal())
            .await
            .unwrap();
        let r = &run.result;
        assert!(r.goals_clamped);
        assert_eq!(r.effective_goals.min_accuracy, 0.95);
        assert!(r.strategy.techniques.contains(&Technique::Ensembling));
        assert!(!r.goals_met);
        assert!(r.accuracy_after > r.accuracy_before);
    }
}
