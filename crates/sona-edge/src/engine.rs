//! Adaptive learning engine.
//!
//! Single entry point that sequences privacy, training, convergence and
//! optimization for every user, owns the telemetry lifecycle and applies the
//! fallback policy.
//!
//! Writes for one user are serialized through a per-user async mutex.
//! Different users never wait on each other.
//!
//! ```ignore
//! let engine = Arc::new(AdaptiveLearningEngine::new(config, store, source));
//! engine.initialize().await?;
//! let outcome = engine.train("user-1", &patterns).await?;
//! engine.shutdown().await;
//! ```

use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::convergence::ConvergenceClassifier;
use crate::domain::{validate_patterns, CycleSummary, IdentifiedPattern, ModelMetrics, ModelWeights};
use crate::error::{AdaptError, AdaptResult};
use crate::events::{EngineEvent, EventBus, Operation, Phase};
use crate::optimizer::{OptimizationController, OptimizationGoals, OptimizationResult};
use crate::privacy::{user_tag, DifferentialPrivacySanitizer, PrivacyAccountant};
use crate::session::FederatedSession;
use crate::store::WeightStore;
use crate::telemetry::{HardwareAlert, HardwareSampler, HardwareSnapshot, HardwareSource};
use crate::trainer::{IncrementalTrainer, TrainingReport};

/// Reactive jobs waiting for the worker.
const JOB_QUEUE_CAPACITY: usize = 16;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Initialized,
    ShutDown,
}

/// Result of [`AdaptiveLearningEngine::train`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub success: bool,
    pub session_id: Uuid,
    pub user_tag: String,
    pub report: TrainingReport,
    pub metrics: ModelMetrics,
    /// Laplace scale applied to strengths.
    pub noise_scale: f64,
    /// Epsilon left in the user's budget.
    pub remaining_budget: f64,
}

/// Result of [`AdaptiveLearningEngine::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    /// A new model version was persisted.
    pub applied: bool,
    /// Version of the stored model after the call, when known.
    pub model_version: Option<u64>,
    pub report: Option<TrainingReport>,
    pub metrics: ModelMetrics,
    pub fallback: bool,
    /// Scrubbed failure reason for fallback results.
    pub reason: Option<String>,
}

/// Result of [`AdaptiveLearningEngine::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub user_tag: String,
    pub valid: bool,
    pub has_model: bool,
    pub issues: Vec<String>,
    pub memory_footprint_mb: f64,
    pub model_version: Option<u64>,
    pub metrics: ModelMetrics,
    pub fallback: bool,
    pub reason: Option<String>,
}

/// Result of [`AdaptiveLearningEngine::optimize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub result: Option<OptimizationResult>,
    /// Optimized weights replaced the stored model.
    pub weights_persisted: bool,
    pub model_version: Option<u64>,
    pub metrics: ModelMetrics,
    pub fallback: bool,
    pub reason: Option<String>,
}

/// Work queued by the alert reactor.
#[derive(Debug, Clone, Copy)]
enum ReactiveJob {
    Emergency,
    MemoryFocused,
}

#[derive(Default)]
struct BackgroundTasks {
    shutdown: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

/// Adaptive learning engine.
pub struct AdaptiveLearningEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    store: Arc<dyn WeightStore>,
    sanitizer: DifferentialPrivacySanitizer,
    accountant: PrivacyAccountant,
    trainer: IncrementalTrainer,
    sampler: Arc<HardwareSampler>,
    controller: OptimizationController,
    events: EventBus,
    metrics: DashMap<String, ModelMetrics>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active_users: DashSet<String>,
    tasks: Mutex<BackgroundTasks>,
}

impl AdaptiveLearningEngine {
    /// Build every component from `config`. Nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(config: EngineConfig, store: Arc<dyn WeightStore>, source: Arc<dyn HardwareSource>) -> Self {
        let sampler = Arc::new(HardwareSampler::new(config.telemetry.clone(), &config.platform, source));
        let classifier = ConvergenceClassifier::new(config.convergence.clone());
        let trainer =
            IncrementalTrainer::new(config.trainer.clone(), config.platform.clone(), Arc::clone(&store), classifier);
        let controller = OptimizationController::new(
            config.platform.clone(),
            config.telemetry.clone(),
            config.optimizer.clone(),
            sampler.clone(),
        );
        Self {
            sanitizer: DifferentialPrivacySanitizer::new(config.privacy.clone()),
            accountant: PrivacyAccountant::new(config.privacy.total_budget),
            events: EventBus::new(config.events.capacity),
            state: RwLock::new(EngineState::Created),
            metrics: DashMap::new(),
            locks: DashMap::new(),
            active_users: DashSet::new(),
            tasks: Mutex::new(BackgroundTasks::default()),
            trainer,
            controller,
            sampler,
            store,
            config,
        }
    }

    /// Validate configuration, check the store, take a first hardware sample
    /// and start the sampler and the reactive worker.
    ///
    /// Initializing twice is a no-op. A shut-down engine cannot be restarted.
    pub async fn initialize(self: &Arc<Self>) -> AdaptResult<()> {
        match self.state() {
            EngineState::Initialized => return Ok(()),
            EngineState::ShutDown => {
                return Err(AdaptError::NotInitialized("engine has been shut down".into()));
            }
            EngineState::Created => {}
        }

        self.config.validate()?;
        self.store.health_check().await?;
        let first = self.sampler.sample_now().await?;
        self.sampler.start();

        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let (reactor_stop, reactor_rx) = mpsc::channel(1);
        let (worker_stop, worker_rx) = mpsc::channel(1);

        let reactor = tokio::spawn(run_reactor(self.sampler.subscribe(), self.events.clone(), job_tx, reactor_rx));
        let worker = tokio::spawn(run_worker(Arc::downgrade(self), job_rx, worker_rx));
        {
            let mut tasks = self.tasks.lock();
            tasks.shutdown = vec![reactor_stop, worker_stop];
            tasks.handles = vec![reactor, worker];
        }

        *self.state.write() = EngineState::Initialized;
        tracing::info!(
            store = self.store.name(),
            cpu_temp = first.cpu_temp_c,
            memory_pressure = first.memory_pressure,
            "Adaptive learning engine initialized"
        );
        Ok(())
    }

    /// Stop the sampler and the reactive worker.
    pub async fn shutdown(&self) {
        if self.state() != EngineState::Initialized {
            *self.state.write() = EngineState::ShutDown;
            return;
        }
        *self.state.write() = EngineState::ShutDown;

        self.sampler.stop().await;
        let BackgroundTasks { shutdown, handles } = std::mem::take(&mut *self.tasks.lock());
        for tx in shutdown {
            let _ = tx.send(()).await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Adaptive learning engine shut down");
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn ensure_ready(&self) -> AdaptResult<()> {
        match self.state() {
            EngineState::Initialized => Ok(()),
            EngineState::Created => Err(AdaptError::NotInitialized("call initialize() first".into())),
            EngineState::ShutDown => Err(AdaptError::NotInitialized("engine has been shut down".into())),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(user_id.to_string()).or_default().clone()
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    /// Full training cycle. Errors always reach the caller.
    pub async fn train(&self, user_id: &str, patterns: &[IdentifiedPattern]) -> AdaptResult<TrainingOutcome> {
        self.ensure_ready()?;
        let tag = user_tag(user_id);
        self.emit(Operation::Train, Phase::Started, &tag, json!({ "patterns": patterns.len() }));

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        match self.run_training(user_id, patterns, self.config.trainer.max_steps).await {
            Ok(outcome) => {
                self.emit(
                    Operation::Train,
                    Phase::Completed,
                    &tag,
                    json!({
                        "status": outcome.report.status,
                        "steps": outcome.report.steps,
                        "accuracy_improvement": outcome.report.metrics.accuracy_improvement,
                    }),
                );
                Ok(outcome)
            }
            Err(e) => {
                self.emit_failure(Operation::Train, user_id, &e);
                Err(e)
            }
        }
    }

    /// Light incremental adaptation. Unclassified failures degrade to a
    /// fallback result that leaves the stored model untouched.
    pub async fn update(&self, user_id: &str, patterns: &[IdentifiedPattern]) -> AdaptResult<ModelUpdate> {
        self.ensure_ready()?;
        let tag = user_tag(user_id);
        self.emit(Operation::Update, Phase::Started, &tag, json!({ "patterns": patterns.len() }));

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        match self.run_training(user_id, patterns, self.config.trainer.update_max_steps).await {
            Ok(outcome) => {
                self.emit(
                    Operation::Update,
                    Phase::Completed,
                    &tag,
                    json!({ "status": outcome.report.status, "version": outcome.report.version }),
                );
                Ok(ModelUpdate {
                    applied: outcome.report.weights_updated,
                    model_version: Some(outcome.report.version),
                    report: Some(outcome.report),
                    metrics: outcome.metrics,
                    fallback: false,
                    reason: None,
                })
            }
            Err(e) => {
                self.emit_failure(Operation::Update, user_id, &e);
                if !e.is_unclassified() {
                    return Err(e);
                }
                let reason = self.sanitizer.scrub(&e.to_string(), user_id);
                tracing::warn!(user = %tag, reason = %reason, "Update degraded to fallback");
                Ok(ModelUpdate {
                    applied: false,
                    model_version: None,
                    report: None,
                    metrics: ModelMetrics::fallback(),
                    fallback: true,
                    reason: Some(reason),
                })
            }
        }
    }

    async fn run_training(
        &self,
        user_id: &str,
        patterns: &[IdentifiedPattern],
        max_steps: usize,
    ) -> AdaptResult<TrainingOutcome> {
        validate_patterns(patterns)?;
        let session = FederatedSession::open(user_id, &self.config.trainer, &self.config.privacy, &self.accountant)?;
        self.active_users.insert(user_id.to_string());

        let batch = self.sanitizer.sanitize(patterns, user_id, session.privacy_params.epsilon);
        let report = self.trainer.train(&session, &batch.patterns, max_steps).await?;

        let summary = CycleSummary {
            accuracy_improvement: report.metrics.accuracy_improvement,
            confidence: report.metrics.confidence,
            consistency: report.metrics.consistency,
            status: report.status,
            memory_footprint_mb: report.memory_footprint_mb,
            precision: report.precision,
        };
        let metrics = {
            let mut entry = self.metrics.entry(user_id.to_string()).or_insert_with(ModelMetrics::neutral);
            entry.record_cycle(&summary, self.config.platform.max_attainable_accuracy);
            entry.clone()
        };
        if report.weights_updated {
            self.controller.invalidate(user_id);
        }

        Ok(TrainingOutcome {
            success: true,
            session_id: session.session_id,
            user_tag: session.user_tag.clone(),
            noise_scale: batch.strength_scale,
            remaining_budget: session.privacy_params.remaining_budget,
            report,
            metrics,
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Integrity check of the stored model plus current metrics.
    pub async fn validate(&self, user_id: &str) -> AdaptResult<ValidationReport> {
        self.ensure_ready()?;
        let tag = user_tag(user_id);
        self.emit(Operation::Validate, Phase::Started, &tag, serde_json::Value::Null);

        match self.run_validation(user_id, &tag).await {
            Ok(report) => {
                self.emit(
                    Operation::Validate,
                    Phase::Completed,
                    &tag,
                    json!({ "valid": report.valid, "issues": report.issues.len() }),
                );
                Ok(report)
            }
            Err(e) => {
                self.emit_failure(Operation::Validate, user_id, &e);
                if !e.is_unclassified() {
                    return Err(e);
                }
                let reason = self.sanitizer.scrub(&e.to_string(), user_id);
                tracing::warn!(user = %tag, reason = %reason, "Validation degraded to fallback");
                Ok(ValidationReport {
                    user_tag: tag,
                    valid: false,
                    has_model: false,
                    issues: Vec::new(),
                    memory_footprint_mb: 0.0,
                    model_version: None,
                    metrics: ModelMetrics::fallback(),
                    fallback: true,
                    reason: Some(reason),
                })
            }
        }
    }

    async fn run_validation(&self, user_id: &str, tag: &str) -> AdaptResult<ValidationReport> {
        let stored = self.store.load(user_id).await?;
        let metrics = self.current_metrics(user_id);
        let Some(weights) = stored else {
            return Ok(ValidationReport {
                user_tag: tag.to_string(),
                valid: true,
                has_model: false,
                issues: Vec::new(),
                memory_footprint_mb: 0.0,
                model_version: None,
                metrics,
                fallback: false,
                reason: None,
            });
        };

        let mut issues = weights.integrity_issues();
        let footprint = weights.memory_footprint_mb();
        if footprint > self.config.platform.memory_ceiling_mb {
            issues.push(format!(
                "footprint {footprint:.3}MB exceeds ceiling {:.1}MB",
                self.config.platform.memory_ceiling_mb
            ));
        }
        Ok(ValidationReport {
            user_tag: tag.to_string(),
            valid: issues.is_empty(),
            has_model: true,
            issues,
            memory_footprint_mb: footprint,
            model_version: Some(weights.version),
            metrics,
            fallback: false,
            reason: None,
        })
    }

    // -----------------------------------------------------------------------
    // Optimization
    // -----------------------------------------------------------------------

    /// Hardware-aware optimization of the user's stored model.
    ///
    /// Hardware, resource, validation and privacy errors reach the caller;
    /// anything else degrades to a fallback result.
    pub async fn optimize(&self, user_id: &str, goals: &OptimizationGoals) -> AdaptResult<OptimizationOutcome> {
        self.ensure_ready()?;
        let tag = user_tag(user_id);
        self.emit(Operation::Optimize, Phase::Started, &tag, json!({ "goals": goals }));

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        match self.run_optimization(user_id, goals).await {
            Ok(outcome) => {
                let payload = match &outcome.result {
                    Some(r) => json!({
                        "techniques_executed": r.techniques_executed,
                        "improvement_pct": r.performance_improvement_pct,
                        "goals_met": r.goals_met,
                        "aborted": r.aborted,
                        "from_cache": r.from_cache,
                    }),
                    None => serde_json::Value::Null,
                };
                self.emit(Operation::Optimize, Phase::Completed, &tag, payload);
                Ok(outcome)
            }
            Err(e) => {
                self.emit_failure(Operation::Optimize, user_id, &e);
                if !e.is_unclassified() {
                    return Err(e);
                }
                let reason = self.sanitizer.scrub(&e.to_string(), user_id);
                tracing::warn!(user = %tag, reason = %reason, "Optimization degraded to fallback");
                Ok(OptimizationOutcome {
                    result: None,
                    weights_persisted: false,
                    model_version: None,
                    metrics: ModelMetrics::fallback(),
                    fallback: true,
                    reason: Some(reason),
                })
            }
        }
    }

    async fn run_optimization(&self, user_id: &str, goals: &OptimizationGoals) -> AdaptResult<OptimizationOutcome> {
        self.active_users.insert(user_id.to_string());
        let weights = match self.store.load(user_id).await? {
            Some(w) => w,
            None => ModelWeights::default_architecture(self.config.trainer.seed),
        };
        let metrics = self.current_metrics(user_id);
        let snapshot = match self.sampler.latest() {
            Some(s) => s,
            None => self.sampler.sample_now().await?,
        };

        let run = self.controller.optimize(user_id, &weights, metrics.accuracy, goals, &snapshot).await?;
        let mut model_version = Some(weights.version);
        let weights_persisted = match run.weights {
            Some(optimized) => {
                let footprint = optimized.memory_footprint_mb();
                if footprint > self.config.platform.memory_ceiling_mb {
                    return Err(AdaptError::resource_exhaustion(
                        "memory_mb",
                        footprint,
                        self.config.platform.memory_ceiling_mb,
                    ));
                }
                self.store.save(user_id, &optimized).await?;
                model_version = Some(optimized.version);
                if let Some(mut entry) = self.metrics.get_mut(user_id) {
                    entry.memory_footprint_mb = footprint;
                    entry.precision = optimized.precision;
                    entry.accuracy = run.result.accuracy_after;
                    entry.updated_at = Some(chrono::Utc::now());
                }
                true
            }
            None => false,
        };

        Ok(OptimizationOutcome {
            result: Some(run.result),
            weights_persisted,
            model_version,
            metrics: self.current_metrics(user_id),
            fallback: false,
            reason: None,
        })
    }

    // -----------------------------------------------------------------------
    // Reset and queries
    // -----------------------------------------------------------------------

    /// Delete the user's model, metrics and convergence state. Spent privacy
    /// budget is not refunded.
    pub async fn reset(&self, user_id: &str) -> AdaptResult<()> {
        self.ensure_ready()?;
        let tag = user_tag(user_id);
        self.emit(Operation::Reset, Phase::Started, &tag, serde_json::Value::Null);

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        if let Err(e) = self.store.delete(user_id).await {
            let e = AdaptError::from(e);
            self.emit_failure(Operation::Reset, user_id, &e);
            return Err(e);
        }
        self.metrics.remove(user_id);
        self.trainer.forget(user_id);
        self.controller.invalidate(user_id);
        self.active_users.remove(user_id);

        tracing::info!(user = %tag, "User state reset");
        self.emit(Operation::Reset, Phase::Completed, &tag, serde_json::Value::Null);
        Ok(())
    }

    /// Quality summary; neutral for unknown users.
    pub fn metrics(&self, user_id: &str) -> AdaptResult<ModelMetrics> {
        self.ensure_ready()?;
        Ok(self.current_metrics(user_id))
    }

    fn current_metrics(&self, user_id: &str) -> ModelMetrics {
        self.metrics.get(user_id).map(|m| m.clone()).unwrap_or_else(ModelMetrics::neutral)
    }

    /// Lifecycle and hardware events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Newest hardware snapshot.
    pub fn latest_snapshot(&self) -> Option<HardwareSnapshot> {
        self.sampler.latest()
    }

    /// Take a hardware sample now. Alerts it raises reach the reactive worker.
    pub async fn sample_hardware(&self) -> AdaptResult<HardwareSnapshot> {
        self.ensure_ready()?;
        self.sampler.sample_now().await
    }

    /// Remaining privacy budget for a user.
    pub fn privacy_budget_remaining(&self, user_id: &str) -> f64 {
        self.accountant.remaining(user_id)
    }

    /// Users touched by train, update or optimize since startup.
    pub fn active_users(&self) -> Vec<String> {
        self.active_users.iter().map(|u| u.key().clone()).collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, operation: Operation, phase: Phase, tag: &str, payload: serde_json::Value) {
        self.events.publish(EngineEvent::lifecycle(operation, phase, tag, payload));
    }

    fn emit_failure(&self, operation: Operation, user_id: &str, error: &AdaptError) {
        let tag = user_tag(user_id);
        let message = self.sanitizer.scrub(&error.to_string(), user_id);
        tracing::warn!(user = %tag, operation = %operation, kind = %error.kind(), error = %message, "Operation failed");
        self.emit(
            operation,
            Phase::Failed,
            &tag,
            json!({ "kind": error.kind().to_string(), "error": message, "retryable": error.is_retryable() }),
        );
    }
}

/// Turn sampler alerts into events and queued jobs. Never runs recovery work
/// inline.
async fn run_reactor(
    mut alerts: broadcast::Receiver<HardwareAlert>,
    events: EventBus,
    jobs: mpsc::Sender<ReactiveJob>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    tracing::debug!("Alert reactor started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = alerts.recv() => match received {
                Ok(alert) => {
                    events.publish(EngineEvent::hardware(&alert));
                    let job = match alert {
                        HardwareAlert::Thermal { .. } => ReactiveJob::Emergency,
                        HardwareAlert::MemoryPressure { .. } => ReactiveJob::MemoryFocused,
                    };
                    if let Err(e) = jobs.try_send(job) {
                        tracing::warn!(error = %e, "Reactive job queue full, dropping job");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Alert reactor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    tracing::debug!("Alert reactor stopped");
}

/// Run queued jobs: one optimization task per active user.
async fn run_worker(
    engine: Weak<AdaptiveLearningEngine>,
    mut jobs: mpsc::Receiver<ReactiveJob>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown_rx.recv() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let goals = match job {
            ReactiveJob::Emergency => OptimizationGoals::emergency(&engine.config.platform),
            ReactiveJob::MemoryFocused => OptimizationGoals::memory_focused(&engine.config.platform),
        };

        let users = engine.active_users();
        tracing::info!(job = ?job, users = users.len(), "Running reactive optimization");
        let mut set = JoinSet::new();
        for user in users {
            let engine = Arc::clone(&engine);
            let goals = goals.clone();
            set.spawn(async move {
                if let Err(e) = engine.optimize(&user, &goals).await {
                    tracing::warn!(user = %user_tag(&user), kind = %e.kind(), "Reactive optimization failed");
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Reactive optimization task panicked");
            }
        }
    }
    tracing::debug!("Reactive worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatternType;
    use crate::store::InMemoryWeightStore;
    use crate::telemetry::ScriptedSource;

    fn engine(source: Arc<ScriptedSource>) -> Arc<AdaptiveLearningEngine> {
        let mut config = EngineConfig::default();
        config.privacy.seed = Some(7);
        Arc::new(AdaptiveLearningEngine::new(config, Arc::new(InMemoryWeightStore::new()), source))
    }

    fn patterns(n: usize) -> Vec<IdentifiedPattern> {
        (0..n).map(|i| IdentifiedPattern::new(format!("p{i}"), PatternType::Behavioral, 0.9, 3.0)).collect()
    }

    #[tokio::test]
    async fn operations_require_initialize() {
        let e = engine(Arc::new(ScriptedSource::nominal()));
        assert_eq!(e.state(), EngineState::Created);
        let err = e.train("u", &patterns(3)).await.unwrap_err();
        assert!(matches!(err, AdaptError::NotInitialized(_)));
        assert!(matches!(e.metrics("u"), Err(AdaptError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let e = engine(Arc::new(ScriptedSource::nominal()));
        e.initialize().await.unwrap();
        e.initialize().await.unwrap();
        assert_eq!(e.state(), EngineState::Initialized);
        assert!(e.latest_snapshot().is_some());

        e.shutdown().await;
        assert_eq!(e.state(), EngineState::ShutDown);
        assert!(matches!(e.initialize().await, Err(AdaptError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn invalid_config_fails_initialize() {
        let mut config = EngineConfig::default();
        config.trainer.batch_size = 0;
        let e = Arc::new(AdaptiveLearningEngine::new(
            config,
            Arc::new(InMemoryWeightStore::new()),
            Arc::new(ScriptedSource::nominal()),
        ));
        assert!(matches!(e.initialize().await, Err(AdaptError::Config(_))));
        assert_eq!(e.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn empty_batch_rejected_without_spending_budget() {
        let e = engine(Arc::new(ScriptedSource::nominal()));
        e.initialize().await.unwrap();
        let before = e.privacy_budget_remaining("u");
        let err = e.update("u", &[]).await.unwrap_err();
        assert!(matches!(err, AdaptError::Validation { .. }));
        assert_eq!(e.privacy_budget_remaining("u"), before);
        e.shutdown().await;
    }

    #[tokio::test]
    async fn train_updates_metrics_and_events_use_tags() {
        let e = engine(Arc::new(ScriptedSource::nominal()));
        e.initialize().await.unwrap();
        let mut rx = e.subscribe();

        let outcome = e.train("alice@example.com", &patterns(10)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(e.metrics("alice@example.com").unwrap().training_cycles, 1);

        let started = rx.recv().await.unwrap();
        let completed = rx.recv().await.unwrap();
        assert_eq!(started.event_type(), "train.started");
        assert_eq!(completed.event_type(), "train.completed");
        assert_eq!(completed.user_id.as_deref(), Some(outcome.user_tag.as_str()));
        assert!(!serde_json::to_string(&completed).unwrap().contains("alice"));
        e.shutdown().await;
    }
}
