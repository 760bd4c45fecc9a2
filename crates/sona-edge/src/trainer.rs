//! EWC-regularized incremental trainer.
//!
//! One training cycle:
//!
//! 1. Load the user's weights, or create the default architecture
//! 2. Compute EWC importance from the weights as loaded
//! 3. For up to `max_steps` mini-batches: gradient toward the batch's
//!    Hebbian targets, EWC penalty, strength-scaled step
//! 4. Reject the candidate if it breaches the memory ceiling
//! 5. Persist atomically and report
//!
//! Each pattern is encoded as a 12-wide feature vector `x`. Layer `l` is pulled
//! toward the co-occurrence map `τ[o][i] = α·x[(o+l) mod 12]·x[i mod 12]`,
//! which is linear in `x xᵀ`, so a batch's strength-weighted target only needs
//! the batch's weighted second moment.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{PlatformConfig, TrainerConfig};
use crate::convergence::{ConvergenceClassifier, ConvergenceStatus};
use crate::domain::{ModelWeights, PatternType, Precision, SanitizedPattern, FEATURE_DIM};
use crate::error::{AdaptError, AdaptResult};
use crate::ewc::{EwcRegularizer, Gradients};
use crate::session::FederatedSession;
use crate::store::WeightStore;

/// Target gain applied to the co-occurrence map.
const TARGET_GAIN: f32 = 0.5;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Encode a sanitized pattern.
///
/// Layout: pattern type one-hot (4), time bucket one-hot (4), weekend, quiet,
/// alone as `+1 / -1 / 0` for true / false / unknown, and a constant bias.
pub fn encode_features(pattern: &SanitizedPattern) -> [f32; FEATURE_DIM] {
    let mut x = [0.0_f32; FEATURE_DIM];
    x[pattern.pattern_type.index()] = 1.0;
    if let Some(bucket) = pattern.context.time_bucket {
        x[PatternType::ALL.len() + bucket.index()] = 1.0;
    }
    let flag = |v: Option<bool>| match v {
        Some(true) => 1.0,
        Some(false) => -1.0,
        None => 0.0,
    };
    x[8] = flag(pattern.context.is_weekend);
    x[9] = flag(pattern.context.is_quiet);
    x[10] = flag(pattern.context.is_alone);
    x[11] = 1.0;
    x
}

struct Encoded {
    features: [f32; FEATURE_DIM],
    strength: f64,
}

/// Strength-weighted first and second moments of a batch.
struct Moments {
    mean: [f32; FEATURE_DIM],
    outer: [[f32; FEATURE_DIM]; FEATURE_DIM],
}

impl Moments {
    fn of(batch: &[&Encoded]) -> Self {
        let total: f64 = batch.iter().map(|e| e.strength).sum();
        // All-zero strengths fall back to a uniform average.
        let weight = |e: &Encoded| if total > 0.0 { e.strength / total } else { 1.0 / batch.len() as f64 };

        let mut mean = [0.0_f32; FEATURE_DIM];
        let mut outer = [[0.0_f32; FEATURE_DIM]; FEATURE_DIM];
        for e in batch {
            let w = weight(e) as f32;
            for r in 0..FEATURE_DIM {
                mean[r] += w * e.features[r];
                for c in 0..FEATURE_DIM {
                    outer[r][c] += w * e.features[r] * e.features[c];
                }
            }
        }
        Moments { mean, outer }
    }
}

fn batch_gradient(weights: &ModelWeights, batch: &[&Encoded]) -> Gradients {
    let m = Moments::of(batch);
    let layers = weights
        .layers
        .iter()
        .enumerate()
        .map(|(l, layer)| {
            let mut g = Vec::with_capacity(layer.param_count());
            for o in 0..layer.output_dim {
                let row = &m.outer[(o + l) % FEATURE_DIM];
                for i in 0..layer.input_dim {
                    g.push(layer.weight(o, i) - TARGET_GAIN * row[i % FEATURE_DIM]);
                }
            }
            for o in 0..layer.output_dim {
                g.push(layer.biases[o] - TARGET_GAIN * m.mean[(o + l) % FEATURE_DIM]);
            }
            g
        })
        .collect();
    Gradients { layers }
}

fn apply_step(weights: &mut ModelWeights, gradients: &Gradients, learning_rate: f64) {
    let lr = learning_rate as f32;
    for (layer, grad) in weights.layers.iter_mut().zip(gradients.layers.iter()) {
        for (param, g) in layer.params_mut().zip(grad.iter()) {
            *param -= lr * g;
        }
    }
}

/// Agreement between the batch's feature vectors, in `[0, 1]`.
fn consistency(encoded: &[Encoded]) -> f64 {
    let n = encoded.len() as f64;
    let mut centroid = [0.0_f64; FEATURE_DIM];
    for e in encoded {
        for (c, x) in centroid.iter_mut().zip(e.features.iter()) {
            *c += *x as f64 / n;
        }
    }
    let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
    let spread: f64 = encoded
        .iter()
        .map(|e| {
            let d: Vec<f64> = e.features.iter().zip(centroid.iter()).map(|(x, c)| *x as f64 - c).collect();
            norm(&d)
        })
        .sum::<f64>()
        / n;
    let scale: f64 = encoded
        .iter()
        .map(|e| norm(&e.features.iter().map(|x| *x as f64).collect::<Vec<_>>()))
        .sum::<f64>()
        / n;
    if scale > 0.0 {
        (1.0 - spread / scale).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Quality figures of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// `1 - final/initial` gradient norm, clamped to `[0, 1]`.
    pub accuracy_improvement: f64,
    /// Mean sanitized strength.
    pub confidence: f64,
    /// Agreement between patterns.
    pub consistency: f64,
    /// Gradient norm before the first step.
    pub initial_gradient_norm: f64,
    /// Gradient norm at the last observation.
    pub final_gradient_norm: f64,
    /// Effective (strength-scaled, capped) learning rate.
    pub learning_rate: f64,
}

/// Result of a successful training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Whether a new weight version was persisted.
    pub weights_updated: bool,
    /// Candidate footprint plus transient training buffers.
    pub memory_usage_mb: f64,
    /// Footprint of the persisted model.
    pub memory_footprint_mb: f64,
    /// Final gradient norm.
    pub convergence_score: f64,
    /// Quality figures.
    pub metrics: TrainingMetrics,
    /// Consolidation loss between the loaded and persisted weights.
    pub ewc_loss: f64,
    /// Convergence label of the cycle.
    pub status: ConvergenceStatus,
    /// Update steps applied.
    pub steps: usize,
    /// Version of the persisted weights.
    pub version: u64,
    /// Precision of the persisted weights.
    pub precision: Precision,
    /// Patterns consumed.
    pub pattern_count: usize,
}

/// Incremental trainer shared by all users.
///
/// Callers must serialize calls per user; different users may train
/// concurrently.
pub struct IncrementalTrainer {
    config: TrainerConfig,
    platform: PlatformConfig,
    store: Arc<dyn WeightStore>,
    regularizer: EwcRegularizer,
    classifier: ConvergenceClassifier,
}

impl IncrementalTrainer {
    /// Create a trainer.
    pub fn new(
        config: TrainerConfig,
        platform: PlatformConfig,
        store: Arc<dyn WeightStore>,
        classifier: ConvergenceClassifier,
    ) -> Self {
        let regularizer = EwcRegularizer::new(config.importance_mode);
        Self { config, platform, store, regularizer, classifier }
    }

    /// Run one training cycle of at most `max_steps` update steps.
    ///
    /// # Errors
    ///
    /// - [`AdaptError::Validation`] for an empty or malformed batch, before
    ///   anything is loaded or written
    /// - [`AdaptError::ResourceExhaustion`] when the candidate would breach the
    ///   memory ceiling; stored weights are unchanged
    /// - [`AdaptError::Training`] for anything else
    pub async fn train(
        &self,
        session: &FederatedSession,
        patterns: &[SanitizedPattern],
        max_steps: usize,
    ) -> AdaptResult<TrainingReport> {
        if patterns.is_empty() {
            return Err(AdaptError::validation("patterns", "must contain at least one pattern"));
        }
        if let Some(bad) = patterns
            .iter()
            .find(|p| !(p.strength.is_finite() && (0.0..=1.0).contains(&p.strength)) || !(p.frequency >= 0.0))
        {
            return Err(AdaptError::validation(
                "patterns",
                format!("sanitized pattern {} is out of range", bad.id),
            ));
        }
        if max_steps == 0 {
            return Err(AdaptError::validation("max_steps", "must be > 0"));
        }

        let started = Instant::now();
        match self.run(session, patterns, max_steps).await {
            Ok(report) => {
                tracing::info!(
                    session = %session.session_id,
                    user = %session.user_tag,
                    status = %report.status,
                    steps = report.steps,
                    score = report.convergence_score,
                    improvement = report.metrics.accuracy_improvement,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Training cycle complete"
                );
                Ok(report)
            }
            Err(e @ (AdaptError::Validation { .. } | AdaptError::ResourceExhaustion { .. })) => {
                tracing::warn!(user = %session.user_tag, error = %e, "Training cycle rejected");
                Err(e)
            }
            Err(e) => {
                let wrapped = AdaptError::Training {
                    user_tag: session.user_tag.clone(),
                    pattern_count: patterns.len(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    message: e.to_string(),
                };
                tracing::error!(user = %session.user_tag, error = %wrapped, "Training cycle failed");
                Err(wrapped)
            }
        }
    }

    async fn run(
        &self,
        session: &FederatedSession,
        patterns: &[SanitizedPattern],
        max_steps: usize,
    ) -> AdaptResult<TrainingReport> {
        let user_id = session.user_id();

        // 1. Load current weights
        let current = match self.store.load(user_id).await? {
            Some(w) => w,
            None => {
                tracing::debug!(user = %session.user_tag, "No stored model, using default architecture");
                ModelWeights::default_architecture(self.config.seed)
            }
        };
        let issues = current.integrity_issues();
        if !issues.is_empty() {
            return Err(AdaptError::Store(crate::error::StoreError::corrupt(
                session.user_tag.clone(),
                issues.join("; "),
            )));
        }

        // 2. Importance from the weights as loaded
        let importance = self.regularizer.importance_for(user_id, &current);

        let encoded: Vec<Encoded> = patterns
            .iter()
            .map(|p| Encoded { features: encode_features(p), strength: p.strength })
            .collect();
        let mean_strength = patterns.iter().map(|p| p.strength).sum::<f64>() / patterns.len() as f64;
        let learning_rate =
            (session.learning_rate * (1.0 + mean_strength)).min(self.config.max_learning_rate);
        let strength = session.regularization_strength;
        let batch_size = self.config.batch_size.max(1).min(encoded.len());

        // 3. Mini-batch updates
        self.classifier.begin_cycle(user_id);
        let mut candidate = current.clone();
        let mut initial_norm = None;
        let mut final_norm = 0.0;
        let mut status = ConvergenceStatus::Converging;
        let mut steps = 0;

        for step in 0..max_steps {
            let start = (step * batch_size) % encoded.len();
            let batch: Vec<&Encoded> = (0..batch_size).map(|j| &encoded[(start + j) % encoded.len()]).collect();

            let gradients = batch_gradient(&candidate, &batch);
            let score = gradients.norm();
            if !score.is_finite() {
                return Err(AdaptError::Training {
                    user_tag: session.user_tag.clone(),
                    pattern_count: patterns.len(),
                    elapsed_ms: session.elapsed_ms(),
                    message: format!("non-finite gradient norm at step {step}"),
                });
            }
            initial_norm.get_or_insert(score);
            final_norm = score;
            status = self.classifier.observe(user_id, score);
            tracing::trace!(user = %session.user_tag, step, score, status = %status, "Update step");
            if status.is_terminal() {
                break;
            }

            let penalized = self.regularizer.penalize(&gradients, &importance, strength)?;
            apply_step(&mut candidate, &penalized, learning_rate);
            steps += 1;
        }

        if !candidate.is_finite() {
            return Err(AdaptError::Training {
                user_tag: session.user_tag.clone(),
                pattern_count: patterns.len(),
                elapsed_ms: session.elapsed_ms(),
                message: "candidate weights contain non-finite values".into(),
            });
        }

        // 4. Memory ceiling
        let footprint = candidate.memory_footprint_mb();
        if footprint > self.platform.memory_ceiling_mb {
            return Err(AdaptError::resource_exhaustion("memory_mb", footprint, self.platform.memory_ceiling_mb));
        }
        let transient_bytes = 2.0 * candidate.total_parameters() as f64 * 4.0 + importance.len() as f64 * 8.0;
        let memory_usage_mb = footprint + transient_bytes / BYTES_PER_MB;

        // 5. Persist
        let weights_updated = steps > 0;
        let ewc_loss = EwcRegularizer::loss(&importance, strength, &current, &candidate);
        if weights_updated {
            candidate.version = current.version + 1;
            candidate.updated_at = chrono::Utc::now();
            self.store.save(user_id, &candidate).await?;
        }

        let initial = initial_norm.unwrap_or(0.0);
        let accuracy_improvement = if initial > 0.0 { (1.0 - final_norm / initial).clamp(0.0, 1.0) } else { 0.0 };

        Ok(TrainingReport {
            weights_updated,
            memory_usage_mb,
            memory_footprint_mb: footprint,
            convergence_score: final_norm,
            metrics: TrainingMetrics {
                accuracy_improvement,
                confidence: mean_strength,
                consistency: consistency(&encoded),
                initial_gradient_norm: initial,
                final_gradient_norm: final_norm,
                learning_rate,
            },
            ewc_loss,
            status,
            steps,
            version: candidate.version,
            precision: candidate.precision,
            pattern_count: patterns.len(),
        })
    }

    /// Load a user's weights without training.
    pub async fn load(&self, user_id: &str) -> AdaptResult<Option<ModelWeights>> {
        Ok(self.store.load(user_id).await?)
    }

    /// Drop all in-memory training state for a user.
    pub fn forget(&self, user_id: &str) {
        self.regularizer.forget(user_id);
        self.classifier.reset(user_id);
    }

    /// Convergence classifier.
    pub fn classifier(&self) -> &ConvergenceClassifier {
        &self.classifier
    }

    /// Hyper-parameters.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvergenceConfig, PrivacyConfig};
    use crate::domain::{SanitizedContext, TimeBucket};
    use crate::privacy::PrivacyAccountant;
    use crate::store::InMemoryWeightStore;

    fn pattern(pattern_type: PatternType, strength: f64, bucket: TimeBucket) -> SanitizedPattern {
        SanitizedPattern {
            id: "p".into(),
            pattern_type,
            strength,
            frequency: 1.0,
            context: SanitizedContext { time_bucket: Some(bucket), is_weekend: Some(false), ..Default::default() },
        }
    }

    fn trainer(store: Arc<dyn WeightStore>, platform: PlatformConfig) -> IncrementalTrainer {
        IncrementalTrainer::new(
            TrainerConfig::default(),
            platform,
            store,
            ConvergenceClassifier::new(ConvergenceConfig::default()),
        )
    }

    fn session(user: &str) -> FederatedSession {
        let privacy = PrivacyConfig::default();
        let acct = PrivacyAccountant::new(privacy.total_budget);
        FederatedSession::open(user, &TrainerConfig::default(), &privacy, &acct).unwrap()
    }

    #[test]
    fn feature_encoding_layout() {
        let x = encode_features(&pattern(PatternType::Behavioral, 1.0, TimeBucket::Evening));
        assert_eq!(x[2], 1.0);
        assert_eq!(x[4 + 2], 1.0);
        assert_eq!(x[8], -1.0);
        assert_eq!(x[9], 0.0);
        assert_eq!(x[11], 1.0);
    }

    #[test]
    fn gradient_vanishes_at_target() {
        let mut w = ModelWeights::default_architecture(1);
        let e = Encoded { features: encode_features(&pattern(PatternType::Temporal, 1.0, TimeBucket::Morning)), strength: 1.0 };
        for _ in 0..200 {
            let g = batch_gradient(&w, &[&e]);
            apply_step(&mut w, &g, 0.5);
        }
        assert!(batch_gradient(&w, &[&e]).norm() < 1e-4);
    }

    #[test]
    fn zero_strength_batch_uses_uniform_weights() {
        let w = ModelWeights::default_architecture(1);
        let a = Encoded { features: encode_features(&pattern(PatternType::Temporal, 0.0, TimeBucket::Morning)), strength: 0.0 };
        let b = Encoded { features: encode_features(&pattern(PatternType::Preference, 0.0, TimeBucket::Night)), strength: 0.0 };
        assert!(batch_gradient(&w, &[&a, &b]).norm().is_finite());
    }

    #[test]
    fn identical_patterns_are_fully_consistent() {
        let e = || Encoded { features: encode_features(&pattern(PatternType::Temporal, 0.9, TimeBucket::Morning)), strength: 0.9 };
        assert!((consistency(&[e(), e(), e()]) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_batch_is_validation_error() {
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let t = trainer(store.clone(), PlatformConfig::default());
        let err = t.train(&session("u"), &[], 10).await.unwrap_err();
        assert!(matches!(err, AdaptError::Validation { .. }));
        assert!(store.load("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consistent_batch_converges_and_persists() {
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let t = trainer(store.clone(), PlatformConfig::default());
        let patterns: Vec<_> = (0..20).map(|_| pattern(PatternType::Temporal, 0.9, TimeBucket::Morning)).collect();

        let report = t.train(&session("u"), &patterns, 150).await.unwrap();
        assert_eq!(report.status, ConvergenceStatus::Converged);
        assert!(report.weights_updated);
        assert!(report.metrics.accuracy_improvement > 0.7);
        assert!(report.ewc_loss > 0.0);
        assert_eq!(store.load("u").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn memory_breach_discards_candidate() {
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let original = ModelWeights::default_architecture(9);
        store.save("u", &original).await.unwrap();

        let platform = PlatformConfig { memory_ceiling_mb: 1e-4, ..Default::default() };
        let t = trainer(store.clone(), platform);
        let patterns = vec![pattern(PatternType::Temporal, 0.9, TimeBucket::Morning)];

        let err = t.train(&session("u"), &patterns, 5).await.unwrap_err();
        assert!(matches!(err, AdaptError::ResourceExhaustion { .. }));
        assert_eq!(store.load("u").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn stronger_regularization_moves_weights_less() {
        let patterns = vec![pattern(PatternType::Contextual, 0.8, TimeBucket::Night)];
        let mut moved = Vec::new();
        for strength in [0.0, 5.0] {
            let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
            let t = trainer(store.clone(), PlatformConfig::default());
            let mut s = session("u");
            s.regularization_strength = strength;
            t.train(&s, &patterns, 1).await.unwrap();
            let after = store.load("u").await.unwrap().unwrap();
            let before = ModelWeights::default_architecture(TrainerConfig::default().seed);
            moved.push(before.layer_sq_distance(&after).iter().sum::<f64>());
        }
        assert!(moved[1] < moved[0]);
    }
}
