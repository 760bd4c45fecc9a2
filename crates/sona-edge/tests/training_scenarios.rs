//! Integration tests for the training pipeline driven through
//! [`sona_edge::AdaptiveLearningEngine`].
//!
//! Noise is seeded through `PrivacyConfig::seed` and pattern generation uses a
//! fixed-seed `StdRng`, so every run sees the same batches.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sona_edge::domain::ContextFacet;
use sona_edge::{
    AdaptError, AdaptiveLearningEngine, ConvergenceStatus, EngineConfig, FileWeightStore, IdentifiedPattern,
    InMemoryWeightStore, PatternContext, PatternType, ScriptedSource, WeightStore,
};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.privacy.seed = Some(11);
    config
}

async fn engine_with(config: EngineConfig, store: Arc<dyn WeightStore>) -> Arc<AdaptiveLearningEngine> {
    let engine = Arc::new(AdaptiveLearningEngine::new(config, store, Arc::new(ScriptedSource::nominal())));
    engine.initialize().await.expect("engine must initialize");
    engine
}

fn morning_weekday() -> PatternContext {
    PatternContext::with_facets(vec![
        ContextFacet::Temporal { hour_of_day: Some(8), day_of_week: Some(1), timezone: Some("Europe/Berlin".into()) },
        ContextFacet::Environmental { location: Some("home".into()), noise_level_db: Some(30.0), light_level_lux: None },
    ])
}

/// 50 identical high-strength patterns in the same context.
fn consistent_patterns() -> Vec<IdentifiedPattern> {
    (0..50)
        .map(|i| {
            IdentifiedPattern::new(format!("wake-{i}"), PatternType::Temporal, 0.8 + 0.004 * i as f64, 5.0)
                .with_context(morning_weekday())
        })
        .collect()
}

/// Random types, hours, noise levels and company.
fn conflicting_patterns(seed: u64) -> Vec<IdentifiedPattern> {
    let mut rng = StdRng::seed_from_u64(seed);
    let types = [PatternType::Temporal, PatternType::Contextual, PatternType::Behavioral, PatternType::Preference];
    (0..40)
        .map(|i| {
            let context = PatternContext::with_facets(vec![
                ContextFacet::Temporal {
                    hour_of_day: Some(rng.gen_range(0..24)),
                    day_of_week: Some(rng.gen_range(0..7)),
                    timezone: None,
                },
                ContextFacet::Environmental {
                    location: None,
                    noise_level_db: Some(rng.gen_range(20.0..80.0)),
                    light_level_lux: None,
                },
                ContextFacet::Social { companions: Some(rng.gen_range(0..3)), contact_ids: Vec::new() },
            ]);
            IdentifiedPattern::new(format!("mixed-{i}"), types[rng.gen_range(0..4)], rng.gen_range(0.0..1.0), 1.0)
                .with_context(context)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Consistent, strong patterns converge with a large accuracy improvement.
#[tokio::test]
async fn consistent_patterns_converge() {
    let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
    let engine = engine_with(config(), store.clone()).await;

    let outcome = engine.train("alice", &consistent_patterns()).await.expect("training must succeed");
    assert!(outcome.success);
    assert_eq!(outcome.report.status, ConvergenceStatus::Converged);
    assert!(
        outcome.report.metrics.accuracy_improvement > 0.7,
        "accuracy improvement {} must exceed 0.7",
        outcome.report.metrics.accuracy_improvement
    );
    assert!(outcome.report.weights_updated);

    let stored = store.load("alice").await.expect("load").expect("model persisted");
    assert_eq!(stored.version, outcome.report.version);
    assert!(stored.memory_footprint_mb() <= engine.config().platform.memory_ceiling_mb);
    engine.shutdown().await;
}

/// Conflicting patterns still succeed, labelled diverged or stalled.
#[tokio::test]
async fn conflicting_patterns_diverge_or_stall() {
    let engine = engine_with(config(), Arc::new(InMemoryWeightStore::new())).await;

    let outcome = engine.train("bob", &conflicting_patterns(3)).await.expect("training must succeed");
    assert!(outcome.success);
    assert!(
        matches!(outcome.report.status, ConvergenceStatus::Diverged | ConvergenceStatus::Stalled),
        "unexpected status {}",
        outcome.report.status
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Privacy budget
// ---------------------------------------------------------------------------

/// Training is refused once the privacy budget is spent, and stays refused.
#[tokio::test]
async fn exhausted_budget_refuses_training() {
    let mut cfg = config();
    cfg.privacy.total_budget = 2.0;
    let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
    let engine = engine_with(cfg, store.clone()).await;
    let patterns = consistent_patterns();

    engine.train("carol", &patterns).await.expect("first session fits");
    engine.train("carol", &patterns).await.expect("second session fits");
    let version = store.load("carol").await.unwrap().unwrap().version;

    let err = engine.train("carol", &patterns).await.expect_err("budget is spent");
    assert!(matches!(err, AdaptError::PrivacyBudgetExhausted { .. }));
    assert!(!err.is_retryable());

    // Update never falls back on a privacy fault.
    let err = engine.update("carol", &patterns).await.expect_err("budget is spent");
    assert!(matches!(err, AdaptError::PrivacyBudgetExhausted { .. }));
    assert_eq!(store.load("carol").await.unwrap().unwrap().version, version);

    // Other users have their own budget.
    engine.train("dave", &patterns).await.expect("independent budget");
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Rejected updates
// ---------------------------------------------------------------------------

/// A candidate over the memory ceiling is discarded and the stored model is
/// unchanged.
#[tokio::test]
async fn memory_ceiling_breach_leaves_model_unchanged() {
    let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
    let prior = sona_edge::ModelWeights::default_architecture(5);
    store.save("erin", &prior).await.unwrap();

    let mut cfg = config();
    cfg.platform.memory_ceiling_mb = 1e-4;
    let engine = engine_with(cfg, store.clone()).await;

    let err = engine.train("erin", &consistent_patterns()).await.expect_err("ceiling breached");
    assert!(matches!(err, AdaptError::ResourceExhaustion { .. }));
    assert!(err.is_retryable());
    assert_eq!(store.load("erin").await.unwrap(), Some(prior));
    engine.shutdown().await;
}

/// Malformed patterns are rejected before any state changes.
#[tokio::test]
async fn invalid_pattern_rejected_before_mutation() {
    let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
    let engine = engine_with(config(), store.clone()).await;
    let budget = engine.privacy_budget_remaining("frank");

    let mut patterns = consistent_patterns();
    patterns[3].strength = 1.5;
    let err = engine.train("frank", &patterns).await.expect_err("strength out of range");
    assert!(matches!(err, AdaptError::Validation { .. }));

    let mut future = consistent_patterns();
    future[0].context.schema_version = 99;
    let err = engine.update("frank", &future).await.expect_err("unknown context schema");
    assert!(matches!(err, AdaptError::Validation { .. }));

    assert!(store.load("frank").await.unwrap().is_none());
    assert_eq!(engine.privacy_budget_remaining("frank"), budget);
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Incremental updates and persistence
// ---------------------------------------------------------------------------

/// Repeated updates bump the model version and move accuracy up.
#[tokio::test]
async fn updates_accumulate_on_stored_model() {
    let engine = engine_with(config(), Arc::new(InMemoryWeightStore::new())).await;
    let patterns = consistent_patterns();

    let first = engine.update("gina", &patterns).await.expect("update");
    let second = engine.update("gina", &patterns).await.expect("update");
    assert!(!first.fallback && !second.fallback);
    assert!(first.applied);
    assert!(second.model_version >= first.model_version);
    assert_eq!(second.metrics.training_cycles, 2);
    assert!(second.metrics.accuracy >= first.metrics.accuracy);
    engine.shutdown().await;
}

/// Models written by one engine are found by the next one over the same
/// directory, and raw user ids never appear in file names.
#[tokio::test]
async fn file_store_survives_engine_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = engine_with(config(), Arc::new(FileWeightStore::new(dir.path()))).await;
    first.train("henry@example.com", &consistent_patterns()).await.expect("train");
    first.shutdown().await;

    for entry in std::fs::read_dir(dir.path()).expect("read dir") {
        let name = entry.expect("entry").file_name().to_string_lossy().to_string();
        assert!(!name.contains("henry"), "raw user id leaked into {name}");
    }

    let second = engine_with(config(), Arc::new(FileWeightStore::new(dir.path()))).await;
    let report = second.validate("henry@example.com").await.expect("validate");
    assert!(report.has_model);
    assert!(report.valid, "issues: {:?}", report.issues);
    assert_eq!(report.model_version, Some(1));
    second.shutdown().await;
}
