//! # sona-edge
//!
//! On-device personalization of a per-user behavioral model. Patterns observed
//! locally are noised and anonymized, folded into the user's model with
//! elastic weight consolidation so earlier behavior is not forgotten, and the
//! resulting model is kept inside the device's memory, thermal and power
//! envelope by a hardware-aware optimization controller.
//!
//! ## Architecture
//!
//! ```text
//! IdentifiedPattern[] ──► DifferentialPrivacySanitizer ──► IncrementalTrainer ──► WeightStore
//!                                                      │            │
//!                                               EwcRegularizer  ConvergenceClassifier
//!
//! HardwareSource ──► HardwareSampler ──► HardwareAlert ──► reactive worker
//!                          │                                     │
//!                          └────────► OptimizationController ◄───┘
//!
//!                 AdaptiveLearningEngine (lifecycle, events, fallback)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sona_edge::{
//!     AdaptiveLearningEngine, EngineConfig, IdentifiedPattern, InMemoryWeightStore, PatternType,
//!     ScriptedSource,
//! };
//!
//! # async fn run() -> sona_edge::AdaptResult<()> {
//! let engine = Arc::new(AdaptiveLearningEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryWeightStore::new()),
//!     Arc::new(ScriptedSource::nominal()),
//! ));
//! engine.initialize().await?;
//!
//! let patterns = vec![IdentifiedPattern::new("p1", PatternType::Temporal, 0.9, 4.0)];
//! let outcome = engine.train("user-1", &patterns).await?;
//! println!("{} after {} steps", outcome.report.status, outcome.report.steps);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod convergence;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod ewc;
pub mod optimizer;
pub mod privacy;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::EngineConfig;
pub use convergence::{ConvergenceClassifier, ConvergenceStatus};
pub use domain::{IdentifiedPattern, ModelMetrics, ModelWeights, PatternContext, PatternType};
pub use engine::{AdaptiveLearningEngine, EngineState, ModelUpdate, OptimizationOutcome, TrainingOutcome, ValidationReport};
pub use error::{AdaptError, AdaptResult, ConfigError, StoreError, TelemetryError};
pub use events::{EngineEvent, EventBus};
pub use optimizer::{OptimizationController, OptimizationGoals, OptimizationResult};
pub use store::{FileWeightStore, InMemoryWeightStore, WeightStore};
pub use telemetry::{HardwareAlert, HardwareSampler, HardwareSnapshot, HardwareSource, LinuxSysfsSource, ScriptedSource};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
