//! Error types for the on-device personalization core.
//!
//! Every module that can fail returns either [`AdaptError`] or one of the
//! module-specific errors below, which coerce into it via [`From`].
//!
//! ## Hierarchy
//!
//! ```text
//! AdaptError (top-level)
//! ├── Validation               (malformed input, rejected before mutation)
//! ├── ResourceExhaustion       (memory ceiling breach, candidate discarded)
//! ├── Training                 (unclassified pipeline failure, wrapped)
//! ├── HardwareConstrained      (optimization postponed or aborted)
//! ├── PrivacyBudgetExhausted   (training refused)
//! ├── ConfigError              (config validation / file loading)
//! ├── StoreError               (weight persistence)
//! └── TelemetryError           (hardware readings)
//! ```

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::telemetry::HardwareSnapshot;

// ---------------------------------------------------------------------------
// AdaptResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by every public operation.
pub type AdaptResult<T> = Result<T, AdaptError>;

// ---------------------------------------------------------------------------
// AdaptError
// ---------------------------------------------------------------------------

/// Top-level error type for training, optimization and orchestration.
#[derive(Debug, Error)]
pub enum AdaptError {
    /// Malformed input. Nothing was mutated.
    #[error("Validation failed for `{field}`: {reason}")]
    Validation {
        /// Offending field or input name.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A resource ceiling would be exceeded. The candidate state was discarded.
    #[error("Resource exhausted: {resource} requires {required:.2} but the limit is {limit:.2}")]
    ResourceExhaustion {
        /// Which resource ran out (e.g. `memory_mb`).
        resource: &'static str,
        /// Amount the candidate needed.
        required: f64,
        /// Configured ceiling.
        limit: f64,
    },

    /// Unclassified failure inside the training pipeline.
    #[error("Training failed for user {user_tag} ({pattern_count} patterns, {elapsed_ms} ms): {message}")]
    Training {
        /// Anonymized user tag, never the raw id.
        user_tag: String,
        /// Number of patterns in the failed batch.
        pattern_count: usize,
        /// Wall-clock time spent before the failure.
        elapsed_ms: u64,
        /// Description of the underlying failure.
        message: String,
    },

    /// Hardware state forbids the requested work right now.
    #[error("Hardware constrained: {reason}")]
    HardwareConstrained {
        /// Threshold that was violated.
        reason: String,
        /// Snapshot that triggered the refusal.
        snapshot: Box<HardwareSnapshot>,
    },

    /// The user's privacy budget cannot cover another session.
    #[error("Privacy budget exhausted for user {user_tag}: spent {spent:.3} of {budget:.3}")]
    PrivacyBudgetExhausted {
        /// Anonymized user tag.
        user_tag: String,
        /// Epsilon already spent.
        spent: f64,
        /// Total epsilon allowed.
        budget: f64,
    },

    /// The engine has not been initialized, or was already shut down.
    #[error("Engine is not initialized (state: {0})")]
    NotInitialized(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A weight store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A hardware telemetry error.
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Coarse classification used by the orchestrator's fallback policy and by
/// callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input.
    Validation,
    /// Memory or goal ceiling.
    ResourceExhaustion,
    /// Wrapped pipeline failure.
    Training,
    /// Thermal, power or memory-pressure gate.
    HardwareConstrained,
    /// Privacy budget spent.
    PrivacyBudget,
    /// Lifecycle misuse.
    NotInitialized,
    /// Configuration.
    Config,
    /// Persistence.
    Store,
    /// Hardware readings.
    Telemetry,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Training => "training",
            ErrorKind::HardwareConstrained => "hardware_constrained",
            ErrorKind::PrivacyBudget => "privacy_budget_exhausted",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
            ErrorKind::Telemetry => "telemetry",
        };
        f.write_str(s)
    }
}

impl AdaptError {
    /// Construct an [`AdaptError::Validation`].
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        AdaptError::Validation { field: field.into(), reason: reason.into() }
    }

    /// Construct an [`AdaptError::ResourceExhaustion`].
    pub fn resource_exhaustion(resource: &'static str, required: f64, limit: f64) -> Self {
        AdaptError::ResourceExhaustion { resource, required, limit }
    }

    /// Construct an [`AdaptError::HardwareConstrained`].
    pub fn hardware_constrained<S: Into<String>>(reason: S, snapshot: &HardwareSnapshot) -> Self {
        AdaptError::HardwareConstrained {
            reason: reason.into(),
            snapshot: Box::new(snapshot.clone()),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdaptError::Validation { .. } => ErrorKind::Validation,
            AdaptError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            AdaptError::Training { .. } => ErrorKind::Training,
            AdaptError::HardwareConstrained { .. } => ErrorKind::HardwareConstrained,
            AdaptError::PrivacyBudgetExhausted { .. } => ErrorKind::PrivacyBudget,
            AdaptError::NotInitialized(_) => ErrorKind::NotInitialized,
            AdaptError::Config(_) => ErrorKind::Config,
            AdaptError::Store(_) => ErrorKind::Store,
            AdaptError::Telemetry(_) => ErrorKind::Telemetry,
        }
    }

    /// Resource and hardware errors may succeed after a backoff.
    /// Validation and privacy errors never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdaptError::ResourceExhaustion { .. } | AdaptError::HardwareConstrained { .. }
        )
    }

    /// Errors the orchestrator is allowed to replace with a fallback result.
    ///
    /// Explicit resource, hardware, privacy and validation faults always
    /// reach the caller.
    pub fn is_unclassified(&self) -> bool {
        matches!(
            self,
            AdaptError::Training { .. }
                | AdaptError::Store(_)
                | AdaptError::Config(_)
                | AdaptError::Telemetry(_)
        )
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating an [`EngineConfig`].
///
/// [`EngineConfig`]: crate::config::EngineConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read or written.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors produced by a [`WeightStore`](crate::store::WeightStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Low-level I/O failure.
    #[error("I/O error at `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be (de)serialized.
    #[error("Serialization error for key `{key}`: {source}")]
    Serialization {
        /// Store key (an anonymized tag).
        key: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A record was readable but violates model invariants.
    #[error("Corrupt record for key `{key}`: {message}")]
    Corrupt {
        /// Store key.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// The backend is not reachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Construct a [`StoreError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    /// Construct a [`StoreError::Corrupt`].
    pub fn corrupt<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        StoreError::Corrupt { key: key.into(), message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// TelemetryError
// ---------------------------------------------------------------------------

/// Errors produced by a [`HardwareSource`](crate::telemetry::HardwareSource).
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A sensor file could not be read.
    #[error("Cannot read sensor `{path}`: {source}")]
    Io {
        /// Sensor path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A sensor produced an unparseable value.
    #[error("Malformed reading from `{sensor}`: {value:?}")]
    Malformed {
        /// Sensor name or path.
        sensor: String,
        /// Raw value.
        value: String,
    },

    /// No reading is available.
    #[error("No hardware reading available: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
