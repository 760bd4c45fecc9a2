//! Core value types shared by every component.
//!
//! - **Patterns**: observations produced by the pattern-recognition
//!   collaborator, and their sanitized form
//! - **Weights**: the per-user model and its memory accounting
//! - **Metrics**: the quality summary exposed to downstream consumers

pub mod metrics;
pub mod pattern;
pub mod weights;

pub use metrics::*;
pub use pattern::*;
pub use weights::*;
