//! Hardware-aware optimization: goal clamping, strategy selection,
//! technique execution and result caching.

mod cache;
mod controller;
mod estimator;
mod goals;
mod strategy;
mod techniques;

pub use cache::OptimizationCache;
pub use controller::{OptimizationController, OptimizationResult, OptimizationRun, StepOutcome, StepRecord};
pub use estimator::{PerformanceEstimate, PerformanceEstimator};
pub use goals::{clamp_goals, EffectiveGoals, OptimizationGoals};
pub use strategy::{
    select_strategy, HardwareUrgency, OptimizationStrategy, PerformanceGaps, PowerConstraints, Priority,
    ResourceRequirements, ThermalConstraints,
};
pub use techniques::Technique;
