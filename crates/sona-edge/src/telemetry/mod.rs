//! Hardware telemetry: snapshots, sources, the periodic sampler and the
//! hard safety gate.

mod ring;
mod safety;
mod sampler;
mod snapshot;
mod source;

pub use ring::SnapshotRing;
pub use safety::{SafetyGate, SafetyViolation};
pub use sampler::{HardwareAlert, HardwareSampler};
pub use snapshot::{HardwareDelta, HardwareSnapshot};
pub use source::{parse_cpu_times, parse_meminfo, HardwareSource, LinuxSysfsSource, ScriptedSource, SysfsPaths};

use async_trait::async_trait;

use crate::error::AdaptResult;

/// On-demand hardware re-sampling, used at technique boundaries.
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Take and record a fresh snapshot.
    async fn sample(&self) -> AdaptResult<HardwareSnapshot>;
}
