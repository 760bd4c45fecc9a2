//! Periodic hardware sampler with a single typed alert channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{HardwareProbe, HardwareSnapshot, HardwareSource, SnapshotRing};
use crate::config::{PlatformConfig, TelemetryConfig};
use crate::error::AdaptResult;

/// Consecutive read failures after which the loop gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Alert raised when a snapshot crosses a soft threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HardwareAlert {
    /// A temperature is near its maximum, or the hardware is throttling.
    Thermal {
        /// Human-readable trigger.
        reason: String,
        /// Triggering snapshot.
        snapshot: HardwareSnapshot,
    },
    /// Memory pressure is above the alert level.
    MemoryPressure {
        /// Observed pressure.
        pressure: f64,
        /// Triggering snapshot.
        snapshot: HardwareSnapshot,
    },
}

impl HardwareAlert {
    /// Snapshot that raised the alert.
    pub fn snapshot(&self) -> &HardwareSnapshot {
        match self {
            HardwareAlert::Thermal { snapshot, .. } | HardwareAlert::MemoryPressure { snapshot, .. } => snapshot,
        }
    }

    /// Alert name for logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            HardwareAlert::Thermal { .. } => "thermal",
            HardwareAlert::MemoryPressure { .. } => "memory_pressure",
        }
    }
}

/// Soft alert thresholds.
#[derive(Debug, Clone)]
struct AlertThresholds {
    cpu_temp_c: f64,
    gpu_temp_c: f64,
    memory_pressure: f64,
}

impl AlertThresholds {
    fn evaluate(&self, s: &HardwareSnapshot) -> Vec<HardwareAlert> {
        let mut alerts = Vec::new();
        let thermal_reason = if s.thermal_throttling {
            Some("thermal throttling active".to_string())
        } else if s.cpu_temp_c >= self.cpu_temp_c {
            Some(format!("cpu {:.1}°C >= {:.1}°C", s.cpu_temp_c, self.cpu_temp_c))
        } else if s.gpu_temp_c >= self.gpu_temp_c {
            Some(format!("gpu {:.1}°C >= {:.1}°C", s.gpu_temp_c, self.gpu_temp_c))
        } else {
            None
        };
        if let Some(reason) = thermal_reason {
            alerts.push(HardwareAlert::Thermal { reason, snapshot: s.clone() });
        }
        if s.memory_pressure > self.memory_pressure {
            alerts.push(HardwareAlert::MemoryPressure { pressure: s.memory_pressure, snapshot: s.clone() });
        }
        alerts
    }
}

/// Periodic sampler.
///
/// Owns the snapshot ring (the only writer) and the alert channel. Alert
/// delivery never blocks sampling: a full channel drops the oldest alert for
/// slow receivers and a channel without receivers drops the alert.
pub struct HardwareSampler {
    config: TelemetryConfig,
    thresholds: AlertThresholds,
    source: Arc<dyn HardwareSource>,
    ring: RwLock<SnapshotRing>,
    alerts: broadcast::Sender<HardwareAlert>,
    interval_ms: AtomicU64,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HardwareSampler {
    /// Create a stopped sampler.
    pub fn new(config: TelemetryConfig, platform: &PlatformConfig, source: Arc<dyn HardwareSource>) -> Self {
        let (alerts, _) = broadcast::channel(config.alert_capacity.max(1));
        let thresholds = AlertThresholds {
            cpu_temp_c: platform.max_cpu_temp_c * config.thermal_alert_ratio,
            gpu_temp_c: platform.max_gpu_temp_c * config.thermal_alert_ratio,
            memory_pressure: config.memory_alert_pressure,
        };
        Self {
            ring: RwLock::new(SnapshotRing::new(config.ring_capacity)),
            interval_ms: AtomicU64::new(config.base_interval_ms),
            thresholds,
            source,
            alerts,
            config,
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Take one reading now, record it and publish any alerts.
    pub async fn sample_now(&self) -> AdaptResult<HardwareSnapshot> {
        let reading = self.source.read().await?;
        let snapshot = self.ring.write().push(reading);
        for alert in self.thresholds.evaluate(&snapshot) {
            tracing::warn!(alert = alert.name(), cpu_temp = snapshot.cpu_temp_c, pressure = snapshot.memory_pressure, "Hardware alert");
            // No receivers is fine.
            let _ = self.alerts.send(alert);
        }
        Ok(snapshot)
    }

    /// Start the periodic loop. Starting a running sampler is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Hardware sampler already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let sampler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sampler.run_loop(shutdown_rx).await;
        });
        *self.task.lock() = Some(handle);
        tracing::info!(source = self.source.name(), interval_ms = self.current_interval().as_millis() as u64, "Hardware sampler started");
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Hardware sampler task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::debug!("Starting hardware sampling loop");
        let mut consecutive_errors = 0u32;
        loop {
            let period = self.current_interval();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Hardware sampler shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(period) => {
                    match self.sample_now().await {
                        Ok(snapshot) => {
                            consecutive_errors = 0;
                            let alerting = !self.thresholds.evaluate(&snapshot).is_empty();
                            self.adapt_interval(alerting);
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            tracing::warn!(error = %e, consecutive_errors, "Hardware sample failed");
                            if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                                tracing::error!("Too many hardware read errors, stopping sampler");
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("Hardware sampling loop ended");
    }

    /// Halve the period toward the minimum while alerting, otherwise relax it
    /// by half again toward the maximum.
    fn adapt_interval(&self, alerting: bool) {
        let current = self.interval_ms.load(Ordering::Relaxed);
        let next = if alerting {
            (current / 2).max(self.config.min_interval_ms)
        } else {
            (current + current / 2).min(self.config.max_interval_ms)
        };
        if next != current {
            tracing::debug!(from_ms = current, to_ms = next, alerting, "Sampling period adjusted");
        }
        self.interval_ms.store(next, Ordering::Relaxed);
    }

    /// Current sampling period.
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Subscribe to alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<HardwareAlert> {
        self.alerts.subscribe()
    }

    /// Newest snapshot, if any.
    pub fn latest(&self) -> Option<HardwareSnapshot> {
        self.ring.read().latest().cloned()
    }

    /// Copy of the ring, oldest first.
    pub fn history(&self) -> Vec<HardwareSnapshot> {
        self.ring.read().iter().cloned().collect()
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HardwareProbe for HardwareSampler {
    async fn sample(&self) -> AdaptResult<HardwareSnapshot> {
        self.sample_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ScriptedSource;

    fn sampler(source: Arc<ScriptedSource>) -> Arc<HardwareSampler> {
        Arc::new(HardwareSampler::new(TelemetryConfig::default(), &PlatformConfig::default(), source))
    }

    #[tokio::test]
    async fn thermal_alert_published() {
        let src = Arc::new(ScriptedSource::nominal());
        let s = sampler(src.clone());
        let mut rx = s.subscribe();

        src.update(|snap| snap.cpu_temp_c = 78.0);
        s.sample_now().await.unwrap();
        match rx.try_recv().unwrap() {
            HardwareAlert::Thermal { snapshot, .. } => assert_eq!(snapshot.cpu_temp_c, 78.0),
            other => panic!("unexpected alert {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_alert_published_and_nominal_is_quiet() {
        let src = Arc::new(ScriptedSource::nominal());
        let s = sampler(src.clone());
        let mut rx = s.subscribe();

        s.sample_now().await.unwrap();
        assert!(rx.try_recv().is_err());

        src.update(|snap| snap.memory_pressure = 0.85);
        s.sample_now().await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), HardwareAlert::MemoryPressure { .. }));
    }

    #[tokio::test]
    async fn sampling_without_subscribers_never_blocks() {
        let src = Arc::new(ScriptedSource::nominal());
        src.update(|snap| snap.thermal_throttling = true);
        let s = sampler(src);
        for _ in 0..200 {
            s.sample_now().await.unwrap();
        }
        assert_eq!(s.history().len(), 100);
    }

    #[test]
    fn interval_adapts_within_bounds() {
        let s = sampler(Arc::new(ScriptedSource::nominal()));
        for _ in 0..10 {
            s.adapt_interval(true);
        }
        assert_eq!(s.current_interval(), Duration::from_millis(1_000));
        for _ in 0..10 {
            s.adapt_interval(false);
        }
        assert_eq!(s.current_interval(), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_samples_until_stopped() {
        let src = Arc::new(ScriptedSource::nominal());
        let s = sampler(src.clone());
        s.start();
        assert!(s.is_running());

        tokio::time::sleep(Duration::from_millis(5_000 * 3 + 100)).await;
        s.stop().await;
        assert!(!s.is_running());
        assert!(src.reads() >= 2);
        let reads = src.reads();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(src.reads(), reads);
    }
}
