//! Where hardware readings come from.
//!
//! - [`LinuxSysfsSource`]: thermal zones, `/proc/meminfo`, `/proc/stat`,
//!   cpufreq and hwmon on a Linux SoC
//! - [`ScriptedSource`]: settable readings for tests and simulation

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::HardwareSnapshot;
use crate::error::TelemetryError;

/// Provider of raw hardware readings.
#[async_trait]
pub trait HardwareSource: Send + Sync {
    /// Take one reading.
    async fn read(&self) -> Result<HardwareSnapshot, TelemetryError>;

    /// Source name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// ScriptedSource
// ---------------------------------------------------------------------------

/// Readings supplied by the caller.
///
/// Queued readings are returned first, in order. Once the queue is empty the
/// last reading is repeated with a fresh timestamp.
pub struct ScriptedSource {
    current: Mutex<HardwareSnapshot>,
    queue: Mutex<VecDeque<HardwareSnapshot>>,
    reads: AtomicU64,
}

impl ScriptedSource {
    /// Source that starts at `initial`.
    pub fn new(initial: HardwareSnapshot) -> Self {
        Self { current: Mutex::new(initial), queue: Mutex::new(VecDeque::new()), reads: AtomicU64::new(0) }
    }

    /// Source that starts at [`HardwareSnapshot::nominal`].
    pub fn nominal() -> Self {
        Self::new(HardwareSnapshot::nominal())
    }

    /// Replace the steady-state reading and drop anything queued.
    pub fn set(&self, snapshot: HardwareSnapshot) {
        self.queue.lock().clear();
        *self.current.lock() = snapshot;
    }

    /// Queue a one-off reading.
    pub fn push(&self, snapshot: HardwareSnapshot) {
        self.queue.lock().push_back(snapshot);
    }

    /// Mutate the steady-state reading in place.
    pub fn update(&self, f: impl FnOnce(&mut HardwareSnapshot)) {
        f(&mut self.current.lock());
    }

    /// Number of readings taken so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HardwareSource for ScriptedSource {
    async fn read(&self) -> Result<HardwareSnapshot, TelemetryError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(next) = self.queue.lock().pop_front() {
            *self.current.lock() = next;
        }
        let mut snapshot = self.current.lock().clone();
        snapshot.timestamp = Utc::now();
        Ok(snapshot)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// LinuxSysfsSource
// ---------------------------------------------------------------------------

/// File-system locations read by [`LinuxSysfsSource`].
#[derive(Debug, Clone)]
pub struct SysfsPaths {
    /// Directory holding `thermal_zone*`.
    pub thermal: PathBuf,
    /// `meminfo` file.
    pub meminfo: PathBuf,
    /// `stat` file.
    pub stat: PathBuf,
    /// cpufreq directory of CPU 0.
    pub cpufreq: PathBuf,
    /// Directory holding `hwmon*`.
    pub hwmon: PathBuf,
    /// GPU load file (0..=1000), if the platform has one.
    pub gpu_load: Option<PathBuf>,
}

impl Default for SysfsPaths {
    fn default() -> Self {
        SysfsPaths {
            thermal: PathBuf::from("/sys/class/thermal"),
            meminfo: PathBuf::from("/proc/meminfo"),
            stat: PathBuf::from("/proc/stat"),
            cpufreq: PathBuf::from("/sys/devices/system/cpu/cpu0/cpufreq"),
            hwmon: PathBuf::from("/sys/class/hwmon"),
            gpu_load: Some(PathBuf::from("/sys/devices/gpu.0/load")),
        }
    }
}

/// Readings from Linux sysfs and procfs.
///
/// Missing optional sensors (GPU load, power, fan) read as zero. Thermal
/// zones and `meminfo` are required.
pub struct LinuxSysfsSource {
    paths: SysfsPaths,
    last_cpu_times: Mutex<Option<(u64, u64)>>,
}

impl LinuxSysfsSource {
    /// Source reading the standard locations.
    pub fn new() -> Self {
        Self::with_paths(SysfsPaths::default())
    }

    /// Source reading custom locations.
    pub fn with_paths(paths: SysfsPaths) -> Self {
        Self { paths, last_cpu_times: Mutex::new(None) }
    }

    async fn read_string(path: &Path) -> Result<String, TelemetryError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TelemetryError::Io { path: path.to_path_buf(), source })
    }

    async fn read_optional_number(path: &Path) -> Option<f64> {
        tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
    }

    /// `(cpu °C, gpu °C)` from thermal zones, by zone type.
    async fn read_temperatures(&self) -> Result<(f64, f64), TelemetryError> {
        let mut dir = tokio::fs::read_dir(&self.paths.thermal)
            .await
            .map_err(|source| TelemetryError::Io { path: self.paths.thermal.clone(), source })?;
        let mut cpu: Option<f64> = None;
        let mut gpu: Option<f64> = None;
        let mut hottest: Option<f64> = None;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with("thermal_zone") {
                continue;
            }
            let zone = entry.path();
            let Some(milli) = Self::read_optional_number(&zone.join("temp")).await else {
                continue;
            };
            let temp = milli / 1000.0;
            let kind = Self::read_string(&zone.join("type")).await.unwrap_or_default().to_lowercase();
            hottest = Some(hottest.map_or(temp, |h: f64| h.max(temp)));
            if kind.contains("gpu") {
                gpu = Some(gpu.map_or(temp, |g: f64| g.max(temp)));
            } else if kind.contains("cpu") || kind.contains("soc") || kind.contains("x86_pkg") {
                cpu = Some(cpu.map_or(temp, |c: f64| c.max(temp)));
            }
        }
        let hottest = hottest.ok_or_else(|| TelemetryError::Unavailable("no readable thermal zones".into()))?;
        Ok((cpu.unwrap_or(hottest), gpu.unwrap_or(hottest)))
    }

    /// `(used MB, pressure)` from `meminfo`.
    async fn read_memory(&self) -> Result<(f64, f64), TelemetryError> {
        let text = Self::read_string(&self.paths.meminfo).await?;
        parse_meminfo(&text).ok_or_else(|| TelemetryError::Malformed {
            sensor: self.paths.meminfo.display().to_string(),
            value: text.lines().take(3).collect::<Vec<_>>().join(" | "),
        })
    }

    /// Busy fraction since the previous reading.
    async fn read_cpu_util(&self) -> f64 {
        let Ok(text) = Self::read_string(&self.paths.stat).await else {
            return 0.0;
        };
        let Some((idle, total)) = parse_cpu_times(&text) else {
            return 0.0;
        };
        let mut last = self.last_cpu_times.lock();
        let util = match *last {
            Some((prev_idle, prev_total)) if total > prev_total => {
                let d_total = (total - prev_total) as f64;
                let d_idle = idle.saturating_sub(prev_idle) as f64;
                (1.0 - d_idle / d_total).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };
        *last = Some((idle, total));
        util
    }

    /// `(clock GHz, throttling)` from cpufreq. Throttling means the governor
    /// has capped the clock below the hardware maximum.
    async fn read_clock(&self) -> (f64, bool) {
        let cur = Self::read_optional_number(&self.paths.cpufreq.join("scaling_cur_freq")).await;
        let cap = Self::read_optional_number(&self.paths.cpufreq.join("scaling_max_freq")).await;
        let hw_max = Self::read_optional_number(&self.paths.cpufreq.join("cpuinfo_max_freq")).await;
        let clock_ghz = cur.map(|khz| khz / 1e6).unwrap_or(0.0);
        let throttling = matches!((cap, hw_max), (Some(cap), Some(max)) if cap < max);
        (clock_ghz, throttling)
    }

    /// `(power W, fan RPM)` from the first hwmon that reports them.
    async fn read_hwmon(&self) -> (f64, f64) {
        let mut power = None;
        let mut fan = None;
        if let Ok(mut dir) = tokio::fs::read_dir(&self.paths.hwmon).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let dev = entry.path();
                if power.is_none() {
                    power = Self::read_optional_number(&dev.join("power1_input")).await.map(|uw| uw / 1e6);
                }
                if fan.is_none() {
                    fan = Self::read_optional_number(&dev.join("fan1_input")).await;
                }
            }
        }
        (power.unwrap_or(0.0), fan.unwrap_or(0.0))
    }
}

impl Default for LinuxSysfsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareSource for LinuxSysfsSource {
    async fn read(&self) -> Result<HardwareSnapshot, TelemetryError> {
        let (cpu_temp_c, gpu_temp_c) = self.read_temperatures().await?;
        let (memory_used_mb, memory_pressure) = self.read_memory().await?;
        let cpu_util = self.read_cpu_util().await;
        let (clock_ghz, thermal_throttling) = self.read_clock().await;
        let (power_w, fan_rpm) = self.read_hwmon().await;
        let gpu_util = match &self.paths.gpu_load {
            Some(path) => Self::read_optional_number(path).await.map(|l| (l / 1000.0).clamp(0.0, 1.0)).unwrap_or(0.0),
            None => 0.0,
        };
        Ok(HardwareSnapshot {
            cpu_temp_c,
            gpu_temp_c,
            cpu_util,
            gpu_util,
            memory_used_mb,
            memory_pressure,
            gpu_memory_used_mb: 0.0,
            power_w,
            thermal_throttling,
            clock_ghz,
            fan_rpm,
            timestamp: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "sysfs"
    }
}

/// `(used MB, pressure)` from `/proc/meminfo` text.
pub fn parse_meminfo(text: &str) -> Option<(f64, f64)> {
    let field = |name: &str| {
        text.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
    };
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    if total_kb <= 0.0 {
        return None;
    }
    let used_kb = (total_kb - available_kb).max(0.0);
    Some((used_kb / 1024.0, (used_kb / total_kb).clamp(0.0, 1.0)))
}

/// `(idle, total)` jiffies from the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line.split_whitespace().skip(1).filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((idle, values.iter().sum()))
}
