//! Host health sampling.
//!
//! The sampler reads CPU, memory and disk-free percentages through a
//! [`HostProbe`] on the blocking pool, bounded by a timeout. A metric that
//! cannot be read falls back to its last good value and is tagged stale;
//! with no history the fill is the worst case (cpu 100, memory 100, disk 0).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::core::lock;
use crate::error::SampleReadError;
use crate::utils::clamp_percent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    DiskFree,
}

impl Metric {
    /// Value assumed for a metric that has never been read successfully.
    const fn worst_case(self) -> f64 {
        match self {
            Metric::Cpu | Metric::Memory => 100.0,
            Metric::DiskFree => 0.0,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cpu => "cpu_percent",
            Metric::Memory => "memory_percent",
            Metric::DiskFree => "disk_free_percent",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of host health. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_free_percent: f64,
    /// Informational only; never part of classification or staleness.
    #[serde(default)]
    pub disk_free_gb: f64,
    pub sampled_at: DateTime<Utc>,
    /// Metrics carried over from an earlier sample because this read failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<Metric>,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_free_percent: f64) -> Self {
        Self {
            cpu_percent: clamp_percent(cpu_percent).unwrap_or(Metric::Cpu.worst_case()),
            memory_percent: clamp_percent(memory_percent).unwrap_or(Metric::Memory.worst_case()),
            disk_free_percent: clamp_percent(disk_free_percent)
                .unwrap_or(Metric::DiskFree.worst_case()),
            disk_free_gb: 0.0,
            sampled_at: Utc::now(),
            stale: Vec::new(),
        }
    }

    pub fn with_disk_free_gb(mut self, gb: f64) -> Self {
        self.disk_free_gb = if gb.is_finite() { gb.max(0.0) } else { 0.0 };
        self
    }

    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty()
    }

    pub fn is_metric_stale(&self, metric: Metric) -> bool {
        self.stale.contains(&metric)
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Blocking reads of raw host metrics. Each read is independent so one
/// broken metric does not poison the others.
pub trait HostProbe: Send + 'static {
    fn cpu_percent(&mut self) -> Result<f64, SampleReadError>;
    fn memory_percent(&mut self) -> Result<f64, SampleReadError>;
    fn disk_free_percent(&mut self) -> Result<f64, SampleReadError>;

    /// Free space in GiB from the most recent disk read, when known.
    fn disk_free_gb(&mut self) -> Option<f64> {
        None
    }
}

/// `sysinfo`-backed probe for the local host.
pub struct SystemProbe {
    system: System,
    disks: Disks,
    mount: PathBuf,
    free_bytes: Option<u64>,
}

impl SystemProbe {
    /// Probes the disk holding `mount` (longest matching mount point wins).
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // The first CPU reading after construction is always zero; prime it.
        system.refresh_cpu_usage();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            mount: mount.into(),
            free_bytes: None,
        }
    }

    fn unreadable(metric: Metric, reason: impl Into<String>) -> SampleReadError {
        SampleReadError::Unreadable {
            metric,
            reason: reason.into(),
        }
    }
}

impl HostProbe for SystemProbe {
    fn cpu_percent(&mut self) -> Result<f64, SampleReadError> {
        self.system.refresh_cpu_usage();
        if self.system.cpus().is_empty() {
            return Err(Self::unreadable(Metric::Cpu, "no CPUs reported"));
        }
        Ok(f64::from(self.system.global_cpu_usage()))
    }

    fn memory_percent(&mut self) -> Result<f64, SampleReadError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(Self::unreadable(Metric::Memory, "total memory reported as zero"));
        }
        Ok(self.system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn disk_free_percent(&mut self) -> Result<f64, SampleReadError> {
        self.disks.refresh(true);
        self.free_bytes = None;
        let mount: &Path = &self.mount;
        let disk = self
            .disks
            .list()
            .iter()
            .filter(|d| mount.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                let reason = format!("no disk mounted at {}", mount.display());
                Self::unreadable(Metric::DiskFree, reason)
            })?;
        let total = disk.total_space();
        if total == 0 {
            return Err(Self::unreadable(Metric::DiskFree, "disk reports zero capacity"));
        }
        let available = disk.available_space();
        self.free_bytes = Some(available);
        Ok(available as f64 / total as f64 * 100.0)
    }

    fn disk_free_gb(&mut self) -> Option<f64> {
        self.free_bytes.map(|bytes| bytes as f64 / GIB)
    }
}

struct Readings {
    cpu: Result<f64, SampleReadError>,
    memory: Result<f64, SampleReadError>,
    disk_free: Result<f64, SampleReadError>,
    disk_free_gb: Option<f64>,
}

impl Readings {
    fn failed(err: SampleReadError) -> Self {
        Self {
            cpu: Err(err.clone()),
            memory: Err(err.clone()),
            disk_free: Err(err),
            disk_free_gb: None,
        }
    }
}

#[derive(Default)]
struct LastKnown {
    cpu: Option<f64>,
    memory: Option<f64>,
    disk_free: Option<f64>,
    disk_free_gb: Option<f64>,
}

/// Clears the in-flight flag when a probe read ends, panics included.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ResourceSampler {
    probe: Arc<Mutex<Box<dyn HostProbe>>>,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
    last: Mutex<LastKnown>,
    consecutive_misses: AtomicU32,
}

impl ResourceSampler {
    pub fn new(probe: impl HostProbe, timeout: Duration) -> Self {
        let probe: Box<dyn HostProbe> = Box::new(probe);
        Self {
            probe: Arc::new(Mutex::new(probe)),
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            last: Mutex::new(LastKnown::default()),
            consecutive_misses: AtomicU32::new(0),
        }
    }

    /// Takes one snapshot. Never fails and never waits longer than the
    /// configured timeout.
    ///
    /// At most one probe read is outstanding: while a timed-out read is
    /// still blocked, later samples skip the probe and count as stale.
    pub async fn sample(&self) -> ResourceSnapshot {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return self.merge(Readings::failed(SampleReadError::StillRunning));
        }
        let guard = InFlight(Arc::clone(&self.in_flight));
        let probe = Arc::clone(&self.probe);
        let read = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut probe = lock(&probe);
            Readings {
                cpu: probe.cpu_percent(),
                memory: probe.memory_percent(),
                disk_free: probe.disk_free_percent(),
                disk_free_gb: probe.disk_free_gb(),
            }
        });

        let readings = match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(readings)) => readings,
            Ok(Err(join_err)) => {
                Readings::failed(SampleReadError::ProbeCrashed(join_err.to_string()))
            }
            Err(_) => Readings::failed(SampleReadError::Timeout(self.timeout)),
        };

        self.merge(readings)
    }

    /// Number of consecutive samples that carried at least one stale metric.
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses.load(Relaxed)
    }

    fn merge(&self, readings: Readings) -> ResourceSnapshot {
        let mut stale = Vec::new();
        let (cpu, memory, disk_free, disk_free_gb) = {
            let mut last = lock(&self.last);
            if let Some(gb) = readings.disk_free_gb.filter(|gb| gb.is_finite()) {
                last.disk_free_gb = Some(gb);
            }
            (
                resolve(Metric::Cpu, readings.cpu, &mut last.cpu, &mut stale),
                resolve(Metric::Memory, readings.memory, &mut last.memory, &mut stale),
                resolve(Metric::DiskFree, readings.disk_free, &mut last.disk_free, &mut stale),
                last.disk_free_gb.unwrap_or(0.0),
            )
        };

        if stale.is_empty() {
            self.consecutive_misses.store(0, Relaxed);
        } else {
            let misses = self.consecutive_misses.fetch_add(1, Relaxed) + 1;
            debug!("Sample carried stale metrics {:?} ({} consecutive)", stale, misses);
        }

        ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_free_percent: disk_free,
            disk_free_gb,
            sampled_at: Utc::now(),
            stale,
        }
    }
}

fn resolve(
    metric: Metric,
    reading: Result<f64, SampleReadError>,
    last: &mut Option<f64>,
    stale: &mut Vec<Metric>,
) -> f64 {
    let reading = reading.and_then(|v| {
        clamp_percent(v).ok_or_else(|| SampleReadError::Unreadable {
            metric,
            reason: format!("non-finite reading {}", v),
        })
    });

    match reading {
        Ok(value) => {
            *last = Some(value);
            value
        }
        Err(e) => {
            warn!("Resource sample degraded: {}", e);
            stale.push(metric);
            last.unwrap_or(metric.worst_case())
        }
    }
}
