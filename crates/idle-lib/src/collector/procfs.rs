//! Local host sampling from /proc
//!
//! Reads cumulative counters and turns them into rates:
//! - /proc/stat for CPU busy time
//! - /proc/meminfo for memory in use (MemTotal - MemAvailable)
//! - /proc/net/dev for bytes moved on non-loopback interfaces
//! - /proc/diskstats for sectors read and written on whole disks

use super::probe::{GpuProbe, SessionProbe};
use super::MetricsCollector;
use crate::error::{IdleError, IdleResult};
use crate::models::{Instance, MetricSample, MetricSource};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::Mutex;

const SECTOR_BYTES: u64 = 512;

/// Cumulative CPU jiffies from the aggregate `cpu` line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// One reading of every cumulative counter
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcCounters {
    pub cpu: CpuTimes,
    pub net_bytes: u64,
    pub disk_sectors: u64,
    pub memory_percent: f64,
}

/// Parse the aggregate `cpu` line of /proc/stat.
///
/// Idle time is `idle + iowait`; everything else counts as busy.
pub fn parse_cpu_times(content: &str) -> IdleResult<CpuTimes> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| IdleError::Collection("no aggregate cpu line in /proc/stat".into()))?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return Err(IdleError::Collection(format!(
            "short cpu line in /proc/stat: {}",
            line
        )));
    }

    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Memory in use as a percentage of MemTotal
pub fn parse_mem_used_percent(content: &str) -> IdleResult<f64> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|v| v.parse::<f64>().ok())) {
            (Some("MemTotal:"), Some(v)) => total = Some(v),
            (Some("MemAvailable:"), Some(v)) => available = Some(v),
            _ => {}
        }
    }

    match (total, available) {
        (Some(total), Some(available)) if total > 0.0 => {
            Ok(((total - available) / total * 100.0).clamp(0.0, 100.0))
        }
        _ => Err(IdleError::Collection(
            "MemTotal/MemAvailable missing from /proc/meminfo".into(),
        )),
    }
}

/// Received plus transmitted bytes across all interfaces except loopback
pub fn parse_net_bytes(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(iface, _)| iface.trim() != "lo")
        .map(|(_, counters)| {
            let fields: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            fields.first().copied().unwrap_or(0) + fields.get(8).copied().unwrap_or(0)
        })
        .sum()
}

/// Sectors read plus written on whole physical disks
pub fn parse_disk_sectors(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || !is_whole_disk(fields[2]) {
                return None;
            }
            let read: u64 = fields[5].parse().ok()?;
            let written: u64 = fields[9].parse().ok()?;
            Some(read + written)
        })
        .sum()
}

fn is_whole_disk(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("nvme") {
        return !rest.contains('p');
    }
    ["sd", "xvd", "vd"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphabetic()))
            .unwrap_or(false)
    })
}

/// Collector reading the local host's /proc
pub struct ProcfsCollector {
    proc_root: PathBuf,
    sessions: SessionProbe,
    gpu: GpuProbe,
    warmup: Duration,
    previous: Mutex<Option<(Instant, ProcCounters)>>,
}

impl ProcfsCollector {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Create collector with custom proc path (for testing)
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sessions: SessionProbe::Who,
            gpu: GpuProbe::NvidiaSmi,
            warmup: Duration::from_secs(1),
            previous: Mutex::new(None),
        }
    }

    pub fn with_sessions(mut self, probe: SessionProbe) -> Self {
        self.sessions = probe;
        self
    }

    pub fn with_gpu(mut self, probe: GpuProbe) -> Self {
        self.gpu = probe;
        self
    }

    /// Interval between the two readings taken on the first call
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    async fn read(&self, relative: &str) -> IdleResult<String> {
        let path = self.proc_root.join(relative);
        read_proc_file(&path).await
    }

    /// Read every counter once
    pub async fn read_counters(&self) -> IdleResult<ProcCounters> {
        let stat = self.read("stat").await?;
        let meminfo = self.read("meminfo").await?;
        let net = self.read("net/dev").await?;
        let disk = self.read("diskstats").await?;

        Ok(ProcCounters {
            cpu: parse_cpu_times(&stat)?,
            net_bytes: parse_net_bytes(&net),
            disk_sectors: parse_disk_sectors(&disk),
            memory_percent: parse_mem_used_percent(&meminfo)?,
        })
    }
}

impl Default for ProcfsCollector {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_proc_file(path: &Path) -> IdleResult<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| IdleError::Collection(format!("failed to read {}: {}", path.display(), e)))
}

/// Rates between two readings: (cpu %, network KB/s, disk KB/s)
fn rates(prev: &ProcCounters, cur: &ProcCounters, elapsed: Duration) -> (f64, f64, f64) {
    let total = cur.cpu.total.saturating_sub(prev.cpu.total);
    let busy = cur.cpu.busy.saturating_sub(prev.cpu.busy);
    let cpu = if total == 0 {
        0.0
    } else {
        busy as f64 / total as f64 * 100.0
    };

    let secs = elapsed.as_secs_f64().max(0.001);
    let net = cur.net_bytes.saturating_sub(prev.net_bytes) as f64 / 1024.0 / secs;
    let disk = cur.disk_sectors.saturating_sub(prev.disk_sectors) as f64
        * SECTOR_BYTES as f64
        / 1024.0
        / secs;

    (cpu, net, disk)
}

#[async_trait]
impl MetricsCollector for ProcfsCollector {
    async fn collect(&self, instance: &Instance) -> IdleResult<MetricSample> {
        let mut previous = self.previous.lock().await;

        let (prev_at, prev) = match *previous {
            Some(reading) => reading,
            None => {
                let first = self.read_counters().await?;
                let at = Instant::now();
                tokio::time::sleep(self.warmup).await;
                (at, first)
            }
        };

        let current = self.read_counters().await?;
        let now = Instant::now();
        let (cpu_percent, network_kbps, disk_kbps) =
            rates(&prev, &current, now.duration_since(prev_at));
        *previous = Some((now, current));
        drop(previous);

        let interactive_sessions = self.sessions.count().await?;
        let gpu_percent = self.gpu.utilization().await;

        Ok(MetricSample {
            instance_id: instance.id.clone(),
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent: current.memory_percent,
            network_kbps,
            disk_kbps,
            gpu_percent,
            interactive_sessions,
            source: MetricSource::LocalAgent,
        })
    }
}
