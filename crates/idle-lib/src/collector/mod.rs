//! Metric collection for idle detection
//!
//! This module provides collectors that produce one `MetricSample` per
//! call, either from the local host (`/proc` plus session and GPU probes)
//! or through a remote command channel that runs the local sampler on the
//! instance.

mod probe;
mod procfs;
mod remote;


pub use probe::{run_probe, GpuProbe, SessionProbe};
pub use procfs::{
    parse_cpu_times, parse_disk_sectors, parse_mem_used_percent, parse_net_bytes, CpuTimes,
    ProcCounters, ProcfsCollector,
};
pub use remote::{RemoteCollector, RemoteCommandChannel};

use crate::error::IdleResult;
use crate::models::{Instance, MetricSample};
use async_trait::async_trait;

/// Trait for metric collection implementations
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Collect one point-in-time sample for an instance
    async fn collect(&self, instance: &Instance) -> IdleResult<MetricSample>;
}
