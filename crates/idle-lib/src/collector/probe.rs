//! External command probes: interactive sessions and GPU utilization

use crate::error::{IdleError, IdleResult};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a program and return its stdout, failing on non-zero exit
pub async fn run_probe(program: &str, args: &[&str], timeout: Duration) -> IdleResult<String> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| IdleError::timeout(program, timeout))?
        .map_err(|e| IdleError::Collection(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(IdleError::Collection(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Source of the interactive-session count
#[derive(Debug, Clone)]
pub enum SessionProbe {
    /// Count non-root logins reported by `who`
    Who,
    /// Fixed count, for hosts without login accounting and for tests
    Fixed(u32),
}

impl SessionProbe {
    pub async fn count(&self) -> IdleResult<u32> {
        match self {
            SessionProbe::Who => {
                let output = run_probe("who", &[], PROBE_TIMEOUT).await?;
                Ok(count_user_sessions(&output))
            }
            SessionProbe::Fixed(count) => Ok(*count),
        }
    }
}

/// Count `who` lines that are not root logins
pub fn count_user_sessions(who_output: &str) -> u32 {
    who_output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.starts_with("root"))
        .count() as u32
}

/// Source of accelerator utilization
#[derive(Debug, Clone)]
pub enum GpuProbe {
    /// Query `nvidia-smi`; hosts without it report no GPU
    NvidiaSmi,
    Fixed(Option<f64>),
    None,
}

impl GpuProbe {
    pub async fn utilization(&self) -> Option<f64> {
        match self {
            GpuProbe::NvidiaSmi => {
                match run_probe(
                    "nvidia-smi",
                    &["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"],
                    PROBE_TIMEOUT,
                )
                .await
                {
                    Ok(output) => parse_gpu_utilization(&output),
                    Err(e) => {
                        debug!(error = %e, "No GPU utilization available");
                        None
                    }
                }
            }
            GpuProbe::Fixed(value) => *value,
            GpuProbe::None => None,
        }
    }
}

/// Highest utilization across all listed GPUs
pub fn parse_gpu_utilization(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
}
