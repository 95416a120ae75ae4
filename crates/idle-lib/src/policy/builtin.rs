//! Built-in profiles used when the policy source names none

use super::ThresholdProfile;
use crate::models::ActionKind;
use std::collections::HashMap;

pub const DEFAULT_PROFILE_NAME: &str = "standard";

/// Default spacing between checks for built-in profiles
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

#[allow(clippy::too_many_arguments)]
fn profile(
    name: &str,
    cpu: f64,
    mem: f64,
    net: f64,
    disk: f64,
    gpu: f64,
    idle_minutes: u64,
    action: ActionKind,
) -> ThresholdProfile {
    ThresholdProfile {
        name: name.to_string(),
        cpu_percent: cpu,
        memory_percent: mem,
        network_kbps: net,
        disk_kbps: disk,
        gpu_percent: gpu,
        idle_minutes,
        check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
        action,
        notification: true,
    }
}

pub fn builtin_profiles() -> HashMap<String, ThresholdProfile> {
    [
        profile("standard", 10.0, 30.0, 50.0, 100.0, 5.0, 30, ActionKind::Stop),
        profile("batch", 5.0, 20.0, 25.0, 50.0, 3.0, 60, ActionKind::Hibernate),
        profile("gpu", 5.0, 20.0, 50.0, 100.0, 3.0, 15, ActionKind::Stop),
        profile("data-intensive", 8.0, 40.0, 100.0, 200.0, 5.0, 45, ActionKind::Stop),
    ]
    .into_iter()
    .map(|p| (p.name.clone(), p))
    .collect()
}

pub fn builtin_domain_mappings() -> HashMap<String, String> {
    [
        ("machine-learning", "gpu"),
        ("genomics", "batch"),
        ("data-science", "standard"),
        ("climate-science", "batch"),
        ("visualization", "gpu"),
        ("neuroimaging", "gpu"),
        ("hpc", "batch"),
    ]
    .into_iter()
    .map(|(domain, profile)| (domain.to_string(), profile.to_string()))
    .collect()
}
