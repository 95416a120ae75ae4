//! Threshold profiles and hierarchical policy resolution
//!
//! Three layers feed one effective profile per instance:
//! - the global default (mandatory, fully specified)
//! - a named domain profile, picked from the instance's profile reference
//!   or its workload domain tag
//! - a per-instance override
//!
//! Merging is a pure function; nothing here holds mutable global state.

mod builtin;
mod resolver;

pub use builtin::{builtin_domain_mappings, builtin_profiles, DEFAULT_PROFILE_NAME};
pub use resolver::{merge, PolicyResolver, ResolvedProfile};

use crate::models::ActionKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Fully resolved threshold set, immutable for one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProfile {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_kbps: f64,
    pub disk_kbps: f64,
    pub gpu_percent: f64,
    pub idle_minutes: u64,
    pub check_interval_secs: u64,
    pub action: ActionKind,
    pub notification: bool,
}

impl ThresholdProfile {
    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs(self.idle_minutes * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Lift into a layer with every field set
    pub fn to_partial(&self) -> PartialProfile {
        PartialProfile {
            profile: None,
            cpu_percent: Some(self.cpu_percent),
            memory_percent: Some(self.memory_percent),
            network_kbps: Some(self.network_kbps),
            disk_kbps: Some(self.disk_kbps),
            gpu_percent: Some(self.gpu_percent),
            idle_minutes: Some(self.idle_minutes),
            check_interval_secs: Some(self.check_interval_secs),
            action: Some(self.action),
            notification: Some(self.notification),
        }
    }
}

/// One configuration layer; absent fields fall through to the layer below
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialProfile {
    /// On an instance override, names a profile that replaces the domain layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<bool>,
}

/// Policy configuration source as consumed by the resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Name given to the global layer in resolved profiles
    #[serde(default = "default_global_name")]
    pub default_profile: String,
    /// Mandatory global default; every field must be present
    #[serde(default = "default_global")]
    pub global: PartialProfile,
    /// Named domain profiles (built-ins are used when empty)
    #[serde(default)]
    pub profiles: HashMap<String, PartialProfile>,
    /// Workload domain -> profile name (built-ins are used when empty)
    #[serde(default)]
    pub domain_mappings: HashMap<String, String>,
    /// Per-instance overrides, keyed by instance id or name
    #[serde(default)]
    pub instance_overrides: HashMap<String, PartialProfile>,
}

fn default_global_name() -> String {
    DEFAULT_PROFILE_NAME.to_string()
}

fn default_global() -> PartialProfile {
    builtin_profiles()
        .remove(DEFAULT_PROFILE_NAME)
        .map(|p| p.to_partial())
        .unwrap_or_default()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_profile: default_global_name(),
            global: default_global(),
            profiles: HashMap::new(),
            domain_mappings: HashMap::new(),
            instance_overrides: HashMap::new(),
        }
    }
}
