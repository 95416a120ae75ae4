//! Field-by-field merge of policy layers

use super::{builtin_domain_mappings, builtin_profiles, PartialProfile, PolicyConfig, ThresholdProfile};
use crate::error::{IdleError, IdleResult};
use crate::models::Instance;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Effective profile plus where its layers came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub profile: ThresholdProfile,
    /// Name of the domain layer that was applied, if any
    pub domain_profile: Option<String>,
    /// Whether a per-instance override contributed
    pub override_applied: bool,
}

/// Merge three layers into one total profile.
///
/// Precedence per field: instance override > domain profile > global default.
pub fn merge(
    global: &ThresholdProfile,
    domain: Option<(&str, &PartialProfile)>,
    instance: Option<&PartialProfile>,
) -> ThresholdProfile {
    let domain_layer = domain.map(|(_, layer)| layer);

    macro_rules! pick {
        ($field:ident) => {
            instance
                .and_then(|layer| layer.$field)
                .or_else(|| domain_layer.and_then(|layer| layer.$field))
                .unwrap_or(global.$field)
        };
    }

    ThresholdProfile {
        name: domain
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| global.name.clone()),
        cpu_percent: pick!(cpu_percent),
        memory_percent: pick!(memory_percent),
        network_kbps: pick!(network_kbps),
        disk_kbps: pick!(disk_kbps),
        gpu_percent: pick!(gpu_percent),
        idle_minutes: pick!(idle_minutes),
        check_interval_secs: pick!(check_interval_secs),
        action: pick!(action),
        notification: pick!(notification),
    }
}

/// Resolves effective profiles from a validated policy configuration
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    global: ThresholdProfile,
    profiles: HashMap<String, PartialProfile>,
    domain_mappings: HashMap<String, String>,
    overrides: HashMap<String, PartialProfile>,
}

impl PolicyResolver {
    /// Validate the configuration and build a resolver.
    ///
    /// Fails with `ProfileResolution` when the global default is incomplete
    /// or any layer carries a malformed value.
    pub fn new(config: PolicyConfig) -> IdleResult<Self> {
        let global = total_global(&config.default_profile, &config.global)?;

        let profiles = if config.profiles.is_empty() {
            builtin_profiles()
                .into_iter()
                .map(|(name, p)| (name, p.to_partial()))
                .collect()
        } else {
            config.profiles
        };

        let domain_mappings = if config.domain_mappings.is_empty() {
            builtin_domain_mappings()
        } else {
            config.domain_mappings
        };

        for (name, layer) in profiles.iter().chain(config.instance_overrides.iter()) {
            validate_layer(name, layer)?;
        }

        for (domain, profile) in &domain_mappings {
            if !profiles.contains_key(profile) {
                warn!(domain = %domain, profile = %profile, "Domain maps to unknown profile");
            }
        }

        Ok(Self {
            global,
            profiles,
            domain_mappings,
            overrides: config.instance_overrides,
        })
    }

    pub fn global(&self) -> &ThresholdProfile {
        &self.global
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the effective profile for one instance
    pub fn resolve(&self, instance: &Instance) -> ResolvedProfile {
        let override_layer = self
            .overrides
            .get(&instance.id)
            .or_else(|| self.overrides.get(&instance.name));

        let domain_name = override_layer
            .and_then(|layer| layer.profile.clone())
            .or_else(|| instance.profile.clone())
            .or_else(|| {
                instance
                    .domain
                    .as_ref()
                    .and_then(|domain| self.domain_mappings.get(domain).cloned())
            });

        let domain_layer = domain_name.as_deref().and_then(|name| {
            let layer = self.profiles.get(name);
            if layer.is_none() {
                warn!(
                    instance_id = %instance.id,
                    profile = %name,
                    "Unknown profile referenced, falling back to global default"
                );
            }
            layer.map(|layer| (name, layer))
        });

        let profile = merge(&self.global, domain_layer, override_layer);

        debug!(
            instance_id = %instance.id,
            profile = %profile.name,
            idle_minutes = profile.idle_minutes,
            action = %profile.action,
            "Resolved effective profile"
        );

        ResolvedProfile {
            profile,
            domain_profile: domain_layer.map(|(name, _)| name.to_string()),
            override_applied: override_layer.is_some(),
        }
    }
}

fn total_global(name: &str, layer: &PartialProfile) -> IdleResult<ThresholdProfile> {
    fn require<T: Copy>(value: Option<T>, field: &str) -> IdleResult<T> {
        value.ok_or_else(|| {
            IdleError::ProfileResolution(format!("global default is missing `{}`", field))
        })
    }

    let profile = ThresholdProfile {
        name: name.to_string(),
        cpu_percent: require(layer.cpu_percent, "cpu_percent")?,
        memory_percent: require(layer.memory_percent, "memory_percent")?,
        network_kbps: require(layer.network_kbps, "network_kbps")?,
        disk_kbps: require(layer.disk_kbps, "disk_kbps")?,
        gpu_percent: require(layer.gpu_percent, "gpu_percent")?,
        idle_minutes: require(layer.idle_minutes, "idle_minutes")?,
        check_interval_secs: require(layer.check_interval_secs, "check_interval_secs")?,
        action: require(layer.action, "action")?,
        notification: require(layer.notification, "notification")?,
    };

    validate_layer(name, &profile.to_partial())?;
    Ok(profile)
}

/// One year; longer idle windows are configuration mistakes
pub const MAX_IDLE_MINUTES: u64 = 525_600;
/// One day
pub const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;

fn validate_layer(name: &str, layer: &PartialProfile) -> IdleResult<()> {
    let thresholds = [
        ("cpu_percent", layer.cpu_percent),
        ("memory_percent", layer.memory_percent),
        ("network_kbps", layer.network_kbps),
        ("disk_kbps", layer.disk_kbps),
        ("gpu_percent", layer.gpu_percent),
    ];

    for (field, value) in thresholds {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(IdleError::ProfileResolution(format!(
                    "profile `{}` has invalid {}: {}",
                    name, field, v
                )));
            }
        }
    }

    let bounded = [
        ("idle_minutes", layer.idle_minutes, MAX_IDLE_MINUTES),
        ("check_interval_secs", layer.check_interval_secs, MAX_CHECK_INTERVAL_SECS),
    ];
    for (field, value, max) in bounded {
        match value {
            Some(0) => {
                return Err(IdleError::ProfileResolution(format!(
                    "profile `{}` has zero {}",
                    name, field
                )))
            }
            Some(v) if v > max => {
                return Err(IdleError::ProfileResolution(format!(
                    "profile `{}` has {} {} above the limit of {}",
                    name, field, v, max
                )))
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionKind;

    fn gpu_instance() -> Instance {
        let mut instance = Instance::new("i-gpu");
        instance.name = "trainer".to_string();
        instance.domain = Some("machine-learning".to_string());
        instance
    }

    fn layered_config() -> PolicyConfig {
        let mut config = PolicyConfig::default();
        config.global.idle_minutes = Some(60);
        config.profiles.insert(
            "gpu".to_string(),
            PartialProfile {
                idle_minutes: Some(30),
                gpu_percent: Some(3.0),
                ..Default::default()
            },
        );
        config
            .domain_mappings
            .insert("machine-learning".to_string(), "gpu".to_string());
        config
    }

    #[test]
    fn test_instance_override_wins_over_domain_and_global() {
        let mut config = layered_config();
        config.instance_overrides.insert(
            "i-gpu".to_string(),
            PartialProfile {
                idle_minutes: Some(15),
                ..Default::default()
            },
        );

        let resolver = PolicyResolver::new(config).unwrap();
        let resolved = resolver.resolve(&gpu_instance());

        assert_eq!(resolved.profile.idle_minutes, 15);
        assert_eq!(resolved.profile.gpu_percent, 3.0);
        assert_eq!(resolved.domain_profile.as_deref(), Some("gpu"));
        assert!(resolved.override_applied);
    }

    #[test]
    fn test_domain_layer_falls_through_to_global() {
        let resolver = PolicyResolver::new(layered_config()).unwrap();
        let resolved = resolver.resolve(&gpu_instance());

        assert_eq!(resolved.profile.idle_minutes, 30);
        // Not set on the domain layer, so the global value applies
        assert_eq!(resolved.profile.cpu_percent, resolver.global().cpu_percent);
        assert_eq!(resolved.profile.name, "gpu");
        assert!(!resolved.override_applied);
    }

    #[test]
    fn test_override_by_name_and_profile_reference() {
        let mut config = PolicyConfig::default();
        config.instance_overrides.insert(
            "trainer".to_string(),
            PartialProfile {
                profile: Some("batch".to_string()),
                notification: Some(false),
                ..Default::default()
            },
        );

        let resolver = PolicyResolver::new(config).unwrap();
        let resolved = resolver.resolve(&gpu_instance());

        assert_eq!(resolved.profile.name, "batch");
        assert_eq!(resolved.profile.action, ActionKind::Hibernate);
        assert_eq!(resolved.profile.idle_minutes, 60);
        assert!(!resolved.profile.notification);
    }

    #[test]
    fn test_builtin_mappings_apply_without_configuration() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();

        let mut genomics = Instance::new("i-genome");
        genomics.domain = Some("genomics".to_string());
        assert_eq!(resolver.resolve(&genomics).profile.name, "batch");

        let untagged = Instance::new("i-plain");
        let resolved = resolver.resolve(&untagged);
        assert_eq!(resolved.profile.name, "standard");
        assert_eq!(resolved.profile.idle_minutes, 30);
        assert!(resolved.domain_profile.is_none());
    }

    #[test]
    fn test_unknown_profile_reference_falls_back() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let mut instance = Instance::new("i-x");
        instance.profile = Some("does-not-exist".to_string());

        let resolved = resolver.resolve(&instance);
        assert_eq!(resolved.profile, *resolver.global());
    }

    #[test]
    fn test_incomplete_global_is_fatal() {
        let mut config = PolicyConfig::default();
        config.global.action = None;

        let err = PolicyResolver::new(config).unwrap_err();
        assert!(matches!(err, IdleError::ProfileResolution(_)));
        assert!(err.to_string().contains("action"));
    }

    #[test]
    fn test_malformed_thresholds_are_rejected() {
        let mut config = PolicyConfig::default();
        config.global.cpu_percent = Some(-1.0);
        assert!(PolicyResolver::new(config).is_err());

        let mut config = PolicyConfig::default();
        config.instance_overrides.insert(
            "i-1".to_string(),
            PartialProfile {
                idle_minutes: Some(0),
                ..Default::default()
            },
        );
        assert!(PolicyResolver::new(config).is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let mut config = PolicyConfig::default();
        config.global.idle_minutes = Some(MAX_IDLE_MINUTES);
        assert!(PolicyResolver::new(config).is_ok());

        let mut config = PolicyConfig::default();
        config.global.idle_minutes = Some(MAX_IDLE_MINUTES + 1);
        let err = PolicyResolver::new(config).unwrap_err();
        assert!(err.to_string().contains("idle_minutes"));

        let mut config = PolicyConfig::default();
        config.instance_overrides.insert(
            "i-1".to_string(),
            PartialProfile {
                idle_minutes: Some(u64::MAX),
                ..Default::default()
            },
        );
        assert!(PolicyResolver::new(config).is_err());

        let mut config = PolicyConfig::default();
        config.global.check_interval_secs = Some(MAX_CHECK_INTERVAL_SECS + 1);
        let err = PolicyResolver::new(config).unwrap_err();
        assert!(err.to_string().contains("check_interval_secs"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let global = PolicyResolver::new(PolicyConfig::default())
            .unwrap()
            .global()
            .clone();
        let domain = PartialProfile {
            disk_kbps: Some(500.0),
            ..Default::default()
        };
        let instance = PartialProfile {
            disk_kbps: Some(250.0),
            action: Some(ActionKind::Notify),
            ..Default::default()
        };

        let a = merge(&global, Some(("data", &domain)), Some(&instance));
        let b = merge(&global, Some(("data", &domain)), Some(&instance));
        assert_eq!(a, b);
        assert_eq!(a.disk_kbps, 250.0);
        assert_eq!(a.action, ActionKind::Notify);
        assert_eq!(a.memory_percent, global.memory_percent);
    }
}
