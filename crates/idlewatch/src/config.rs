//! Daemon configuration
//!
//! Loaded from an optional file layered under `IDLEWATCH__*` environment
//! variables. Every field has a default, so an empty configuration runs the
//! fleet detector with the built-in policy.

use anyhow::{bail, Context, Result};
use idle_lib::agent::AgentConfig;
use idle_lib::audit::AuditConfig;
use idle_lib::detector::FleetConfig;
use idle_lib::executor::ExecutorConfig;
use idle_lib::models::{Instance, RunningState};
use idle_lib::platform::CommandConfig;
use idle_lib::policy::PolicyConfig;
use idle_lib::state::SyncConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// API server port for health, metrics and admin endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory backing the shared state store
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// JSON-lines audit file; memory only when unset
    #[serde(default)]
    pub audit_path: Option<PathBuf>,

    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,

    #[serde(default)]
    pub fleet: FleetSection,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub platform: PlatformSection,

    #[serde(default)]
    pub policy: PolicyConfig,

    /// Static inventory
    #[serde(default)]
    pub instances: Vec<Instance>,

    #[serde(default)]
    pub notification: NotificationSection,
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/idlewatch/state")
}

fn default_audit_max_entries() -> usize {
    50_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub interval_secs: u64,
    pub max_concurrent: usize,
    pub instance_timeout_secs: u64,
    /// Act on confirmed idleness; when off it is only recorded
    pub auto_execute: bool,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_concurrent: 5,
            instance_timeout_secs: 30,
            auto_execute: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub interval_secs: u64,
    pub lock_path: PathBuf,
    pub lock_stale_secs: u64,
    pub profile_cache_path: PathBuf,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            lock_path: defaults.lock_path,
            lock_stale_secs: defaults.lock_stale.as_secs(),
            profile_cache_path: defaults.profile_cache_path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub dry_run: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_actions_per_hour: u32,
    pub claim_settle_ms: u64,
    pub conflict_window_secs: u64,
    /// Age after which an unfinished hibernate/stop claim is re-driven
    pub claim_stale_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            max_actions_per_hour: 10,
            claim_settle_ms: 2_000,
            conflict_window_secs: 120,
            claim_stale_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    pub shell: String,
    pub probe_command: String,
    pub stop_command: String,
    /// Empty disables hibernation
    pub hibernate_command: String,
    pub unsupported_markers: Vec<String>,
    pub in_progress_markers: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for PlatformSection {
    fn default() -> Self {
        let defaults = CommandConfig::default();
        Self {
            shell: defaults.shell,
            probe_command: defaults.probe,
            stop_command: defaults.stop,
            hibernate_command: defaults.hibernate.unwrap_or_default(),
            unsupported_markers: defaults.unsupported_markers,
            in_progress_markers: defaults.in_progress_markers,
            command_timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
    pub dedup_window_secs: u64,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
            dedup_window_secs: 15 * 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("IDLEWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fleet.interval_secs == 0 || self.agent.interval_secs == 0 {
            bail!("fleet and agent intervals must be non-zero");
        }
        if self.fleet.max_concurrent == 0 {
            bail!("fleet.max_concurrent must be at least 1");
        }
        if self.executor.max_attempts == 0 {
            bail!("executor.max_attempts must be at least 1");
        }
        let retry_budget_ms = self
            .executor
            .max_backoff_ms
            .saturating_mul(u64::from(self.executor.max_attempts));
        if self.executor.claim_stale_secs.saturating_mul(1_000) <= retry_budget_ms {
            bail!("executor.claim_stale_secs must exceed the total retry backoff");
        }
        if self.platform.stop_command.trim().is_empty() {
            bail!("platform.stop_command must be set");
        }
        Ok(())
    }

    /// Static inventory; entries without a reported state count as running
    pub fn inventory(&self) -> Vec<Instance> {
        self.instances
            .iter()
            .cloned()
            .map(|mut instance| {
                if instance.state == RunningState::Unknown {
                    instance.state = RunningState::Running;
                }
                instance
            })
            .collect()
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            interval: Duration::from_secs(self.fleet.interval_secs),
            max_concurrent: self.fleet.max_concurrent,
            instance_timeout: Duration::from_secs(self.fleet.instance_timeout_secs),
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            interval: Duration::from_secs(self.agent.interval_secs),
            lock_path: self.agent.lock_path.clone(),
            lock_stale: Duration::from_secs(self.agent.lock_stale_secs),
            profile_cache_path: self.agent.profile_cache_path.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            dry_run: self.executor.dry_run,
            max_attempts: self.executor.max_attempts,
            initial_backoff: Duration::from_millis(self.executor.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.executor.max_backoff_ms),
            max_actions_per_hour: self.executor.max_actions_per_hour,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            claim_settle: Duration::from_millis(self.executor.claim_settle_ms),
            conflict_window: Duration::from_secs(self.executor.conflict_window_secs),
            claim_stale: Duration::from_secs(self.executor.claim_stale_secs),
            ..SyncConfig::default()
        }
    }

    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            max_entries: self.audit_max_entries,
            path: self.audit_path.clone(),
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        let hibernate = self.platform.hibernate_command.trim();
        CommandConfig {
            shell: self.platform.shell.clone(),
            probe: self.platform.probe_command.clone(),
            stop: self.platform.stop_command.clone(),
            hibernate: (!hibernate.is_empty()).then(|| hibernate.to_string()),
            unsupported_markers: self.platform.unsupported_markers.clone(),
            in_progress_markers: self.platform.in_progress_markers.clone(),
            timeout: Duration::from_secs(self.platform.command_timeout_secs),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            state_dir: default_state_dir(),
            audit_path: None,
            audit_max_entries: default_audit_max_entries(),
            fleet: FleetSection::default(),
            agent: AgentSection::default(),
            executor: ExecutorSection::default(),
            platform: PlatformSection::default(),
            policy: PolicyConfig::default(),
            instances: Vec::new(),
            notification: NotificationSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_configuration_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.fleet.interval_secs, 60);
        assert!(config.fleet.auto_execute);
        assert_eq!(config.agent.interval_secs, 120);
        assert!(config.instances.is_empty());
        assert_eq!(config.sync_config().conflict_window, Duration::from_secs(120));
    }

    #[test]
    fn test_file_sections_are_read() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
api_port = 9100

[fleet]
interval_secs = 30
auto_execute = false

[executor]
dry_run = true

[platform]
hibernate_command = ""

[[instances]]
id = "i-0abc"
domain = "genomics"

[policy.instance_overrides.i-0abc]
idle_minutes = 15
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.fleet_config().interval, Duration::from_secs(30));
        assert_eq!(config.fleet.max_concurrent, 5);
        assert!(!config.fleet.auto_execute);
        assert!(config.executor_config().dry_run);
        assert!(config.command_config().hibernate.is_none());
        assert_eq!(config.instances[0].id, "i-0abc");
        assert_eq!(config.inventory()[0].state, RunningState::Running);
        assert_eq!(
            config.policy.instance_overrides["i-0abc"].idle_minutes,
            Some(15)
        );
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = AppConfig::default();
        config.fleet.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_staleness_must_outlast_retries() {
        let config = AppConfig::default();
        assert_eq!(config.sync_config().claim_stale, Duration::from_secs(900));
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.executor.claim_stale_secs = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("claim_stale_secs"));
    }
}
