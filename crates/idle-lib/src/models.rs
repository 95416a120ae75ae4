//! Core data models shared by the fleet detector and the local agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-reported lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Hibernated,
    Terminated,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A pre-provisioned compute instance as reported by the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: RunningState,
    #[serde(default = "default_reachable")]
    pub reachable: bool,
    /// `None` until the platform has been asked to hibernate it once
    #[serde(default)]
    pub hibernation_capable: Option<bool>,
    /// Workload domain tag (e.g. "machine-learning")
    #[serde(default)]
    pub domain: Option<String>,
    /// Explicit profile reference, takes precedence over the domain mapping
    #[serde(default)]
    pub profile: Option<String>,
    /// Address used by the remote command channel
    #[serde(default)]
    pub address: Option<String>,
}

fn default_reachable() -> bool {
    true
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            state: RunningState::Running,
            reachable: true,
            hibernation_capable: None,
            domain: None,
            profile: None,
            address: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunningState::Running
    }

    /// Name for log lines, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Which scheduler produced a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricSource {
    LocalAgent,
    FleetDetector,
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSource::LocalAgent => write!(f, "local-agent"),
            MetricSource::FleetDetector => write!(f, "fleet-detector"),
        }
    }
}

/// Point-in-time utilization sample for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_kbps: f64,
    pub disk_kbps: f64,
    /// Absent on hosts without an accelerator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f64>,
    pub interactive_sessions: u32,
    pub source: MetricSource,
}

/// Projection of the shared idle state for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleStatus {
    #[default]
    Active,
    Idle,
}

impl fmt::Display for IdleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleStatus::Active => write!(f, "active"),
            IdleStatus::Idle => write!(f, "idle"),
        }
    }
}

/// Progress of the terminal action for the current idle episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleAction {
    #[default]
    None,
    Hibernating,
    Hibernated,
    Stopping,
    Stopped,
    Notified,
}

impl IdleAction {
    fn rank(self) -> u8 {
        match self {
            IdleAction::None => 0,
            IdleAction::Hibernating | IdleAction::Stopping => 1,
            IdleAction::Hibernated | IdleAction::Stopped | IdleAction::Notified => 2,
        }
    }

    /// Whether a transition from `self` to `next` moves forward.
    ///
    /// Hibernating -> Stopping is the only lateral move, used when the
    /// platform turns out not to support hibernation.
    pub fn can_advance_to(self, next: IdleAction) -> bool {
        next.rank() > self.rank()
            || (self == IdleAction::Hibernating && next == IdleAction::Stopping)
    }

    pub fn is_in_flight(self) -> bool {
        self.rank() == 1
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for IdleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdleAction::None => "none",
            IdleAction::Hibernating => "hibernating",
            IdleAction::Hibernated => "hibernated",
            IdleAction::Stopping => "stopping",
            IdleAction::Stopped => "stopped",
            IdleAction::Notified => "notified",
        };
        write!(f, "{}", s)
    }
}

/// The fixed key set kept per instance in the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleRecord {
    pub instance_id: String,
    pub idle_status: IdleStatus,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_action: IdleAction,
    pub last_writer: String,
    pub last_updated: DateTime<Utc>,
}

impl IdleRecord {
    /// Record used when the store has nothing for an instance yet
    pub fn fresh(instance_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            idle_status: IdleStatus::Active,
            idle_since: None,
            idle_action: IdleAction::None,
            last_writer: String::new(),
            last_updated: now,
        }
    }

    /// Identifier of the current idle episode, if one is open
    pub fn episode_id(&self) -> Option<String> {
        match (self.idle_status, self.idle_since) {
            (IdleStatus::Idle, Some(since)) => Some(episode_id(&self.instance_id, since)),
            _ => None,
        }
    }
}

/// `<instance id>@<idle_since unix seconds>`
pub fn episode_id(instance_id: &str, idle_since: DateTime<Utc>) -> String {
    format!("{}@{}", instance_id, idle_since.timestamp())
}

/// Output of the classification pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Active,
    Working,
    IdleCandidate,
    IdleConfirmed,
}

impl Classification {
    pub fn is_quiet(self) -> bool {
        matches!(self, Classification::IdleCandidate | Classification::IdleConfirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Active => "active",
            Classification::Working => "working",
            Classification::IdleCandidate => "idle-candidate",
            Classification::IdleConfirmed => "idle-confirmed",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    InteractiveSession,
    BackgroundWork,
    SustainedQuiet,
}

/// Lifecycle action configured on a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Stop,
    Hibernate,
    Notify,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Stop => "stop",
            ActionKind::Hibernate => "hibernate",
            ActionKind::Notify => "notify",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result recorded in an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Classified,
    Unreachable,
    Completed,
    Fallback,
    NoOp,
    Failed,
    DryRun,
    RateLimited,
    Deferred,
    Overridden,
    /// An abandoned in-flight claim was taken over and re-driven
    Recovered,
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: Option<Stage>,
    pub decision: Option<Classification>,
    pub action: Option<ActionKind>,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricSample>,
}

impl AuditEntry {
    pub fn new(
        instance_id: impl Into<String>,
        actor: impl Into<String>,
        outcome: AuditOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp: Utc::now(),
            stage: None,
            decision: None,
            action: None,
            actor: actor.into(),
            outcome,
            reason: reason.into(),
            idle_minutes: None,
            metrics: None,
        }
    }

    pub fn with_decision(mut self, stage: Stage, decision: Classification) -> Self {
        self.stage = Some(stage);
        self.decision = Some(decision);
        self
    }

    pub fn with_action(mut self, action: ActionKind) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_metrics(mut self, sample: MetricSample) -> Self {
        self.metrics = Some(sample);
        self
    }

    pub fn with_idle_minutes(mut self, minutes: i64) -> Self {
        self.idle_minutes = Some(minutes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_action_only_moves_forward() {
        assert!(IdleAction::None.can_advance_to(IdleAction::Stopping));
        assert!(IdleAction::None.can_advance_to(IdleAction::Hibernating));
        assert!(IdleAction::Stopping.can_advance_to(IdleAction::Stopped));
        assert!(IdleAction::Hibernating.can_advance_to(IdleAction::Stopping));

        assert!(!IdleAction::Stopped.can_advance_to(IdleAction::None));
        assert!(!IdleAction::Stopping.can_advance_to(IdleAction::Hibernating));
        assert!(!IdleAction::Stopped.can_advance_to(IdleAction::Stopping));
        assert!(!IdleAction::Stopping.can_advance_to(IdleAction::Stopping));
    }

    #[test]
    fn test_episode_id_requires_open_idle_record() {
        let now = Utc::now();
        let mut record = IdleRecord::fresh("i-1", now);
        assert!(record.episode_id().is_none());

        record.idle_status = IdleStatus::Idle;
        record.idle_since = Some(now);
        assert_eq!(
            record.episode_id().unwrap(),
            format!("i-1@{}", now.timestamp())
        );
    }

    #[test]
    fn test_instance_deserializes_with_defaults() {
        let instance: Instance = serde_json::from_str(r#"{"id": "i-abc"}"#).unwrap();
        assert_eq!(instance.state, RunningState::Unknown);
        assert!(instance.reachable);
        assert!(instance.hibernation_capable.is_none());
        assert_eq!(instance.display_name(), "i-abc");
    }

    #[test]
    fn test_unknown_running_state_is_tolerated() {
        let state: RunningState = serde_json::from_str(r#""shutting-down""#).unwrap();
        assert_eq!(state, RunningState::Unknown);
    }
}
