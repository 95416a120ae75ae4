//! Operator-facing inspection and overrides
//!
//! The status board holds the latest evaluation per instance. Overrides
//! bypass the pipeline and are always audited.

use crate::audit::AuditLog;
use crate::detector::InstanceInventory;
use crate::error::{IdleError, IdleResult};
use crate::executor::{ActionExecutor, ActionOutcome, ActionRequest};
use crate::models::{
    ActionKind, AuditEntry, AuditOutcome, Classification, IdleAction, IdleRecord, IdleStatus,
    Instance, MetricSample, Stage,
};
use crate::policy::{PolicyResolver, ThresholdProfile};
use crate::state::StateSync;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Latest evaluation of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub classification: Classification,
    pub stage: Stage,
    pub reason: String,
    pub profile: String,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_action: IdleAction,
    pub quiet_minutes: i64,
    pub evaluated_by: String,
    pub evaluated_at: DateTime<Utc>,
    pub last_sample: MetricSample,
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: DashMap<String, InstanceStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: InstanceStatus) {
        self.entries.insert(status.instance_id.clone(), status);
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.entries.get(instance_id).map(|e| e.value().clone())
    }

    /// All entries, ordered by instance id
    pub fn list(&self) -> Vec<InstanceStatus> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }
}

/// Everything known about one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance: Instance,
    pub record: Option<IdleRecord>,
    pub status: Option<InstanceStatus>,
    pub profile: ThresholdProfile,
    pub profile_override_applied: bool,
}

pub struct AdminService {
    inventory: Arc<dyn InstanceInventory>,
    resolver: Arc<PolicyResolver>,
    sync: StateSync,
    audit: Arc<AuditLog>,
    board: Arc<StatusBoard>,
    executor: Option<Arc<ActionExecutor>>,
}

impl AdminService {
    /// `sync` should carry the operator's writer name
    pub fn new(
        inventory: Arc<dyn InstanceInventory>,
        resolver: Arc<PolicyResolver>,
        sync: StateSync,
        audit: Arc<AuditLog>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            inventory,
            resolver,
            sync,
            audit,
            board,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    async fn instance(&self, instance_id: &str) -> IdleResult<Instance> {
        self.inventory
            .get(instance_id)
            .await?
            .ok_or_else(|| IdleError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn status(&self, instance_id: &str) -> IdleResult<InstanceView> {
        let instance = self.instance(instance_id).await?;
        let resolved = self.resolver.resolve(&instance);
        Ok(InstanceView {
            record: self.sync.current(&instance.id).await?,
            status: self.board.get(&instance.id),
            profile: resolved.profile,
            profile_override_applied: resolved.override_applied,
            instance,
        })
    }

    pub async fn list(&self) -> Vec<InstanceStatus> {
        self.board.list()
    }

    pub async fn audit(
        &self,
        instance_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> IdleResult<Vec<AuditEntry>> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(IdleError::InvalidRequest(
                    "`from` must not be after `to`".to_string(),
                ));
            }
        }
        let instance = self.instance(instance_id).await?;
        Ok(self.audit.query(&instance.id, from, to).await)
    }

    /// Write `idle_status`/`idle_action` directly
    pub async fn force_state(
        &self,
        instance_id: &str,
        status: IdleStatus,
        action: IdleAction,
        reason: &str,
    ) -> IdleResult<IdleRecord> {
        if status == IdleStatus::Active && action != IdleAction::None {
            return Err(IdleError::InvalidRequest(
                "an active instance cannot carry an idle action".to_string(),
            ));
        }

        let instance = self.instance(instance_id).await?;
        let record = self.sync.force(&instance.id, status, action).await?;

        self.audit
            .record(AuditEntry::new(
                &instance.id,
                self.sync.writer(),
                AuditOutcome::Overridden,
                format!("forced {}/{}: {}", status, action, reason),
            ))
            .await;

        Ok(record)
    }

    /// Run an action now, opening an idle episode if none is open.
    ///
    /// `action` defaults to the instance's effective profile action.
    pub async fn trigger_action(
        &self,
        instance_id: &str,
        action: Option<ActionKind>,
        reason: &str,
    ) -> IdleResult<ActionOutcome> {
        let executor = self.executor.as_ref().ok_or_else(|| {
            IdleError::InvalidRequest("no executor is configured on this node".to_string())
        })?;

        let instance = self.instance(instance_id).await?;
        if !instance.is_running() {
            return Err(IdleError::InvalidRequest(format!(
                "instance {} is not running",
                instance.id
            )));
        }

        let resolved = self.resolver.resolve(&instance);
        let action = action.unwrap_or(resolved.profile.action);

        let record = match self.sync.current(&instance.id).await? {
            Some(record) if record.episode_id().is_some() => record,
            _ => {
                self.sync
                    .force(&instance.id, IdleStatus::Idle, IdleAction::None)
                    .await?
            }
        };
        if record.idle_action != IdleAction::None {
            return Err(IdleError::InvalidRequest(format!(
                "episode already has action {}",
                record.idle_action
            )));
        }
        let Some(episode) = record.episode_id() else {
            return Err(IdleError::StateStore(format!(
                "no open episode for {} after override",
                instance.id
            )));
        };

        let idle_minutes = record
            .idle_since
            .map(|since| (Utc::now() - since).num_minutes().max(0))
            .unwrap_or(0);

        self.audit
            .record(
                AuditEntry::new(
                    &instance.id,
                    self.sync.writer(),
                    AuditOutcome::Overridden,
                    format!("triggered {}: {}", action, reason),
                )
                .with_action(action),
            )
            .await;
        info!(instance_id = %instance.id, action = %action, "Operator triggered action");

        executor
            .execute(&ActionRequest {
                instance,
                episode,
                action,
                idle_minutes,
                notify: resolved.profile.notification,
                reason: format!("operator: {}", reason),
            })
            .await
    }
}
