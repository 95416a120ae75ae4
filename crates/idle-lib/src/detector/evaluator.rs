//! Per-instance evaluation shared by both schedulers
//!
//! Publishes the classification, audits it, and on confirmation hands the
//! episode to the executor.

use crate::admin::{InstanceStatus, StatusBoard};
use crate::audit::AuditLog;
use crate::error::IdleResult;
use crate::executor::{ActionExecutor, ActionOutcome, ActionRequest};
use crate::models::{ActionKind, AuditEntry, AuditOutcome, Classification, IdleAction, Instance, MetricSample};
use crate::observability::{IdleMetrics, StructuredLogger};
use crate::policy::ThresholdProfile;
use crate::state::StateSync;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one evaluation decided and did
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub instance_id: String,
    pub classification: Classification,
    pub quiet_minutes: i64,
    pub deferred_to: Option<String>,
    /// `None` unless the instance was confirmed idle and an action was taken or declined
    pub action: Option<Result<ActionOutcome, String>>,
}

pub struct Evaluator {
    sync: StateSync,
    executor: Option<Arc<ActionExecutor>>,
    audit: Arc<AuditLog>,
    board: Option<Arc<StatusBoard>>,
    metrics: IdleMetrics,
    logger: StructuredLogger,
}

impl Evaluator {
    /// `executor` is `None` when confirmed idleness should only be recorded
    pub fn new(sync: StateSync, executor: Option<Arc<ActionExecutor>>, audit: Arc<AuditLog>) -> Self {
        let logger = StructuredLogger::new(sync.writer());
        Self {
            sync,
            executor,
            audit,
            board: None,
            metrics: IdleMetrics::new(),
            logger,
        }
    }

    pub fn with_status_board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn actor(&self) -> &str {
        self.sync.writer()
    }

    pub async fn evaluate(
        &self,
        instance: &Instance,
        sample: MetricSample,
        profile: &ThresholdProfile,
    ) -> IdleResult<Evaluation> {
        let observation = match self.sync.observe(&sample, profile).await {
            Ok(observation) => observation,
            Err(e) => {
                self.record_failure(&instance.id, format!("state store unavailable: {}", e))
                    .await;
                return Err(e);
            }
        };
        let outcome = &observation.outcome;
        let quiet_minutes = outcome.quiet_minutes();

        self.metrics.inc_classification(outcome.classification);
        self.logger.log_classification(
            &instance.id,
            outcome.classification,
            outcome.stage,
            &outcome.reason,
        );

        let mut entry = AuditEntry::new(
            &instance.id,
            self.actor(),
            AuditOutcome::Classified,
            &outcome.reason,
        )
        .with_decision(outcome.stage, outcome.classification)
        .with_metrics(sample.clone());
        if outcome.classification.is_quiet() {
            entry = entry.with_idle_minutes(quiet_minutes);
        }
        self.audit.record(entry).await;

        if let Some(board) = &self.board {
            board.update(InstanceStatus {
                instance_id: instance.id.clone(),
                classification: outcome.classification,
                stage: outcome.stage,
                reason: outcome.reason.clone(),
                profile: profile.name.clone(),
                idle_since: observation.record.idle_since,
                idle_action: observation.record.idle_action,
                quiet_minutes,
                evaluated_by: self.actor().to_string(),
                evaluated_at: Utc::now(),
                last_sample: sample,
            });
        }

        let mut evaluation = Evaluation {
            instance_id: instance.id.clone(),
            classification: outcome.classification,
            quiet_minutes,
            deferred_to: observation.deferred_to.clone(),
            action: None,
        };

        let Some(episode) = observation.confirmed_episode() else {
            return Ok(evaluation);
        };

        let record = &observation.record;
        if record.idle_action != IdleAction::None {
            if self.sync.claim_is_stale(record, Utc::now()) {
                let action = match record.idle_action {
                    IdleAction::Hibernating => ActionKind::Hibernate,
                    _ => ActionKind::Stop,
                };
                let request = ActionRequest {
                    instance: instance.clone(),
                    episode,
                    action,
                    idle_minutes: quiet_minutes,
                    notify: profile.notification,
                    reason: format!(
                        "{} by {} not updated since {}",
                        record.idle_action,
                        record.last_writer,
                        record.last_updated.to_rfc3339()
                    ),
                };
                evaluation.action = self.dispatch(request, true).await;
                return Ok(evaluation);
            }

            debug!(
                instance_id = %instance.id,
                action = %record.idle_action,
                "Episode already has an action"
            );
            if record.last_writer != self.actor() && record.idle_action != IdleAction::Notified {
                self.audit
                    .record(
                        AuditEntry::new(
                            &instance.id,
                            self.actor(),
                            AuditOutcome::NoOp,
                            format!("already {} by {}", record.idle_action, record.last_writer),
                        )
                        .with_idle_minutes(quiet_minutes),
                    )
                    .await;
                evaluation.action = Some(Ok(ActionOutcome::NoOp {
                    holder: Some(record.last_writer.clone()),
                }));
            }
            return Ok(evaluation);
        }

        self.logger
            .log_idle_confirmed(&instance.id, quiet_minutes, profile.action);

        let request = ActionRequest {
            instance: instance.clone(),
            episode,
            action: profile.action,
            idle_minutes: quiet_minutes,
            notify: profile.notification,
            reason: format!(
                "idle for {}m (profile {} requires {}m)",
                quiet_minutes, profile.name, profile.idle_minutes
            ),
        };
        evaluation.action = self.dispatch(request, false).await;

        Ok(evaluation)
    }

    /// Hand a request to the executor, or record that execution is disabled
    async fn dispatch(
        &self,
        request: ActionRequest,
        recovering: bool,
    ) -> Option<Result<ActionOutcome, String>> {
        let Some(executor) = &self.executor else {
            self.audit
                .record(
                    AuditEntry::new(
                        &request.instance.id,
                        self.actor(),
                        AuditOutcome::Deferred,
                        "automatic execution disabled",
                    )
                    .with_action(request.action)
                    .with_idle_minutes(request.idle_minutes),
                )
                .await;
            return None;
        };

        let result = if recovering {
            executor.recover(&request).await
        } else {
            executor.execute(&request).await
        };
        Some(result.map_err(|e| {
            warn!(instance_id = %request.instance.id, error = %e, "Action did not complete");
            e.to_string()
        }))
    }

    /// Audit a check that ended before a classification was published
    pub async fn record_failure(&self, instance_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(instance_id = %instance_id, reason = %reason, "Check failed");
        self.audit
            .record(AuditEntry::new(
                instance_id,
                self.actor(),
                AuditOutcome::Failed,
                reason,
            ))
            .await;
    }
}
