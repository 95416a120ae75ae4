//! Claim, act, record

use super::notify::{Notice, NotificationSink};
use super::rate::RateLimiter;
use super::{ExecutorConfig, LifecycleActions, TransitionResult};
use crate::audit::AuditLog;
use crate::error::{IdleError, IdleResult};
use crate::models::{ActionKind, AuditEntry, AuditOutcome, IdleAction, IdleRecord, Instance};
use crate::observability::{IdleMetrics, StructuredLogger};
use crate::state::{ClaimOutcome, StateSync};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One request to act on a confirmed idle episode
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub instance: Instance,
    /// Episode the claim is made against
    pub episode: String,
    pub action: ActionKind,
    pub idle_minutes: i64,
    /// Send a notice for terminal actions as well
    pub notify: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed {
        final_state: IdleAction,
        fallback: bool,
    },
    /// Another actor handled or is handling the episode
    NoOp { holder: Option<String> },
    DryRun,
    RateLimited,
}

/// Result of settling a claim
enum Claim {
    Owned(IdleRecord),
    Settled(ActionOutcome),
}

/// How a retried platform call ended
enum Attempted {
    Done,
    Unsupported(String),
    Exhausted { attempts: u32, reason: String },
}

pub struct ActionExecutor {
    sync: StateSync,
    platform: Arc<dyn LifecycleActions>,
    notifier: Option<Arc<dyn NotificationSink>>,
    audit: Arc<AuditLog>,
    metrics: IdleMetrics,
    logger: StructuredLogger,
    config: ExecutorConfig,
    limiter: RateLimiter,
    /// Instances known not to support hibernation, with the platform's reason
    no_hibernation: DashMap<String, String>,
}

impl ActionExecutor {
    pub fn new(
        sync: StateSync,
        platform: Arc<dyn LifecycleActions>,
        audit: Arc<AuditLog>,
        config: ExecutorConfig,
    ) -> Self {
        let logger = StructuredLogger::new(sync.writer());
        Self {
            limiter: RateLimiter::per_hour(config.max_actions_per_hour),
            sync,
            platform,
            notifier: None,
            audit,
            metrics: IdleMetrics::new(),
            logger,
            config,
            no_hibernation: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn actor(&self) -> &str {
        self.sync.writer()
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Whether the instance is known or reported not to hibernate
    pub fn hibernation_unsupported(&self, instance: &Instance) -> Option<String> {
        if let Some(reason) = self.no_hibernation.get(&instance.id) {
            return Some(reason.value().clone());
        }
        (instance.hibernation_capable == Some(false))
            .then(|| "instance reports hibernation unsupported".to_string())
    }

    fn entry(&self, request: &ActionRequest, outcome: AuditOutcome, reason: impl Into<String>) -> AuditEntry {
        AuditEntry::new(&request.instance.id, self.actor(), outcome, reason)
            .with_action(request.action)
            .with_idle_minutes(request.idle_minutes)
    }

    /// Carry out the configured action for one episode.
    ///
    /// Returns `Err(ActionFailed)` only after retries are exhausted; races
    /// lost to another actor are `Ok(NoOp)`.
    pub async fn execute(&self, request: &ActionRequest) -> IdleResult<ActionOutcome> {
        if let Some(outcome) = self.gate(request).await {
            return Ok(outcome);
        }

        let known_unsupported = match request.action {
            ActionKind::Hibernate => self.hibernation_unsupported(&request.instance),
            _ => None,
        };
        let target = match (request.action, &known_unsupported) {
            (ActionKind::Notify, _) => IdleAction::Notified,
            (ActionKind::Hibernate, None) => IdleAction::Hibernating,
            (ActionKind::Hibernate, Some(_)) | (ActionKind::Stop, _) => IdleAction::Stopping,
        };

        let claim = self
            .sync
            .claim(&request.instance.id, &request.episode, target)
            .await;
        if let Claim::Settled(outcome) = self.take_claim(request, claim).await? {
            return Ok(outcome);
        }

        self.logger
            .log_action_claimed(&request.instance.id, &request.episode, target);

        match target {
            IdleAction::Notified => self.run_notify(request).await,
            IdleAction::Hibernating => self.run_hibernate(request).await,
            _ => self.run_stop(request, known_unsupported).await,
        }
    }

    /// Re-drive an in-flight claim whose holder stopped updating it.
    ///
    /// The platform call is repeated from the recorded in-flight state;
    /// a transition already underway is answered as in progress and counts
    /// as success.
    pub async fn recover(&self, request: &ActionRequest) -> IdleResult<ActionOutcome> {
        if let Some(outcome) = self.gate(request).await {
            return Ok(outcome);
        }

        let claim = self
            .sync
            .reclaim(&request.instance.id, &request.episode)
            .await;
        let record = match self.take_claim(request, claim).await? {
            Claim::Owned(record) => record,
            Claim::Settled(outcome) => return Ok(outcome),
        };

        self.metrics.inc_action(request.action, "recovered");
        self.audit
            .record(self.entry(
                request,
                AuditOutcome::Recovered,
                format!("re-driving abandoned {} claim: {}", record.idle_action, request.reason),
            ))
            .await;

        match record.idle_action {
            IdleAction::Hibernating => match self.hibernation_unsupported(&request.instance) {
                Some(reason) => self.fall_back(request, reason).await,
                None => self.run_hibernate(request).await,
            },
            _ => self.run_stop(request, None).await,
        }
    }

    /// Dry-run and rate-limit checks that precede any claim
    async fn gate(&self, request: &ActionRequest) -> Option<ActionOutcome> {
        if self.config.dry_run {
            self.audit
                .record(self.entry(
                    request,
                    AuditOutcome::DryRun,
                    format!("would {} ({})", request.action, request.reason),
                ))
                .await;
            self.metrics.inc_action(request.action, "dry_run");
            return Some(ActionOutcome::DryRun);
        }

        if request.action != ActionKind::Notify && !self.limiter.try_acquire() {
            warn!(
                instance_id = %request.instance.id,
                limit = self.config.max_actions_per_hour,
                "Action rate limit reached, deferring to a later cycle"
            );
            self.audit
                .record(self.entry(
                    request,
                    AuditOutcome::RateLimited,
                    format!(
                        "more than {} actions in the last hour",
                        self.config.max_actions_per_hour
                    ),
                ))
                .await;
            self.metrics.inc_action(request.action, "rate_limited");
            return Some(ActionOutcome::RateLimited);
        }

        None
    }

    /// Settle a claim attempt; anything but ownership ends the request
    async fn take_claim(
        &self,
        request: &ActionRequest,
        claim: IdleResult<ClaimOutcome>,
    ) -> IdleResult<Claim> {
        let terminal = request.action != ActionKind::Notify;
        let (holder, reason) = match claim {
            Ok(ClaimOutcome::Claimed(record)) => return Ok(Claim::Owned(record)),
            Ok(ClaimOutcome::AlreadyHandled(record)) => {
                debug!(
                    instance_id = %request.instance.id,
                    current = %record.idle_action,
                    "Episode already handled"
                );
                let reason = format!(
                    "already handled: status {} action {} by {}",
                    record.idle_status, record.idle_action, record.last_writer
                );
                (record.last_writer, reason)
            }
            Ok(ClaimOutcome::Lost { holder }) => {
                self.logger
                    .log_write_conflict(&request.instance.id, &holder);
                self.metrics.inc_write_conflict();
                let reason = format!("write conflict: claim taken by {}", holder);
                (holder, reason)
            }
            Err(e) => {
                if terminal {
                    self.limiter.release();
                }
                return Err(self.store_failure(request, "claim", e).await);
            }
        };

        if terminal {
            self.limiter.release();
        }
        self.metrics.inc_action(request.action, "no_op");
        self.audit
            .record(self.entry(request, AuditOutcome::NoOp, reason))
            .await;
        Ok(Claim::Settled(ActionOutcome::NoOp {
            holder: Some(holder).filter(|w| !w.is_empty()),
        }))
    }

    /// Audit a state store error on the action path and hand it back.
    ///
    /// A claim left in flight by this error is re-driven once it goes stale.
    async fn store_failure(&self, request: &ActionRequest, step: &str, error: IdleError) -> IdleError {
        warn!(
            instance_id = %request.instance.id,
            step = step,
            error = %error,
            "State store failed during action"
        );
        self.metrics.inc_action(request.action, "failed");
        self.audit
            .record(self.entry(
                request,
                AuditOutcome::Failed,
                format!("{} not recorded: {}", step, error),
            ))
            .await;
        error
    }

    /// The episode ended while this actor held the claim
    async fn abandon(&self, request: &ActionRequest, why: &str) -> ActionOutcome {
        if request.action != ActionKind::Notify {
            self.limiter.release();
        }
        let holder = match self.sync.current(&request.instance.id).await {
            Ok(Some(record)) => {
                Some(record.last_writer).filter(|w| !w.is_empty() && w.as_str() != self.actor())
            }
            _ => None,
        };
        info!(instance_id = %request.instance.id, reason = why, "Action abandoned");
        self.metrics.inc_action(request.action, "no_op");
        self.audit
            .record(self.entry(request, AuditOutcome::NoOp, why))
            .await;
        ActionOutcome::NoOp { holder }
    }

    async fn run_notify(&self, request: &ActionRequest) -> IdleResult<ActionOutcome> {
        let mut reason = request.reason.clone();
        if let Err(e) = self.send_notice(request, "idle").await {
            reason = format!("{}; notice not delivered: {}", reason, e);
        }
        self.audit
            .record(self.entry(request, AuditOutcome::Completed, reason))
            .await;
        self.metrics.inc_action(ActionKind::Notify, "completed");
        self.logger.log_action_completed(
            &request.instance.id,
            ActionKind::Notify,
            IdleAction::Notified,
        );
        Ok(ActionOutcome::Completed {
            final_state: IdleAction::Notified,
            fallback: false,
        })
    }

    async fn run_hibernate(&self, request: &ActionRequest) -> IdleResult<ActionOutcome> {
        let instance = &request.instance;
        match self
            .with_retry(|| self.platform.hibernate(instance))
            .await
        {
            Attempted::Done => {
                self.finish(request, IdleAction::Hibernated, false, request.reason.clone())
                    .await
            }
            Attempted::Unsupported(reason) => {
                self.no_hibernation
                    .insert(instance.id.clone(), reason.clone());
                self.fall_back(request, reason).await
            }
            Attempted::Exhausted { attempts, reason } => {
                self.fail(request, IdleAction::Hibernating, attempts, reason)
                    .await
            }
        }
    }

    /// Move a hibernate claim over to stop, unless the episode ended meanwhile
    async fn fall_back(&self, request: &ActionRequest, reason: String) -> IdleResult<ActionOutcome> {
        let id = &request.instance.id;
        match self
            .sync
            .advance(id, &request.episode, IdleAction::Stopping)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Ok(self
                    .abandon(request, "episode ended before fallback to stop")
                    .await)
            }
            Err(e) => return Err(self.store_failure(request, "fallback to stop", e).await),
        }
        self.logger.log_action_fallback(id, &reason);
        self.run_stop(request, Some(reason)).await
    }

    /// Stop path; `fallback` carries why hibernation was skipped, if it was
    async fn run_stop(
        &self,
        request: &ActionRequest,
        fallback: Option<String>,
    ) -> IdleResult<ActionOutcome> {
        let instance = &request.instance;
        match self.with_retry(|| self.platform.stop(instance)).await {
            Attempted::Done => {
                let reason = match &fallback {
                    Some(why) => format!("hibernate unsupported ({}), stopped instead", why),
                    None => request.reason.clone(),
                };
                self.finish(request, IdleAction::Stopped, fallback.is_some(), reason)
                    .await
            }
            Attempted::Unsupported(reason) => {
                self.fail(request, IdleAction::Stopping, 1, reason).await
            }
            Attempted::Exhausted { attempts, reason } => {
                self.fail(request, IdleAction::Stopping, attempts, reason)
                    .await
            }
        }
    }

    async fn finish(
        &self,
        request: &ActionRequest,
        final_state: IdleAction,
        fallback: bool,
        reason: String,
    ) -> IdleResult<ActionOutcome> {
        let id = &request.instance.id;
        match self.sync.advance(id, &request.episode, final_state).await {
            Ok(true) => {}
            Ok(false) => debug!(instance_id = %id, "Completion already recorded"),
            Err(e) => return Err(self.store_failure(request, "completion", e).await),
        }

        let outcome = if fallback {
            AuditOutcome::Fallback
        } else {
            AuditOutcome::Completed
        };
        self.audit
            .record(self.entry(request, outcome, reason.clone()))
            .await;
        self.metrics.inc_action(
            request.action,
            if fallback { "fallback" } else { "completed" },
        );
        self.logger
            .log_action_completed(id, request.action, final_state);

        if request.notify {
            if let Err(e) = self.send_notice(request, &final_state.to_string()).await {
                warn!(instance_id = %id, error = %e, "Failed to deliver action notice");
            }
        }

        Ok(ActionOutcome::Completed {
            final_state,
            fallback,
        })
    }

    async fn fail(
        &self,
        request: &ActionRequest,
        claimed: IdleAction,
        attempts: u32,
        reason: String,
    ) -> IdleResult<ActionOutcome> {
        let id = &request.instance.id;
        if let Err(e) = self.sync.revert(id, &request.episode, claimed).await {
            warn!(instance_id = %id, error = %e, "Failed to release claim after action failure");
        }

        self.logger
            .log_action_failed(id, request.action, attempts, &reason);
        self.metrics.inc_action(request.action, "failed");
        self.audit
            .record(self.entry(
                request,
                AuditOutcome::Failed,
                format!("{} attempt(s): {}", attempts, reason),
            ))
            .await;

        Err(IdleError::ActionFailed {
            instance_id: id.clone(),
            action: request.action.to_string(),
            attempts,
            reason,
        })
    }

    async fn with_retry<F, Fut>(&self, mut op: F) -> Attempted
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransitionResult>,
    {
        let mut backoff = self.config.initial_backoff;
        let mut last_reason = String::from("no attempt made");
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match op().await {
                TransitionResult::Accepted | TransitionResult::AlreadyInProgress => {
                    return Attempted::Done
                }
                TransitionResult::Unsupported(reason) => return Attempted::Unsupported(reason),
                TransitionResult::Failed(reason) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        reason = %reason,
                        "Lifecycle transition failed"
                    );
                    last_reason = reason;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
            }
        }

        Attempted::Exhausted {
            attempts,
            reason: last_reason,
        }
    }

    async fn send_notice(&self, request: &ActionRequest, result: &str) -> IdleResult<()> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        let notice = Notice {
            instance_id: request.instance.id.clone(),
            instance_name: request.instance.display_name().to_string(),
            action: request.action,
            result: result.to_string(),
            idle_minutes: request.idle_minutes,
            reason: request.reason.clone(),
            timestamp: Utc::now(),
        };
        notifier.notify(&notice).await
    }
}
