//! Episode protocol over a shared state store

use super::StateStore;
use crate::classifier::{classify, ClassificationOutcome};
use crate::error::{IdleError, IdleResult};
use crate::models::{Classification, IdleAction, IdleRecord, IdleStatus, MetricSample};
use crate::policy::ThresholdProfile;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing knobs of the protocol
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pause between writing a claim and re-reading it
    pub claim_settle: Duration,
    /// An `active` write by another actor younger than this blocks `idle`
    pub conflict_window: Duration,
    /// Bound on every single store operation
    pub op_timeout: Duration,
    /// An in-flight claim not updated for this long is considered abandoned
    pub claim_stale: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            claim_settle: Duration::from_secs(2),
            conflict_window: Duration::from_secs(120),
            op_timeout: Duration::from_secs(10),
            claim_stale: Duration::from_secs(900),
        }
    }
}

/// Result of publishing one classification
#[derive(Debug, Clone)]
pub struct Observation {
    /// Classification after the tie-break was applied
    pub outcome: ClassificationOutcome,
    /// Record as it stands after this observation
    pub record: IdleRecord,
    /// Whether this observation wrote the store
    pub wrote: bool,
    /// Writer whose recent `active` record blocked an `idle` write
    pub deferred_to: Option<String>,
}

impl Observation {
    /// Episode id to claim against, when the instance is confirmed idle
    pub fn confirmed_episode(&self) -> Option<String> {
        if self.outcome.classification == Classification::IdleConfirmed {
            self.record.episode_id()
        } else {
            None
        }
    }
}

/// Result of trying to claim the terminal action for an episode
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This actor owns the action
    Claimed(IdleRecord),
    /// The record was not claimable: another action is underway or done,
    /// or the episode is over
    AlreadyHandled(IdleRecord),
    /// Our claim was overwritten during the settle pause
    Lost { holder: String },
}

/// One actor's view of the shared store
#[derive(Clone)]
pub struct StateSync {
    store: Arc<dyn StateStore>,
    writer: String,
    config: SyncConfig,
}

impl StateSync {
    pub fn new(store: Arc<dyn StateStore>, writer: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            store,
            writer: writer.into(),
            config,
        }
    }

    pub fn writer(&self) -> &str {
        &self.writer
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> IdleResult<T>
    where
        F: Future<Output = IdleResult<T>>,
    {
        tokio::time::timeout(self.config.op_timeout, fut)
            .await
            .map_err(|_| IdleError::timeout(operation, self.config.op_timeout))?
    }

    /// Current record for an instance
    pub async fn current(&self, instance_id: &str) -> IdleResult<Option<IdleRecord>> {
        self.bounded("state load", self.store.load(instance_id)).await
    }

    async fn write(&self, record: &IdleRecord) -> IdleResult<()> {
        self.bounded("state save", self.store.save(record)).await
    }

    /// Classify a sample against the stored episode and publish the result.
    ///
    /// `idle_since` is written once per episode and then left alone, so
    /// repeated quiet cycles do not touch the store.
    pub async fn observe(
        &self,
        sample: &MetricSample,
        profile: &ThresholdProfile,
    ) -> IdleResult<Observation> {
        let now = sample.timestamp;
        let stored = self.current(&sample.instance_id).await?;
        let record = stored
            .clone()
            .unwrap_or_else(|| IdleRecord::fresh(&sample.instance_id, now));

        let grace = chrono::Duration::from_std(profile.check_interval())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let episode_closed = record.idle_status == IdleStatus::Idle
            && matches!(
                record.idle_action,
                IdleAction::Stopped | IdleAction::Hibernated
            )
            && now - record.last_updated > grace;

        let prior_idle_since = match record.idle_status {
            IdleStatus::Idle if !episode_closed => record.idle_since,
            _ => None,
        };

        let mut outcome = classify(sample, profile, prior_idle_since);

        if !outcome.classification.is_quiet() {
            let updated = IdleRecord {
                instance_id: sample.instance_id.clone(),
                idle_status: IdleStatus::Active,
                idle_since: None,
                idle_action: IdleAction::None,
                last_writer: self.writer.clone(),
                last_updated: now,
            };
            self.write(&updated).await?;
            return Ok(Observation {
                outcome,
                record: updated,
                wrote: true,
                deferred_to: None,
            });
        }

        if stored.is_some() && self.blocked_by_recent_active(&record, now) {
            debug!(
                instance_id = %sample.instance_id,
                holder = %record.last_writer,
                "Recent active write wins over idle"
            );
            outcome.classification = Classification::IdleCandidate;
            outcome.idle_since = None;
            outcome.quiet_for_secs = 0;
            outcome.reason = format!("deferring to active record from {}", record.last_writer);
            let holder = record.last_writer.clone();
            return Ok(Observation {
                outcome,
                record,
                wrote: false,
                deferred_to: Some(holder),
            });
        }

        if prior_idle_since.is_some() {
            return Ok(Observation {
                outcome,
                record,
                wrote: false,
                deferred_to: None,
            });
        }

        let updated = IdleRecord {
            instance_id: sample.instance_id.clone(),
            idle_status: IdleStatus::Idle,
            idle_since: outcome.idle_since,
            idle_action: IdleAction::None,
            last_writer: self.writer.clone(),
            last_updated: now,
        };
        self.write(&updated).await?;
        info!(
            instance_id = %sample.instance_id,
            writer = %self.writer,
            "Idle episode opened"
        );

        Ok(Observation {
            outcome,
            record: updated,
            wrote: true,
            deferred_to: None,
        })
    }

    fn blocked_by_recent_active(&self, record: &IdleRecord, now: chrono::DateTime<Utc>) -> bool {
        if record.idle_status != IdleStatus::Active
            || record.last_writer.is_empty()
            || record.last_writer == self.writer
        {
            return false;
        }
        let age = (now - record.last_updated).num_milliseconds().unsigned_abs();
        age <= self.config.conflict_window.as_millis() as u64
    }

    /// Claim the terminal action for an idle episode.
    ///
    /// The claim is written only when the record still shows the episode
    /// with `idle_action == none`. After a settle pause the record is read
    /// back; if another actor's write replaced ours the claim is lost.
    pub async fn claim(
        &self,
        instance_id: &str,
        episode: &str,
        target: IdleAction,
    ) -> IdleResult<ClaimOutcome> {
        let record = match self.current(instance_id).await? {
            Some(record) => record,
            None => {
                return Ok(ClaimOutcome::AlreadyHandled(IdleRecord::fresh(
                    instance_id,
                    Utc::now(),
                )))
            }
        };

        if record.episode_id().as_deref() != Some(episode)
            || record.idle_action != IdleAction::None
            || !IdleAction::None.can_advance_to(target)
        {
            return Ok(ClaimOutcome::AlreadyHandled(record));
        }

        let claimed = IdleRecord {
            idle_action: target,
            last_writer: self.writer.clone(),
            last_updated: Utc::now(),
            ..record
        };
        self.settle_claim(claimed).await
    }

    /// Whether `record` holds an in-flight action its writer stopped driving
    pub fn claim_is_stale(&self, record: &IdleRecord, now: chrono::DateTime<Utc>) -> bool {
        if !record.idle_action.is_in_flight() {
            return false;
        }
        match chrono::Duration::from_std(self.config.claim_stale) {
            Ok(stale) => now - record.last_updated > stale,
            Err(_) => false,
        }
    }

    /// Take over an abandoned in-flight claim.
    ///
    /// The in-flight action is kept as-is and only the holder changes, so
    /// the action sequence stays forward-only. Same settle and re-read as
    /// `claim`.
    pub async fn reclaim(&self, instance_id: &str, episode: &str) -> IdleResult<ClaimOutcome> {
        let record = match self.current(instance_id).await? {
            Some(record) => record,
            None => {
                return Ok(ClaimOutcome::AlreadyHandled(IdleRecord::fresh(
                    instance_id,
                    Utc::now(),
                )))
            }
        };

        if record.episode_id().as_deref() != Some(episode)
            || !self.claim_is_stale(&record, Utc::now())
        {
            return Ok(ClaimOutcome::AlreadyHandled(record));
        }

        info!(
            instance_id = %instance_id,
            action = %record.idle_action,
            previous_holder = %record.last_writer,
            "Taking over abandoned claim"
        );
        let taken = IdleRecord {
            last_writer: self.writer.clone(),
            last_updated: Utc::now(),
            ..record
        };
        self.settle_claim(taken).await
    }

    async fn settle_claim(&self, claimed: IdleRecord) -> IdleResult<ClaimOutcome> {
        let instance_id = claimed.instance_id.clone();
        let stamp = claimed.last_updated;
        let target = claimed.idle_action;
        self.write(&claimed).await?;

        tokio::time::sleep(self.config.claim_settle).await;

        match self.current(&instance_id).await? {
            Some(after)
                if after.last_writer == self.writer
                    && after.last_updated == stamp
                    && after.idle_action == target =>
            {
                Ok(ClaimOutcome::Claimed(after))
            }
            Some(after) => {
                warn!(
                    instance_id = %instance_id,
                    holder = %after.last_writer,
                    "Claim overwritten by concurrent writer"
                );
                Ok(ClaimOutcome::Lost {
                    holder: after.last_writer,
                })
            }
            None => Ok(ClaimOutcome::Lost {
                holder: "unknown".to_string(),
            }),
        }
    }

    /// Move the action of an open episode forward.
    ///
    /// Returns `false` without writing when the episode ended or the
    /// record is already at or past `next`.
    pub async fn advance(
        &self,
        instance_id: &str,
        episode: &str,
        next: IdleAction,
    ) -> IdleResult<bool> {
        let record = match self.current(instance_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        if record.episode_id().as_deref() != Some(episode)
            || !record.idle_action.can_advance_to(next)
        {
            debug!(
                instance_id = %instance_id,
                current = %record.idle_action,
                next = %next,
                "Skipping non-forward action update"
            );
            return Ok(false);
        }

        let updated = IdleRecord {
            idle_action: next,
            last_writer: self.writer.clone(),
            last_updated: Utc::now(),
            ..record
        };
        self.write(&updated).await?;
        Ok(true)
    }

    /// Release a claim after a failed action so a later cycle may retry
    pub async fn revert(
        &self,
        instance_id: &str,
        episode: &str,
        claimed: IdleAction,
    ) -> IdleResult<bool> {
        let record = match self.current(instance_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        if record.episode_id().as_deref() != Some(episode)
            || record.idle_action != claimed
            || record.last_writer != self.writer
        {
            return Ok(false);
        }

        let updated = IdleRecord {
            idle_action: IdleAction::None,
            last_writer: self.writer.clone(),
            last_updated: Utc::now(),
            ..record
        };
        self.write(&updated).await?;
        Ok(true)
    }

    /// Operator override: write status and action unconditionally.
    ///
    /// Forcing `active` always clears `idle_since` and the action; forcing
    /// `idle` keeps an open episode's start or opens one now.
    pub async fn force(
        &self,
        instance_id: &str,
        status: IdleStatus,
        action: IdleAction,
    ) -> IdleResult<IdleRecord> {
        let now = Utc::now();
        let existing = self.current(instance_id).await?;

        let record = match status {
            IdleStatus::Active => IdleRecord {
                instance_id: instance_id.to_string(),
                idle_status: IdleStatus::Active,
                idle_since: None,
                idle_action: IdleAction::None,
                last_writer: self.writer.clone(),
                last_updated: now,
            },
            IdleStatus::Idle => IdleRecord {
                instance_id: instance_id.to_string(),
                idle_status: IdleStatus::Idle,
                idle_since: existing
                    .filter(|r| r.idle_status == IdleStatus::Idle)
                    .and_then(|r| r.idle_since)
                    .or(Some(now)),
                idle_action: action,
                last_writer: self.writer.clone(),
                last_updated: now,
            },
        };

        self.write(&record).await?;
        info!(
            instance_id = %instance_id,
            status = %record.idle_status,
            action = %record.idle_action,
            writer = %self.writer,
            "Idle record overridden"
        );
        Ok(record)
    }
}
