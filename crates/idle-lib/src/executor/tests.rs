//! Executor tests against scripted platform fakes

use super::*;
use crate::audit::AuditLog;
use crate::error::IdleError;
use crate::models::{ActionKind, AuditOutcome, IdleAction, IdleRecord, IdleStatus, Instance};
use crate::state::{MemoryStateStore, StateStore, StateSync, SyncConfig};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Platform fake that replays scripted answers and counts calls
#[derive(Default)]
struct ScriptedPlatform {
    stop_answers: Mutex<VecDeque<TransitionResult>>,
    hibernate_answers: Mutex<VecDeque<TransitionResult>>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedPlatform {
    fn with_stop(answers: Vec<TransitionResult>) -> Self {
        Self {
            stop_answers: Mutex::new(answers.into()),
            ..Default::default()
        }
    }

    fn with_hibernate(answers: Vec<TransitionResult>) -> Self {
        Self {
            hibernate_answers: Mutex::new(answers.into()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LifecycleActions for ScriptedPlatform {
    async fn stop(&self, _instance: &Instance) -> TransitionResult {
        self.calls.lock().unwrap().push("stop");
        self.stop_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransitionResult::Accepted)
    }

    async fn hibernate(&self, _instance: &Instance) -> TransitionResult {
        self.calls.lock().unwrap().push("hibernate");
        self.hibernate_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransitionResult::Accepted)
    }
}

#[derive(Default)]
struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
}

#[async_trait::async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notice: &Notice) -> crate::error::IdleResult<()> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Store that remembers every saved action and can fail saves past a count
struct HistoryStore {
    inner: MemoryStateStore,
    saved: Mutex<Vec<IdleAction>>,
    saves: AtomicUsize,
    fail_from: usize,
}

impl HistoryStore {
    fn failing_from(fail_from: usize) -> Self {
        Self {
            inner: MemoryStateStore::new(),
            saved: Mutex::new(Vec::new()),
            saves: AtomicUsize::new(0),
            fail_from,
        }
    }

    fn saved(&self) -> Vec<IdleAction> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StateStore for HistoryStore {
    async fn load(&self, instance_id: &str) -> crate::error::IdleResult<Option<IdleRecord>> {
        self.inner.load(instance_id).await
    }

    async fn save(&self, record: &IdleRecord) -> crate::error::IdleResult<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
            return Err(IdleError::StateStore("disk full".to_string()));
        }
        self.saved.lock().unwrap().push(record.idle_action);
        self.inner.save(record).await
    }

    async fn list(&self) -> crate::error::IdleResult<Vec<IdleRecord>> {
        self.inner.list().await
    }
}

/// Platform whose hibernate call races a session opening on the instance
struct SessionDuringHibernate {
    store: Arc<MemoryStateStore>,
    stops: AtomicUsize,
}

#[async_trait::async_trait]
impl LifecycleActions for SessionDuringHibernate {
    async fn stop(&self, _instance: &Instance) -> TransitionResult {
        self.stops.fetch_add(1, Ordering::SeqCst);
        TransitionResult::Accepted
    }

    async fn hibernate(&self, instance: &Instance) -> TransitionResult {
        let mut active = IdleRecord::fresh(&instance.id, Utc::now());
        active.last_writer = "local-agent".to_string();
        let _ = self.store.save(&active).await;
        TransitionResult::Unsupported("instance type lacks hibernation".to_string())
    }
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        dry_run: false,
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        max_actions_per_hour: 10,
    }
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        claim_settle: Duration::from_millis(5),
        conflict_window: Duration::from_secs(60),
        op_timeout: Duration::from_secs(1),
        claim_stale: Duration::from_secs(900),
    }
}

struct Harness {
    store: Arc<MemoryStateStore>,
    audit: Arc<AuditLog>,
    episode: String,
}

async fn idle_episode() -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    let since = Utc::now() - ChronoDuration::minutes(45);
    let mut record = IdleRecord::fresh("i-1", since);
    record.idle_status = IdleStatus::Idle;
    record.idle_since = Some(since);
    record.last_writer = "fleet-detector".to_string();
    store.save(&record).await.unwrap();

    Harness {
        episode: record.episode_id().unwrap(),
        store,
        audit: Arc::new(AuditLog::in_memory()),
    }
}

fn executor(h: &Harness, platform: Arc<dyn LifecycleActions>, config: ExecutorConfig) -> ActionExecutor {
    let sync = StateSync::new(h.store.clone(), "fleet-detector", sync_config());
    ActionExecutor::new(sync, platform, h.audit.clone(), config)
}

fn request(h: &Harness, action: ActionKind) -> ActionRequest {
    request_for(h.episode.clone(), action)
}

fn request_for(episode: String, action: ActionKind) -> ActionRequest {
    ActionRequest {
        instance: Instance::new("i-1"),
        episode,
        action,
        idle_minutes: 45,
        notify: false,
        reason: "idle confirmed".to_string(),
    }
}

#[tokio::test]
async fn test_stop_completes_and_records_terminal_state() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec.execute(&request(&h, ActionKind::Stop)).await.unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Stopped,
            fallback: false
        }
    );
    assert_eq!(platform.calls(), vec!["stop"]);

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::Stopped);

    let audit = h.audit.query("i-1", None, None).await;
    assert_eq!(audit.last().unwrap().outcome, AuditOutcome::Completed);
    assert_eq!(audit.last().unwrap().idle_minutes, Some(45));
}

#[tokio::test]
async fn test_hibernate_unsupported_falls_back_to_stop() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::with_hibernate(vec![
        TransitionResult::Unsupported("instance type lacks hibernation".to_string()),
    ]));
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec
        .execute(&request(&h, ActionKind::Hibernate))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Stopped,
            fallback: true
        }
    );
    assert_eq!(platform.calls(), vec!["hibernate", "stop"]);

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::Stopped);

    let entry = h.audit.query("i-1", None, None).await.pop().unwrap();
    assert_eq!(entry.outcome, AuditOutcome::Fallback);
    assert!(entry.reason.contains("instance type lacks hibernation"));

    assert!(exec.hibernation_unsupported(&Instance::new("i-1")).is_some());
}

#[tokio::test]
async fn test_learned_capability_skips_hibernate_attempt() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let exec = executor(&h, platform.clone(), fast_config());

    let mut req = request(&h, ActionKind::Hibernate);
    req.instance.hibernation_capable = Some(false);

    let outcome = exec.execute(&req).await.unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Stopped,
            fallback: true
        }
    );
    assert_eq!(platform.calls(), vec!["stop"]);
}

#[tokio::test]
async fn test_stop_retries_then_fails_and_releases_claim() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::with_stop(vec![
        TransitionResult::Failed("throttled".to_string()),
        TransitionResult::Failed("throttled".to_string()),
        TransitionResult::Failed("insufficient capacity".to_string()),
    ]));
    let exec = executor(&h, platform.clone(), fast_config());

    let err = exec
        .execute(&request(&h, ActionKind::Stop))
        .await
        .unwrap_err();
    match err {
        IdleError::ActionFailed {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(reason, "insufficient capacity");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(platform.calls().len(), 3);

    // Claim released so a later cycle can retry
    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::None);
    assert_eq!(record.idle_status, IdleStatus::Idle);

    let entry = h.audit.query("i-1", None, None).await.pop().unwrap();
    assert_eq!(entry.outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn test_transient_failure_recovers_within_attempts() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::with_stop(vec![
        TransitionResult::Failed("throttled".to_string()),
        TransitionResult::AlreadyInProgress,
    ]));
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec.execute(&request(&h, ActionKind::Stop)).await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Completed { .. }));
    assert_eq!(platform.calls().len(), 2);
}

#[tokio::test]
async fn test_second_executor_on_same_episode_is_noop() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let fleet = executor(&h, platform.clone(), fast_config());
    let agent = ActionExecutor::new(
        StateSync::new(h.store.clone(), "local-agent", sync_config()),
        platform.clone(),
        h.audit.clone(),
        fast_config(),
    );

    let fleet_request = request(&h, ActionKind::Stop);
    let agent_request = request(&h, ActionKind::Stop);
    let (a, b) = tokio::join!(fleet.execute(&fleet_request), agent.execute(&agent_request));
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ActionOutcome::Completed { .. }))
        .count();
    let noops = outcomes
        .iter()
        .filter(|o| matches!(o, ActionOutcome::NoOp { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(noops, 1);
    assert_eq!(platform.calls(), vec!["stop"]);

    let noop_entries = h
        .audit
        .query("i-1", None, None)
        .await
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::NoOp)
        .count();
    assert_eq!(noop_entries, 1);
}

#[tokio::test]
async fn test_dry_run_never_touches_platform_or_store() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let config = ExecutorConfig {
        dry_run: true,
        ..fast_config()
    };
    let exec = executor(&h, platform.clone(), config);

    let outcome = exec.execute(&request(&h, ActionKind::Stop)).await.unwrap();
    assert_eq!(outcome, ActionOutcome::DryRun);
    assert!(platform.calls().is_empty());

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::None);
}

#[tokio::test]
async fn test_rate_limit_defers_without_claiming() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let config = ExecutorConfig {
        max_actions_per_hour: 1,
        ..fast_config()
    };
    let exec = executor(&h, platform.clone(), config);

    // Use up the single slot on another instance
    let other = {
        let since = Utc::now() - ChronoDuration::hours(1);
        let mut record = IdleRecord::fresh("i-0", since);
        record.idle_status = IdleStatus::Idle;
        record.idle_since = Some(since);
        h.store.save(&record).await.unwrap();
        ActionRequest {
            instance: Instance::new("i-0"),
            episode: record.episode_id().unwrap(),
            ..request(&h, ActionKind::Stop)
        }
    };
    exec.execute(&other).await.unwrap();

    let outcome = exec.execute(&request(&h, ActionKind::Stop)).await.unwrap();
    assert_eq!(outcome, ActionOutcome::RateLimited);

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::None);
}

#[tokio::test]
async fn test_notify_marks_episode_and_sends_notice() {
    let h = idle_episode().await;
    let platform = Arc::new(ScriptedPlatform::default());
    let sink = Arc::new(RecordingSink::default());
    let exec = executor(&h, platform.clone(), fast_config()).with_notifier(sink.clone());

    let outcome = exec
        .execute(&request(&h, ActionKind::Notify))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Notified,
            fallback: false
        }
    );
    assert!(platform.calls().is_empty());
    assert_eq!(sink.notices.lock().unwrap().len(), 1);

    // Repeated confirmation within the episode does not notify again
    let again = exec
        .execute(&request(&h, ActionKind::Notify))
        .await
        .unwrap();
    assert!(matches!(again, ActionOutcome::NoOp { .. }));
    assert_eq!(sink.notices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_action_notice_when_enabled() {
    let h = idle_episode().await;
    let sink = Arc::new(RecordingSink::default());
    let exec = executor(&h, Arc::new(ScriptedPlatform::default()), fast_config())
        .with_notifier(sink.clone());

    let mut req = request(&h, ActionKind::Stop);
    req.notify = true;
    exec.execute(&req).await.unwrap();

    let notices = sink.notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].result, "stopped");
    assert_eq!(notices[0].idle_minutes, 45);
}

#[tokio::test]
async fn test_hibernate_fallback_writes_each_transition_in_order() {
    let store = Arc::new(HistoryStore::failing_from(usize::MAX));
    let since = Utc::now() - ChronoDuration::minutes(45);
    let mut record = IdleRecord::fresh("i-1", since);
    record.idle_status = IdleStatus::Idle;
    record.idle_since = Some(since);
    store.inner.save(&record).await.unwrap();

    let platform = Arc::new(ScriptedPlatform::with_hibernate(vec![
        TransitionResult::Unsupported("instance type lacks hibernation".to_string()),
    ]));
    let exec = ActionExecutor::new(
        StateSync::new(store.clone(), "fleet-detector", sync_config()),
        platform,
        Arc::new(AuditLog::in_memory()),
        fast_config(),
    );

    exec.execute(&request_for(record.episode_id().unwrap(), ActionKind::Hibernate))
        .await
        .unwrap();

    assert_eq!(
        store.saved(),
        vec![
            IdleAction::Hibernating,
            IdleAction::Stopping,
            IdleAction::Stopped
        ]
    );
}

#[tokio::test]
async fn test_fallback_skipped_when_episode_ends_during_hibernate() {
    let h = idle_episode().await;
    let platform = Arc::new(SessionDuringHibernate {
        store: h.store.clone(),
        stops: AtomicUsize::new(0),
    });
    let config = ExecutorConfig {
        max_actions_per_hour: 1,
        ..fast_config()
    };
    let exec = executor(&h, platform.clone(), config);

    let outcome = exec
        .execute(&request(&h, ActionKind::Hibernate))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::NoOp {
            holder: Some("local-agent".to_string())
        }
    );
    assert_eq!(platform.stops.load(Ordering::SeqCst), 0);

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_status, IdleStatus::Active);
    assert_eq!(record.idle_action, IdleAction::None);

    let entry = h.audit.query("i-1", None, None).await.pop().unwrap();
    assert_eq!(entry.outcome, AuditOutcome::NoOp);
    assert!(entry.reason.contains("episode ended"));

    // The rate slot went back; another instance can still be acted on
    let since = Utc::now() - ChronoDuration::hours(1);
    let mut other = IdleRecord::fresh("i-0", since);
    other.idle_status = IdleStatus::Idle;
    other.idle_since = Some(since);
    h.store.save(&other).await.unwrap();
    let outcome = exec
        .execute(&ActionRequest {
            instance: Instance::new("i-0"),
            episode: other.episode_id().unwrap(),
            ..request(&h, ActionKind::Stop)
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ActionOutcome::Completed { .. }));
}

async fn abandoned_claim(h: &Harness, action: IdleAction, age: ChronoDuration) {
    let mut record = h.store.load("i-1").await.unwrap().unwrap();
    record.idle_action = action;
    record.last_writer = "local-agent".to_string();
    record.last_updated = Utc::now() - age;
    h.store.save(&record).await.unwrap();
}

#[tokio::test]
async fn test_recover_redrives_stale_stop() {
    let h = idle_episode().await;
    abandoned_claim(&h, IdleAction::Stopping, ChronoDuration::hours(2)).await;
    let platform = Arc::new(ScriptedPlatform::with_stop(vec![
        TransitionResult::AlreadyInProgress,
    ]));
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec.recover(&request(&h, ActionKind::Stop)).await.unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Stopped,
            fallback: false
        }
    );
    assert_eq!(platform.calls(), vec!["stop"]);

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::Stopped);
    assert_eq!(record.last_writer, "fleet-detector");

    let outcomes: Vec<AuditOutcome> = h
        .audit
        .query("i-1", None, None)
        .await
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Recovered, AuditOutcome::Completed]);
}

#[tokio::test]
async fn test_recover_resumes_stale_hibernate() {
    let h = idle_episode().await;
    abandoned_claim(&h, IdleAction::Hibernating, ChronoDuration::hours(2)).await;
    let platform = Arc::new(ScriptedPlatform::default());
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec
        .recover(&request(&h, ActionKind::Hibernate))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Completed {
            final_state: IdleAction::Hibernated,
            fallback: false
        }
    );
    assert_eq!(platform.calls(), vec!["hibernate"]);
}

#[tokio::test]
async fn test_recover_leaves_live_claim_alone() {
    let h = idle_episode().await;
    abandoned_claim(&h, IdleAction::Stopping, ChronoDuration::seconds(30)).await;
    let platform = Arc::new(ScriptedPlatform::default());
    let exec = executor(&h, platform.clone(), fast_config());

    let outcome = exec.recover(&request(&h, ActionKind::Stop)).await.unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::NoOp {
            holder: Some("local-agent".to_string())
        }
    );
    assert!(platform.calls().is_empty());

    let record = h.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::Stopping);
    assert_eq!(record.last_writer, "local-agent");
}

async fn failing_store_executor(fail_from: usize) -> (Arc<HistoryStore>, Arc<AuditLog>, ActionExecutor, String) {
    let store = Arc::new(HistoryStore::failing_from(fail_from));
    let since = Utc::now() - ChronoDuration::minutes(45);
    let mut record = IdleRecord::fresh("i-1", since);
    record.idle_status = IdleStatus::Idle;
    record.idle_since = Some(since);
    store.inner.save(&record).await.unwrap();

    let audit = Arc::new(AuditLog::in_memory());
    let exec = ActionExecutor::new(
        StateSync::new(store.clone(), "fleet-detector", sync_config()),
        Arc::new(ScriptedPlatform::default()),
        audit.clone(),
        fast_config(),
    );
    (store, audit, exec, record.episode_id().unwrap())
}

#[tokio::test]
async fn test_claim_store_failure_is_audited() {
    let (_store, audit, exec, episode) = failing_store_executor(0).await;

    let err = exec
        .execute(&request_for(episode, ActionKind::Stop))
        .await
        .unwrap_err();
    assert!(matches!(err, IdleError::StateStore(_)));

    let entries = audit.query("i-1", None, None).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert!(entries[0].reason.contains("claim not recorded"));
    assert!(entries[0].reason.contains("disk full"));
}

#[tokio::test]
async fn test_completion_store_failure_is_audited_and_leaves_claim() {
    let (store, audit, exec, episode) = failing_store_executor(1).await;

    assert!(exec
        .execute(&request_for(episode, ActionKind::Stop))
        .await
        .is_err());

    let entry = audit.query("i-1", None, None).await.pop().unwrap();
    assert_eq!(entry.outcome, AuditOutcome::Failed);
    assert!(entry.reason.contains("completion not recorded"));

    // Left in flight for a later stale-claim takeover
    let record = store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action, IdleAction::Stopping);
}
