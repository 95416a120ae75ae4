//! Observability infrastructure for idle detection
//!
//! Provides:
//! - Prometheus metrics (cycle latency, per-instance latency, classification
//!   and action counters, conflicts, unreachable instances)
//! - Structured JSON logging with tracing

use crate::models::{ActionKind, Classification, IdleAction, Stage};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle and per-instance latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<IdleMetricsInner> = OnceLock::new();

struct IdleMetricsInner {
    cycle_latency_seconds: Histogram,
    instance_latency_seconds: Histogram,
    classifications: IntCounterVec,
    actions: IntCounterVec,
    unreachable: IntCounter,
    write_conflicts: IntCounter,
    instances_monitored: IntGauge,
}

impl IdleMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "idlewatch_cycle_latency_seconds",
                "Time spent on one full fleet detection cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            instance_latency_seconds: register_histogram!(
                "idlewatch_instance_latency_seconds",
                "Time spent collecting and classifying one instance",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register instance_latency_seconds"),

            classifications: register_int_counter_vec!(
                "idlewatch_classifications_total",
                "Classifications produced by the pipeline",
                &["classification"]
            )
            .expect("Failed to register classifications_total"),

            actions: register_int_counter_vec!(
                "idlewatch_actions_total",
                "Lifecycle actions attempted, by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register actions_total"),

            unreachable: register_int_counter!(
                "idlewatch_unreachable_total",
                "Instances skipped because their metrics could not be collected"
            )
            .expect("Failed to register unreachable_total"),

            write_conflicts: register_int_counter!(
                "idlewatch_write_conflicts_total",
                "Claims lost to a concurrent writer"
            )
            .expect("Failed to register write_conflicts_total"),

            instances_monitored: register_int_gauge!(
                "idlewatch_instances_monitored",
                "Instances evaluated in the last cycle"
            )
            .expect("Failed to register instances_monitored"),
        }
    }
}

/// Handle to the process-wide idle detection metrics.
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct IdleMetrics {
    _private: (),
}

impl Default for IdleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(IdleMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &IdleMetricsInner {
        GLOBAL_METRICS.get_or_init(IdleMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn observe_instance_latency(&self, duration_secs: f64) {
        self.inner().instance_latency_seconds.observe(duration_secs);
    }

    pub fn inc_classification(&self, classification: Classification) {
        self.inner()
            .classifications
            .with_label_values(&[classification.as_str()])
            .inc();
    }

    /// Count an action attempt; `outcome` is a short label such as
    /// `completed`, `fallback`, `failed` or `no_op`
    pub fn inc_action(&self, action: ActionKind, outcome: &str) {
        self.inner()
            .actions
            .with_label_values(&[action.as_str(), outcome])
            .inc();
    }

    pub fn inc_unreachable(&self) {
        self.inner().unreachable.inc();
    }

    pub fn inc_write_conflict(&self) {
        self.inner().write_conflicts.inc();
    }

    pub fn set_instances_monitored(&self, count: i64) {
        self.inner().instances_monitored.set(count);
    }

    pub fn classification_count(&self, classification: Classification) -> u64 {
        self.inner()
            .classifications
            .with_label_values(&[classification.as_str()])
            .get()
    }

    pub fn action_count(&self, action: ActionKind, outcome: &str) -> u64 {
        self.inner()
            .actions
            .with_label_values(&[action.as_str(), outcome])
            .get()
    }
}

/// Structured logger for detection and lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    actor: String,
}

impl StructuredLogger {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn log_classification(
        &self,
        instance_id: &str,
        classification: Classification,
        stage: Stage,
        reason: &str,
    ) {
        info!(
            event = "classification",
            actor = %self.actor,
            instance_id = %instance_id,
            classification = %classification,
            stage = ?stage,
            reason = %reason,
            "Instance classified"
        );
    }

    pub fn log_idle_confirmed(&self, instance_id: &str, idle_minutes: i64, action: ActionKind) {
        info!(
            event = "idle_confirmed",
            actor = %self.actor,
            instance_id = %instance_id,
            idle_minutes = idle_minutes,
            action = %action,
            "Sustained idle confirmed"
        );
    }

    pub fn log_action_claimed(&self, instance_id: &str, episode: &str, action: IdleAction) {
        info!(
            event = "action_claimed",
            actor = %self.actor,
            instance_id = %instance_id,
            episode = %episode,
            action = %action,
            "Claimed terminal action"
        );
    }

    pub fn log_action_completed(&self, instance_id: &str, action: ActionKind, final_state: IdleAction) {
        info!(
            event = "action_completed",
            actor = %self.actor,
            instance_id = %instance_id,
            action = %action,
            final_state = %final_state,
            "Lifecycle action completed"
        );
    }

    pub fn log_action_fallback(&self, instance_id: &str, reason: &str) {
        warn!(
            event = "action_fallback",
            actor = %self.actor,
            instance_id = %instance_id,
            from = "hibernate",
            to = "stop",
            reason = %reason,
            "Hibernation unsupported, falling back to stop"
        );
    }

    pub fn log_action_failed(&self, instance_id: &str, action: ActionKind, attempts: u32, reason: &str) {
        warn!(
            event = "action_failed",
            actor = %self.actor,
            instance_id = %instance_id,
            action = %action,
            attempts = attempts,
            reason = %reason,
            "Lifecycle action failed"
        );
    }

    pub fn log_write_conflict(&self, instance_id: &str, holder: &str) {
        info!(
            event = "write_conflict",
            actor = %self.actor,
            instance_id = %instance_id,
            holder = %holder,
            "Concurrent writer owns this episode, recording no-op"
        );
    }

    pub fn log_unreachable(&self, instance_id: &str, reason: &str) {
        warn!(
            event = "instance_unreachable",
            actor = %self.actor,
            instance_id = %instance_id,
            reason = %reason,
            "Instance skipped this cycle"
        );
    }

    pub fn log_cycle_complete(
        &self,
        evaluated: usize,
        skipped: usize,
        confirmed: usize,
        actions: usize,
        duration_ms: u128,
    ) {
        info!(
            event = "cycle_complete",
            actor = %self.actor,
            evaluated = evaluated,
            skipped = skipped,
            confirmed = confirmed,
            actions = actions,
            duration_ms = duration_ms as u64,
            "Detection cycle complete"
        );
    }

    pub fn log_startup(&self, version: &str, mode: &str) {
        info!(
            event = "agent_started",
            actor = %self.actor,
            version = %version,
            mode = %mode,
            "Idle detection started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            actor = %self.actor,
            reason = %reason,
            "Idle detection shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_collectors() {
        let a = IdleMetrics::new();
        let b = IdleMetrics::new();

        let before = b.classification_count(Classification::Working);
        a.inc_classification(Classification::Working);
        assert!(b.classification_count(Classification::Working) > before);

        a.observe_cycle_latency(0.2);
        a.observe_instance_latency(0.01);
        a.set_instances_monitored(3);
        a.inc_unreachable();
        a.inc_write_conflict();
    }

    #[test]
    fn test_action_counter_labels() {
        let metrics = IdleMetrics::new();
        let before = metrics.action_count(ActionKind::Hibernate, "fallback");
        metrics.inc_action(ActionKind::Hibernate, "fallback");
        assert_eq!(metrics.action_count(ActionKind::Hibernate, "fallback"), before + 1);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("fleet-detector");
        assert_eq!(logger.actor(), "fleet-detector");
    }
}
