//! Fleet-wide periodic detection
//!
//! Each cycle lists the inventory and evaluates every running, reachable
//! instance with bounded concurrency. A stuck instance only costs its own
//! timeout; the rest of the fleet proceeds.

use super::evaluator::Evaluator;
use super::inventory::InstanceInventory;
use crate::audit::AuditLog;
use crate::collector::MetricsCollector;
use crate::error::{IdleError, IdleResult};
use crate::executor::ActionOutcome;
use crate::health::{components, HealthRegistry};
use crate::models::{AuditEntry, AuditOutcome, Classification, Instance};
use crate::observability::{IdleMetrics, StructuredLogger};
use crate::policy::PolicyResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Time between cycles (default: 60 seconds)
    pub interval: Duration,
    /// Instances evaluated at the same time (default: 5)
    pub max_concurrent: usize,
    /// Bound on remote collection for one instance (default: 30 seconds)
    pub instance_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_concurrent: 5,
            instance_timeout: Duration::from_secs(30),
        }
    }
}

/// Summary of one detection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evaluated: usize,
    /// Not running, so not evaluated
    pub skipped: usize,
    pub unreachable: usize,
    pub confirmed: usize,
    pub actions_completed: usize,
    pub actions_failed: usize,
    pub errors: usize,
    pub duration_ms: u128,
}

enum InstanceResult {
    Evaluated {
        classification: Classification,
        action: Option<Result<ActionOutcome, String>>,
    },
    Unreachable,
    Error,
}

pub struct FleetDetector {
    inventory: Arc<dyn InstanceInventory>,
    collector: Arc<dyn MetricsCollector>,
    resolver: Arc<PolicyResolver>,
    evaluator: Arc<Evaluator>,
    audit: Arc<AuditLog>,
    health: Option<HealthRegistry>,
    metrics: IdleMetrics,
    logger: StructuredLogger,
    config: FleetConfig,
}

impl FleetDetector {
    pub fn builder() -> FleetDetectorBuilder {
        FleetDetectorBuilder::new()
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Evaluate the whole fleet once
    pub async fn run_cycle(&self) -> IdleResult<CycleReport> {
        let start = Instant::now();
        let instances = self.inventory.list().await?;
        let mut report = CycleReport::default();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for instance in instances {
            if !instance.is_running() {
                debug!(instance_id = %instance.id, state = ?instance.state, "Skipping non-running instance");
                report.skipped += 1;
                continue;
            }

            if !instance.reachable {
                self.record_unreachable(&instance, "inventory marks instance unreachable")
                    .await;
                report.unreachable += 1;
                continue;
            }

            let semaphore = semaphore.clone();
            let collector = self.collector.clone();
            let resolver = self.resolver.clone();
            let evaluator = self.evaluator.clone();
            let audit = self.audit.clone();
            let metrics = self.metrics.clone();
            let logger = self.logger.clone();
            let timeout = self.config.instance_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return InstanceResult::Error;
                };
                let started = Instant::now();

                let collected = match tokio::time::timeout(timeout, collector.collect(&instance)).await {
                    Ok(result) => result,
                    Err(_) => Err(IdleError::unreachable(
                        &instance.id,
                        format!("collection exceeded {}ms", timeout.as_millis()),
                    )),
                };

                let sample = match collected {
                    Ok(sample) => sample,
                    Err(e) => {
                        logger.log_unreachable(&instance.id, &e.to_string());
                        metrics.inc_unreachable();
                        audit
                            .record(AuditEntry::new(
                                &instance.id,
                                logger.actor(),
                                AuditOutcome::Unreachable,
                                e.to_string(),
                            ))
                            .await;
                        return InstanceResult::Unreachable;
                    }
                };

                let resolved = resolver.resolve(&instance);
                let result = evaluator
                    .evaluate(&instance, sample, &resolved.profile)
                    .await;
                metrics.observe_instance_latency(started.elapsed().as_secs_f64());

                match result {
                    Ok(evaluation) => InstanceResult::Evaluated {
                        classification: evaluation.classification,
                        action: evaluation.action,
                    },
                    // The evaluator has already audited the failure
                    Err(e) => {
                        error!(instance_id = %instance.id, error = %e, "Evaluation failed");
                        InstanceResult::Error
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(InstanceResult::Evaluated {
                    classification,
                    action,
                }) => {
                    report.evaluated += 1;
                    if classification == Classification::IdleConfirmed {
                        report.confirmed += 1;
                    }
                    match action {
                        Some(Ok(ActionOutcome::Completed { .. })) => report.actions_completed += 1,
                        Some(Err(_)) => report.actions_failed += 1,
                        _ => {}
                    }
                }
                Ok(InstanceResult::Unreachable) => report.unreachable += 1,
                Ok(InstanceResult::Error) => report.errors += 1,
                Err(e) => {
                    error!(error = %e, "Instance evaluation task panicked");
                    report.errors += 1;
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis();
        self.metrics
            .observe_cycle_latency(start.elapsed().as_secs_f64());
        self.metrics
            .set_instances_monitored(report.evaluated as i64);
        self.logger.log_cycle_complete(
            report.evaluated,
            report.skipped + report.unreachable,
            report.confirmed,
            report.actions_completed,
            report.duration_ms,
        );
        self.update_health(&report).await;

        Ok(report)
    }

    async fn record_unreachable(&self, instance: &Instance, reason: &str) {
        self.logger.log_unreachable(&instance.id, reason);
        self.metrics.inc_unreachable();
        self.audit
            .record(AuditEntry::new(
                &instance.id,
                self.logger.actor(),
                AuditOutcome::Unreachable,
                reason,
            ))
            .await;
    }

    async fn update_health(&self, report: &CycleReport) {
        let Some(health) = &self.health else {
            return;
        };

        if report.errors > 0 {
            health
                .record_failure(
                    components::STATE_STORE,
                    format!("{} evaluation(s) failed", report.errors),
                )
                .await;
        } else {
            health.record_success(components::STATE_STORE).await;
        }

        if report.actions_failed > 0 {
            health
                .record_failure(
                    components::EXECUTOR,
                    format!("{} action(s) failed", report.actions_failed),
                )
                .await;
        } else {
            health.record_success(components::EXECUTOR).await;
        }

        health.record_success(components::FLEET_DETECTOR).await;
    }

    /// Run cycles until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_concurrent = self.config.max_concurrent,
            "Starting fleet detection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Detection cycle failed");
                        if let Some(health) = &self.health {
                            health
                                .record_failure(components::FLEET_DETECTOR, e.to_string())
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal");
                    break;
                }
            }
        }
    }
}

/// Builder for the fleet detector
pub struct FleetDetectorBuilder {
    inventory: Option<Arc<dyn InstanceInventory>>,
    collector: Option<Arc<dyn MetricsCollector>>,
    resolver: Option<Arc<PolicyResolver>>,
    evaluator: Option<Arc<Evaluator>>,
    audit: Option<Arc<AuditLog>>,
    health: Option<HealthRegistry>,
    config: FleetConfig,
}

impl FleetDetectorBuilder {
    pub fn new() -> Self {
        Self {
            inventory: None,
            collector: None,
            resolver: None,
            evaluator: None,
            audit: None,
            health: None,
            config: FleetConfig::default(),
        }
    }

    pub fn inventory(mut self, inventory: Arc<dyn InstanceInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn resolver(mut self, resolver: Arc<PolicyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(mut self, config: FleetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> IdleResult<FleetDetector> {
        fn missing(what: &str) -> IdleError {
            IdleError::InvalidRequest(format!("fleet detector requires {}", what))
        }

        let evaluator = self.evaluator.ok_or_else(|| missing("an evaluator"))?;
        Ok(FleetDetector {
            inventory: self.inventory.ok_or_else(|| missing("an inventory"))?,
            collector: self.collector.ok_or_else(|| missing("a collector"))?,
            resolver: self.resolver.ok_or_else(|| missing("a policy resolver"))?,
            audit: self.audit.ok_or_else(|| missing("an audit log"))?,
            health: self.health,
            metrics: IdleMetrics::new(),
            logger: StructuredLogger::new(evaluator.actor()),
            evaluator,
            config: self.config,
        })
    }
}

impl Default for FleetDetectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
