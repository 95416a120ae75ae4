//! On-instance detection loop

use super::lock::RunLock;
use crate::collector::MetricsCollector;
use crate::detector::{Evaluation, Evaluator};
use crate::error::{IdleError, IdleResult};
use crate::health::{components, HealthRegistry};
use crate::models::Instance;
use crate::observability::StructuredLogger;
use crate::policy::ThresholdProfile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Time between triggers (default: 2 minutes)
    pub interval: Duration,
    pub lock_path: PathBuf,
    /// Age after which a lock is assumed to belong to a crashed run
    pub lock_stale: Duration,
    /// Last resolved profile, used when resolution is unavailable
    pub profile_cache_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            lock_path: PathBuf::from("/var/run/idlewatch/agent.lock"),
            lock_stale: Duration::from_secs(600),
            profile_cache_path: PathBuf::from("/var/lib/idlewatch/profile.json"),
        }
    }
}

/// Resolve the agent's profile, falling back to the on-disk cache.
///
/// A freshly resolved profile replaces the cache. With neither available
/// the agent cannot start.
pub async fn bootstrap_profile(
    resolved: IdleResult<ThresholdProfile>,
    cache_path: &Path,
) -> IdleResult<ThresholdProfile> {
    match resolved {
        Ok(profile) => {
            if let Err(e) = write_cache(cache_path, &profile).await {
                warn!(path = %cache_path.display(), error = %e, "Failed to cache profile");
            }
            Ok(profile)
        }
        Err(resolve_err) => {
            warn!(error = %resolve_err, "Profile resolution failed, using cached profile");
            let bytes = fs::read(cache_path).await.map_err(|e| {
                IdleError::ProfileResolution(format!(
                    "{}; no cached profile at {}: {}",
                    resolve_err,
                    cache_path.display(),
                    e
                ))
            })?;
            serde_json::from_slice(&bytes).map_err(|e| {
                IdleError::ProfileResolution(format!(
                    "{}; cached profile unreadable: {}",
                    resolve_err, e
                ))
            })
        }
    }
}

async fn write_cache(path: &Path, profile: &ThresholdProfile) -> IdleResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, serde_json::to_vec_pretty(profile)?).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

pub struct LocalAgent {
    instance: Instance,
    profile: ThresholdProfile,
    collector: Arc<dyn MetricsCollector>,
    evaluator: Arc<Evaluator>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    config: AgentConfig,
}

impl LocalAgent {
    pub fn new(
        instance: Instance,
        profile: ThresholdProfile,
        collector: Arc<dyn MetricsCollector>,
        evaluator: Arc<Evaluator>,
        config: AgentConfig,
    ) -> Self {
        let logger = StructuredLogger::new(evaluator.actor());
        Self {
            instance,
            profile,
            collector,
            evaluator,
            health: None,
            logger,
            config,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn profile(&self) -> &ThresholdProfile {
        &self.profile
    }

    /// One scheduled run. `Ok(None)` when a previous run still holds the lock.
    pub async fn trigger(&self) -> IdleResult<Option<Evaluation>> {
        let lock = RunLock::acquire(&self.config.lock_path, self.config.lock_stale).await;
        let Some(_lock) = self.audited(lock, "run lock unavailable").await? else {
            info!(
                instance_id = %self.instance.id,
                "Previous run still in progress, skipping trigger"
            );
            return Ok(None);
        };

        let sample = self
            .audited(
                self.collector.collect(&self.instance).await,
                "metrics collection failed",
            )
            .await?;
        let evaluation = self
            .evaluator
            .evaluate(&self.instance, sample, &self.profile)
            .await?;
        debug!(
            instance_id = %self.instance.id,
            classification = %evaluation.classification,
            "Local trigger complete"
        );
        Ok(Some(evaluation))
    }

    /// Pass a step's result through, auditing it when it failed
    async fn audited<T>(&self, result: IdleResult<T>, what: &str) -> IdleResult<T> {
        if let Err(e) = &result {
            self.evaluator
                .record_failure(&self.instance.id, format!("{}: {}", what, e))
                .await;
        }
        result
    }

    async fn trigger_logged(&self) {
        match self.trigger().await {
            Ok(_) => {
                if let Some(health) = &self.health {
                    health.record_success(components::LOCAL_AGENT).await;
                }
            }
            Err(e) => {
                error!(instance_id = %self.instance.id, error = %e, "Local trigger failed");
                if let Some(health) = &self.health {
                    health
                        .record_failure(components::LOCAL_AGENT, e.to_string())
                        .await;
                }
            }
        }
    }

    /// Trigger on the configured schedule until shutdown.
    ///
    /// A failed trigger never ends the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), "local-agent");
        info!(
            instance_id = %self.instance.id,
            profile = %self.profile.name,
            interval_secs = self.config.interval.as_secs(),
            "Starting local agent loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.trigger_logged().await,
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal");
                    break;
                }
            }
        }
    }
}
