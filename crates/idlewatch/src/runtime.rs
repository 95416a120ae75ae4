//! Component wiring for each run mode

use crate::api::{self, AppState};
use crate::config::AppConfig;
use anyhow::{Context, Result};
use idle_lib::{
    admin::{AdminService, StatusBoard},
    agent::{bootstrap_profile, LocalAgent},
    audit::AuditLog,
    collector::{MetricsCollector, ProcfsCollector, RemoteCollector},
    detector::{Evaluator, FleetDetector, InstanceInventory, StaticInventory},
    executor::{ActionExecutor, LogSink, NotificationSink, WebhookSink},
    health::{components, HealthRegistry},
    models::{Instance, MetricSample},
    observability::StructuredLogger,
    platform::{CommandChannel, CommandLifecycle},
    policy::PolicyResolver,
    state::{FileStateStore, StateStore, StateSync},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Writer names recorded in the state store
pub mod writers {
    pub const FLEET_DETECTOR: &str = "fleet-detector";
    pub const LOCAL_AGENT: &str = "local-agent";
    pub const OPERATOR: &str = "operator";
}

/// Collaborators shared by every mode
struct Shared {
    store: Arc<dyn StateStore>,
    audit: Arc<AuditLog>,
    health: HealthRegistry,
    notifier: Arc<dyn NotificationSink>,
}

impl Shared {
    async fn open(config: &AppConfig) -> Result<Self> {
        let store = FileStateStore::open(&config.state_dir)
            .await
            .with_context(|| format!("Failed to open state store {}", config.state_dir.display()))?;
        let audit = AuditLog::open(config.audit_config())
            .await
            .context("Failed to open audit log")?;

        let notifier: Arc<dyn NotificationSink> = match &config.notification.webhook_url {
            Some(url) => Arc::new(
                WebhookSink::new(url, Duration::from_secs(config.notification.timeout_secs))
                    .context("Invalid notification webhook")?
                    .with_dedup_window(Duration::from_secs(
                        config.notification.dedup_window_secs,
                    )),
            ),
            None => Arc::new(LogSink),
        };

        Ok(Self {
            store: Arc::new(store),
            audit: Arc::new(audit),
            health: HealthRegistry::new(),
            notifier,
        })
    }

    fn sync(&self, config: &AppConfig, writer: &str) -> StateSync {
        StateSync::new(self.store.clone(), writer, config.sync_config())
    }

    fn executor(&self, config: &AppConfig, writer: &str) -> Arc<ActionExecutor> {
        let platform = Arc::new(CommandLifecycle::new(config.command_config()));
        Arc::new(
            ActionExecutor::new(
                self.sync(config, writer),
                platform,
                self.audit.clone(),
                config.executor_config(),
            )
            .with_notifier(self.notifier.clone()),
        )
    }
}

async fn shutdown_signal(logger: &StructuredLogger, tx: &broadcast::Sender<()>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    let _ = tx.send(());
    Ok(())
}

/// Resolves once the API server task ends; stays pending when there is none
async fn api_exited(handle: &mut Option<JoinHandle<Result<()>>>) -> anyhow::Error {
    let Some(task) = handle.as_mut() else {
        return std::future::pending().await;
    };
    let result = task.await;
    *handle = None;
    match result {
        Ok(Ok(())) => anyhow::anyhow!("API server exited"),
        Ok(Err(e)) => e.context("API server failed"),
        Err(e) => anyhow::Error::new(e).context("API server task ended abnormally"),
    }
}

/// Wait for a shutdown signal, or shut down early if the API server dies
async fn wait_for_shutdown(
    logger: &StructuredLogger,
    tx: &broadcast::Sender<()>,
    api_handle: &mut Option<JoinHandle<Result<()>>>,
) -> Result<()> {
    tokio::select! {
        signal = shutdown_signal(logger, tx) => signal,
        err = api_exited(api_handle) => {
            error!(error = %format!("{:#}", err), "API server stopped, shutting down");
            logger.log_shutdown("API server stopped");
            let _ = tx.send(());
            Err(err)
        }
    }
}

/// Fleet detector plus the HTTP API
pub async fn run_fleet(config: AppConfig) -> Result<()> {
    let logger = StructuredLogger::new(writers::FLEET_DETECTOR);
    logger.log_startup(VERSION, "fleet");

    let shared = Shared::open(&config).await?;
    for component in [
        components::FLEET_DETECTOR,
        components::STATE_STORE,
        components::EXECUTOR,
    ] {
        shared.health.register(component).await;
    }

    let resolver = Arc::new(PolicyResolver::new(config.policy.clone())?);
    let inventory: Arc<dyn InstanceInventory> = Arc::new(StaticInventory::new(config.inventory()));
    let board = Arc::new(StatusBoard::new());
    let executor = shared.executor(&config, writers::FLEET_DETECTOR);

    if !config.fleet.auto_execute {
        warn!("Automatic execution disabled; confirmed idleness is only recorded");
    }
    let evaluator = Evaluator::new(
        shared.sync(&config, writers::FLEET_DETECTOR),
        config.fleet.auto_execute.then(|| executor.clone()),
        shared.audit.clone(),
    )
    .with_status_board(board.clone());

    let collector = RemoteCollector::new(
        Arc::new(CommandChannel::new(config.command_config())),
        config.fleet_config().instance_timeout,
    );

    let detector = FleetDetector::builder()
        .inventory(inventory.clone())
        .collector(Arc::new(collector))
        .resolver(resolver.clone())
        .evaluator(Arc::new(evaluator))
        .audit(shared.audit.clone())
        .health(shared.health.clone())
        .config(config.fleet_config())
        .build()?;

    let admin = AdminService::new(
        inventory,
        resolver,
        shared.sync(&config, writers::OPERATOR),
        shared.audit.clone(),
        board,
    )
    .with_executor(executor);

    let state = Arc::new(AppState::new(shared.health.clone()).with_admin(Arc::new(admin)));
    let mut api_handle = Some(tokio::spawn(api::serve(config.api_port, state)));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let detector_handle = tokio::spawn(detector.run(shutdown_rx));
    shared.health.set_ready(true).await;

    let stopped = wait_for_shutdown(&logger, &shutdown_tx, &mut api_handle).await;
    if detector_handle.await.is_err() {
        warn!("Fleet detection loop ended abnormally");
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }
    info!("Shutting down");

    stopped
}

/// Options of the agent mode
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub instance_id: String,
    /// Run a single trigger and exit
    pub once: bool,
    /// Serve health and metrics while looping
    pub serve_api: bool,
}

/// Local agent on the instance it runs on
pub async fn run_agent(config: AppConfig, options: AgentOptions) -> Result<()> {
    let logger = StructuredLogger::new(writers::LOCAL_AGENT);
    logger.log_startup(VERSION, "agent");

    let shared = Shared::open(&config).await?;
    shared.health.register(components::LOCAL_AGENT).await;

    let instance = config
        .inventory()
        .into_iter()
        .find(|i| i.id == options.instance_id || i.name == options.instance_id)
        .unwrap_or_else(|| Instance::new(&options.instance_id));

    let agent_config = config.agent_config();
    let resolved = PolicyResolver::new(config.policy.clone())
        .map(|resolver| resolver.resolve(&instance).profile);
    let profile = bootstrap_profile(resolved, &agent_config.profile_cache_path).await?;
    info!(
        instance_id = %instance.id,
        profile = %profile.name,
        idle_minutes = profile.idle_minutes,
        "Agent profile resolved"
    );

    let executor = shared.executor(&config, writers::LOCAL_AGENT);
    let evaluator = Evaluator::new(
        shared.sync(&config, writers::LOCAL_AGENT),
        Some(executor),
        shared.audit.clone(),
    );
    let agent = LocalAgent::new(
        instance,
        profile,
        Arc::new(ProcfsCollector::new()),
        Arc::new(evaluator),
        agent_config,
    )
    .with_health(shared.health.clone());

    if options.once {
        match agent.trigger().await? {
            Some(evaluation) => info!(
                instance_id = %evaluation.instance_id,
                classification = %evaluation.classification,
                "Single trigger complete"
            ),
            None => info!("Previous run still holds the lock"),
        }
        return Ok(());
    }

    let mut api_handle = options.serve_api.then(|| {
        let state = Arc::new(AppState::new(shared.health.clone()));
        tokio::spawn(api::serve(config.api_port, state))
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let agent_handle = tokio::spawn(agent.run(shutdown_rx));
    shared.health.set_ready(true).await;

    let stopped = wait_for_shutdown(&logger, &shutdown_tx, &mut api_handle).await;
    if agent_handle.await.is_err() {
        warn!("Local agent loop ended abnormally");
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }

    stopped
}

/// One local sample, as returned to the remote command channel
pub async fn probe(instance_id: &str) -> Result<MetricSample> {
    let collector = ProcfsCollector::new();
    let sample = collector
        .collect(&Instance::new(instance_id))
        .await
        .context("Failed to sample local metrics")?;
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_ends_the_wait() {
        let holder = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let state = Arc::new(AppState::new(HealthRegistry::new()));
        let mut handle = Some(tokio::spawn(api::serve(port, state)));

        let err = tokio::time::timeout(Duration::from_secs(5), api_exited(&mut handle))
            .await
            .expect("bind failure should end the server task");
        assert!(err.to_string().contains("API server failed"));
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_no_server_never_ends_the_wait() {
        let mut handle = None;
        let waited = tokio::time::timeout(Duration::from_millis(50), api_exited(&mut handle)).await;
        assert!(waited.is_err());
    }
}
