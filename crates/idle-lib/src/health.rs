//! Component health for liveness and readiness probes
//!
//! Components report each unit of work. A single failure degrades the
//! component; `UNHEALTHY_AFTER` consecutive failures mark it unhealthy,
//! and one success restores it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures before a component is reported unhealthy
pub const UNHEALTHY_AFTER: u32 = 3;

/// Ordered from best to worst so the aggregate is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn failing(failures: u32, message: String) -> Self {
        let status = if failures >= UNHEALTHY_AFTER {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        Self {
            status,
            message: Some(message),
            consecutive_failures: failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const FLEET_DETECTOR: &str = "fleet_detector";
    pub const LOCAL_AGENT: &str = "local_agent";
    pub const STATE_STORE: &str = "state_store";
    pub const EXECUTOR: &str = "executor";
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::healthy);
    }

    pub async fn record_success(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let failures = components
            .get(name)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
            + 1;
        components.insert(
            name.to_string(),
            ComponentHealth::failing(failures, message.into()),
        );
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let initialized = *self.ready.read().await;
        let status = self.health().await.status;

        let reason = match (initialized, status.is_operational()) {
            (false, _) => Some("Detection not yet initialized"),
            (true, false) => Some("A component is unhealthy"),
            (true, true) => None,
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}
