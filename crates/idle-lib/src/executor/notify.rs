//! Notification delivery for idle actions
//!
//! Handles:
//! - Formatting notices as Alertmanager-style webhook payloads
//! - Deduplication of repeated notices within a configurable window
//! - A log-only sink when no webhook is configured

use crate::error::{IdleError, IdleResult};
use crate::models::ActionKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

/// What happened to an instance, as told to humans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub instance_id: String,
    pub instance_name: String,
    pub action: ActionKind,
    /// Final lifecycle state, e.g. "stopped", or "idle" for pure notices
    pub result: String,
    pub idle_minutes: i64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notice: &Notice) -> IdleResult<()>;
}

/// Sink that only writes a log line
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notice: &Notice) -> IdleResult<()> {
        info!(
            event = "notification",
            instance_id = %notice.instance_id,
            action = %notice.action,
            result = %notice.result,
            idle_minutes = notice.idle_minutes,
            "Idle notice"
        );
        Ok(())
    }
}

/// Alertmanager webhook alert format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub alerts: Vec<WebhookAlert>,
}

impl WebhookPayload {
    pub fn from_notice(notice: &Notice) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), "InstanceIdle".to_string());
        labels.insert("severity".to_string(), "info".to_string());
        labels.insert("instance_id".to_string(), notice.instance_id.clone());
        labels.insert("action".to_string(), notice.action.to_string());

        let mut annotations = HashMap::new();
        annotations.insert(
            "summary".to_string(),
            format!(
                "Instance {} idle for {} minutes",
                notice.instance_name, notice.idle_minutes
            ),
        );
        annotations.insert(
            "description".to_string(),
            format!("{}: {} ({})", notice.action, notice.result, notice.reason),
        );

        Self {
            alerts: vec![WebhookAlert {
                status: "firing".to_string(),
                labels,
                annotations,
                starts_at: notice.timestamp.to_rfc3339(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    instance_id: String,
    action: ActionKind,
    result: String,
}

/// Posts notices to an HTTP webhook
pub struct WebhookSink {
    client: Client,
    url: Url,
    dedup_window: Duration,
    recent: RwLock<HashMap<DedupKey, Instant>>,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> IdleResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| IdleError::Notification(format!("invalid webhook url {}: {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdleError::Notification(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            url,
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            recent: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    fn key(notice: &Notice) -> DedupKey {
        DedupKey {
            instance_id: notice.instance_id.clone(),
            action: notice.action,
            result: notice.result.clone(),
        }
    }

    fn should_suppress(&self, notice: &Notice) -> bool {
        let recent = self.recent.read().unwrap_or_else(|e| e.into_inner());
        recent
            .get(&Self::key(notice))
            .map(|last| last.elapsed() < self.dedup_window)
            .unwrap_or(false)
    }

    fn record(&self, notice: &Notice) {
        let mut recent = self.recent.write().unwrap_or_else(|e| e.into_inner());
        recent.insert(Self::key(notice), Instant::now());
        recent.retain(|_, at| at.elapsed() < self.dedup_window);
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, notice: &Notice) -> IdleResult<()> {
        if self.should_suppress(notice) {
            debug!(instance_id = %notice.instance_id, "Suppressing duplicate notice");
            return Ok(());
        }

        let payload = WebhookPayload::from_notice(notice);
        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| IdleError::Notification(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IdleError::Notification(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }

        self.record(notice);
        Ok(())
    }
}
