//! Remote collection through a read-only command channel
//!
//! The channel runs the local sampler on the instance and returns its JSON
//! output. Any failure, including a timeout, surfaces as `Unreachable` so
//! the caller skips the instance instead of inferring idleness.

use super::MetricsCollector;
use crate::error::{IdleError, IdleResult};
use crate::models::{Instance, MetricSample, MetricSource};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Runs the sampling query on a remote instance
#[async_trait]
pub trait RemoteCommandChannel: Send + Sync {
    /// Raw JSON `MetricSample` produced on the instance
    async fn query(&self, instance: &Instance) -> IdleResult<String>;
}

pub struct RemoteCollector {
    channel: Arc<dyn RemoteCommandChannel>,
    timeout: Duration,
}

impl RemoteCollector {
    pub fn new(channel: Arc<dyn RemoteCommandChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }
}

#[async_trait]
impl MetricsCollector for RemoteCollector {
    async fn collect(&self, instance: &Instance) -> IdleResult<MetricSample> {
        let output = match tokio::time::timeout(self.timeout, self.channel.query(instance)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(IdleError::unreachable(&instance.id, e.to_string())),
            Err(_) => {
                return Err(IdleError::unreachable(
                    &instance.id,
                    format!("no response within {}ms", self.timeout.as_millis()),
                ))
            }
        };

        let mut sample: MetricSample = serde_json::from_str(output.trim()).map_err(|e| {
            IdleError::unreachable(&instance.id, format!("malformed probe output: {}", e))
        })?;

        // The instance's own clock and id are not trusted for coordination
        sample.instance_id = instance.id.clone();
        sample.timestamp = Utc::now();
        sample.source = MetricSource::FleetDetector;
        Ok(sample)
    }
}
