//! Lifecycle action execution
//!
//! Turns a confirmed idle episode into exactly one terminal action:
//! - `notify`: audit plus an optional notice, no lifecycle change
//! - `hibernate`: falls back to `stop` when the platform reports it
//!   unsupported, and remembers that for the instance
//! - `stop`: bounded retries with exponential backoff, then a recorded
//!   failure that releases the claim for a later cycle
//!
//! Every attempt first claims the episode through `StateSync`.

mod engine;
mod notify;
mod rate;

#[cfg(test)]
mod tests;

pub use engine::{ActionExecutor, ActionOutcome, ActionRequest};
pub use notify::{LogSink, Notice, NotificationSink, WebhookAlert, WebhookPayload, WebhookSink};
pub use rate::RateLimiter;

use crate::models::Instance;
use async_trait::async_trait;
use std::time::Duration;

/// Answer of the platform to a transition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Request accepted; the platform completes it asynchronously
    Accepted,
    /// The instance is already in or moving to the target state
    AlreadyInProgress,
    /// The platform cannot perform this transition on this instance
    Unsupported(String),
    Failed(String),
}

/// Platform lifecycle operations on a single instance
#[async_trait]
pub trait LifecycleActions: Send + Sync {
    async fn stop(&self, instance: &Instance) -> TransitionResult;
    async fn hibernate(&self, instance: &Instance) -> TransitionResult;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Log and audit only; never claim or touch the platform
    pub dry_run: bool,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Terminal actions per rolling hour, `0` for no cap
    pub max_actions_per_hour: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_actions_per_hour: 10,
        }
    }
}
