//! Shell command templates as the platform boundary
//!
//! Placeholders `{id}`, `{name}` and `{address}` are replaced with
//! single-quoted instance fields before the command runs under `sh -c`.

use crate::collector::RemoteCommandChannel;
use crate::error::{IdleError, IdleResult};
use crate::executor::{LifecycleActions, TransitionResult};
use crate::models::Instance;
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub shell: String,
    /// Prints the instance's `MetricSample` JSON on stdout
    pub probe: String,
    pub stop: String,
    /// `None` when the platform has no hibernation
    pub hibernate: Option<String>,
    /// Output fragments meaning the transition is not possible on the instance
    pub unsupported_markers: Vec<String>,
    /// Output fragments meaning the instance is already transitioning
    pub in_progress_markers: Vec<String>,
    pub timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            probe: "ssh -o BatchMode=yes {address} idlewatch probe".to_string(),
            stop: "aws ec2 stop-instances --instance-ids {id}".to_string(),
            hibernate: Some("aws ec2 stop-instances --hibernate --instance-ids {id}".to_string()),
            unsupported_markers: vec![
                "UnsupportedHibernationConfiguration".to_string(),
                "does not support hibernation".to_string(),
                "hibernation not configured".to_string(),
            ],
            in_progress_markers: vec![
                "IncorrectInstanceState".to_string(),
                "already stopped".to_string(),
                "already stopping".to_string(),
            ],
            timeout: Duration::from_secs(60),
        }
    }
}

/// Quote a value for POSIX `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Fill a command template for one instance
pub fn render(template: &str, instance: &Instance) -> String {
    let address = instance.address.as_deref().unwrap_or(&instance.id);
    template
        .replace("{id}", &shell_quote(&instance.id))
        .replace("{name}", &shell_quote(instance.display_name()))
        .replace("{address}", &shell_quote(address))
}

async fn run(config: &CommandConfig, command_line: &str) -> IdleResult<Output> {
    debug!(command = %command_line, "Running platform command");
    let mut command = Command::new(&config.shell);
    command.arg("-c").arg(command_line).kill_on_drop(true);

    tokio::time::timeout(config.timeout, command.output())
        .await
        .map_err(|_| IdleError::timeout("platform command", config.timeout))?
        .map_err(IdleError::Io)
}

/// Classify a command's result against the configured markers
pub fn interpret(config: &CommandConfig, success: bool, stdout: &str, stderr: &str) -> TransitionResult {
    let find = |markers: &[String]| {
        markers
            .iter()
            .find(|m| stdout.contains(m.as_str()) || stderr.contains(m.as_str()))
            .cloned()
    };

    if let Some(marker) = find(&config.unsupported_markers) {
        return TransitionResult::Unsupported(marker);
    }
    if find(&config.in_progress_markers).is_some() {
        return TransitionResult::AlreadyInProgress;
    }
    if success {
        TransitionResult::Accepted
    } else {
        let detail = stderr.trim();
        TransitionResult::Failed(if detail.is_empty() {
            "command failed without output".to_string()
        } else {
            detail.to_string()
        })
    }
}

/// Lifecycle actions carried out by shell commands
#[derive(Debug, Clone, Default)]
pub struct CommandLifecycle {
    config: CommandConfig,
}

impl CommandLifecycle {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    async fn transition(&self, template: &str, instance: &Instance) -> TransitionResult {
        match run(&self.config, &render(template, instance)).await {
            Ok(output) => interpret(
                &self.config,
                output.status.success(),
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Platform command did not run");
                TransitionResult::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl LifecycleActions for CommandLifecycle {
    async fn stop(&self, instance: &Instance) -> TransitionResult {
        self.transition(&self.config.stop, instance).await
    }

    async fn hibernate(&self, instance: &Instance) -> TransitionResult {
        match &self.config.hibernate {
            Some(template) => self.transition(template, instance).await,
            None => TransitionResult::Unsupported("no hibernate command configured".to_string()),
        }
    }
}

/// Remote sampling through the probe command template
#[derive(Debug, Clone, Default)]
pub struct CommandChannel {
    config: CommandConfig,
}

impl CommandChannel {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteCommandChannel for CommandChannel {
    async fn query(&self, instance: &Instance) -> IdleResult<String> {
        let output = run(&self.config, &render(&self.config.probe, instance)).await?;
        if !output.status.success() {
            return Err(IdleError::Collection(format!(
                "probe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
