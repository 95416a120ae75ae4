//! Error taxonomy for idle detection and lifecycle control

use thiserror::Error;

/// Result type alias for library operations
pub type IdleResult<T> = Result<T, IdleError>;

/// Errors raised by the detection and action components
#[derive(Debug, Error)]
pub enum IdleError {
    /// Remote channel failed; the instance is skipped, never inferred idle
    #[error("instance {instance_id} unreachable: {reason}")]
    Unreachable { instance_id: String, reason: String },

    /// Platform cannot perform the action (hibernation unavailable)
    #[error("{action} unsupported on {instance_id}: {reason}")]
    UnsupportedAction {
        instance_id: String,
        action: String,
        reason: String,
    },

    /// Another actor wrote the record concurrently
    #[error("state write conflict on {instance_id}: record held by {holder}")]
    WriteConflict { instance_id: String, holder: String },

    /// Platform rejected or failed the transition after all retries
    #[error("{action} failed on {instance_id} after {attempts} attempt(s): {reason}")]
    ActionFailed {
        instance_id: String,
        action: String,
        attempts: u32,
        reason: String,
    },

    /// Missing or malformed mandatory global profile
    #[error("profile resolution failed: {0}")]
    ProfileResolution(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("metric collection failed: {0}")]
    Collection(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// Operator request that does not fit the current record
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IdleError {
    pub fn unreachable(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        IdleError::Unreachable {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        IdleError::Timeout {
            operation: operation.into(),
            millis: duration.as_millis() as u64,
        }
    }

    /// Transient failures that a later cycle may succeed on
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdleError::Unreachable { .. }
                | IdleError::Timeout { .. }
                | IdleError::StateStore(_)
                | IdleError::Collection(_)
                | IdleError::Io(_)
        )
    }

    /// Short machine-readable label used in metrics and audit reasons
    pub fn kind(&self) -> &'static str {
        match self {
            IdleError::Unreachable { .. } => "unreachable",
            IdleError::UnsupportedAction { .. } => "unsupported_action",
            IdleError::WriteConflict { .. } => "write_conflict",
            IdleError::ActionFailed { .. } => "action_failed",
            IdleError::ProfileResolution(_) => "profile_resolution",
            IdleError::StateStore(_) => "state_store",
            IdleError::Timeout { .. } => "timeout",
            IdleError::Collection(_) => "collection",
            IdleError::Notification(_) => "notification",
            IdleError::Lock(_) => "lock",
            IdleError::InstanceNotFound(_) => "instance_not_found",
            IdleError::InvalidRequest(_) => "invalid_request",
            IdleError::Io(_) => "io",
            IdleError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_classification() {
        assert!(IdleError::unreachable("i-1", "connection refused").is_retryable());
        assert!(IdleError::timeout("collect", Duration::from_secs(5)).is_retryable());
        assert!(!IdleError::WriteConflict {
            instance_id: "i-1".into(),
            holder: "local-agent".into()
        }
        .is_retryable());
        assert!(!IdleError::ProfileResolution("missing".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = IdleError::timeout("remote probe", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "remote probe timed out after 1500ms");
        assert_eq!(err.kind(), "timeout");
    }
}
