use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a `Configuration`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no task selected; select at least one task before arming")]
    NoTaskSelected,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failure taxonomy of the engine.
///
/// Only `Configuration` ever reaches the caller of `Engine::arm`. Everything
/// else is caught inside the watcher loops or the pipeline and recorded as an
/// event or a `TaskResult`.
#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("enumeration failed: {0}")]
    Enumeration(String),

    #[error("failed to dismount {mount_point}: {reason}")]
    Dismount { mount_point: String, reason: String },

    #[error("{operation} timed out after {}s", limit.as_secs())]
    TaskTimeout { operation: String, limit: Duration },

    #[error("{0}")]
    TaskExecution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KillSwitchError {
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        KillSwitchError::TaskTimeout { operation: operation.into(), limit }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            KillSwitchError::TaskTimeout { .. } => true,
            KillSwitchError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
