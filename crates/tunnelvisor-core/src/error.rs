use crate::process::ProcessId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used across the supervisor
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Error kinds surfaced by supervisor operations
///
/// Every variant carries the tunnel name so callers can report it as-is.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Tunnel '{name}' is already running (PID: {pid})")]
    AlreadyRunning { name: String, pid: ProcessId },

    #[error("Tunnel '{name}' is not running")]
    NotRunning { name: String },

    #[error("Failed to launch '{program}' for tunnel '{name}': {source}")]
    SpawnFailed {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Tunnel '{name}' (PID: {pid}) exited during startup, check log file: {}",
        log_path.display()
    )]
    StartFailed {
        name: String,
        pid: ProcessId,
        log_path: PathBuf,
    },

    #[error("Tunnel '{name}' (PID: {pid}) did not exit after forced termination")]
    StopTimedOut { name: String, pid: ProcessId },

    #[error("Permission denied while signalling tunnel '{name}' (PID: {pid})")]
    PermissionDenied { name: String, pid: ProcessId },

    #[error("Corrupt registry record for tunnel '{name}' at {}: {content:?}", path.display())]
    RegistryCorrupt {
        name: String,
        path: PathBuf,
        content: String,
    },

    #[error("No log file found for tunnel '{name}' at {}", path.display())]
    LogNotFound { name: String, path: PathBuf },

    #[error("Invalid tunnel name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SupervisorError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Only losing access to the state directory aborts an invocation
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::Storage { .. })
    }

    /// Errors the caller may act on and carry on from
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// The tunnel this error refers to, when there is one
    pub fn tunnel_name(&self) -> Option<&str> {
        match self {
            SupervisorError::AlreadyRunning { name, .. }
            | SupervisorError::NotRunning { name }
            | SupervisorError::SpawnFailed { name, .. }
            | SupervisorError::StartFailed { name, .. }
            | SupervisorError::StopTimedOut { name, .. }
            | SupervisorError::PermissionDenied { name, .. }
            | SupervisorError::RegistryCorrupt { name, .. }
            | SupervisorError::LogNotFound { name, .. }
            | SupervisorError::InvalidName { name, .. } => Some(name),
            SupervisorError::InvalidConfig(_)
            | SupervisorError::Storage { .. }
            | SupervisorError::Other(_) => None,
        }
    }
}
