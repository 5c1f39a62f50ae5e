use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    /// The forwarding engine exited while it was expected to keep running.
    #[error("engine process crashed: {reason}")]
    ProcessCrash { reason: String },

    /// The engine's control endpoint could not be reached (refused, timed out).
    #[error("control endpoint unreachable ({operation}): {reason}")]
    ControlUnreachable { operation: String, reason: String },

    /// The engine answered with a client-side (4xx) rejection.
    #[error("control request rejected ({operation}, HTTP {status}): {message}")]
    ControlRejected {
        operation: String,
        status: u16,
        message: String,
    },

    /// The engine answered with a server-side failure.
    #[error("control request failed ({operation}, HTTP {status}): {message}")]
    ControlFailed {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("event stream disconnected: {0}")]
    StreamDisconnect(String),

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("domain suffix '{suffix}' is already claimed by running instance (PID {pid})")]
    DomainConflict { suffix: String, pid: u32 },

    #[error("daemon already running with PID {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("engine API port {port} is already in use by another process")]
    PortInUse { port: u16 },

    #[error("privilege check failed: {0}")]
    PrivilegeCheck(String),

    #[error("engine did not become healthy within {0:?}")]
    StartupTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon answered a control request with an error.
    #[error("{0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaemonError {
    pub fn unreachable(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::ControlUnreachable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is recovered locally by a retry loop. Fatal startup
    /// errors (privileges, domain conflicts, bad config) never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProcessCrash { .. }
            | Self::ControlUnreachable { .. }
            | Self::ControlFailed { .. }
            | Self::StreamDisconnect(_)
            | Self::StartupTimeout(_) => true,
            Self::ControlRejected { .. }
            | Self::ConfigValidation(_)
            | Self::DomainConflict { .. }
            | Self::AlreadyRunning { .. }
            | Self::PortInUse { .. }
            | Self::PrivilegeCheck(_)
            | Self::Protocol(_)
            | Self::Remote(_)
            | Self::Io(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Short machine-friendly name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessCrash { .. } => "process-crash",
            Self::ControlUnreachable { .. } => "control-unreachable",
            Self::ControlRejected { .. } => "control-rejected",
            Self::ControlFailed { .. } => "control-failed",
            Self::StreamDisconnect(_) => "stream-disconnect",
            Self::ConfigValidation(_) => "config-validation",
            Self::DomainConflict { .. } => "domain-conflict",
            Self::AlreadyRunning { .. } => "already-running",
            Self::PortInUse { .. } => "port-in-use",
            Self::PrivilegeCheck(_) => "privilege-check",
            Self::StartupTimeout(_) => "startup-timeout",
            Self::Protocol(_) => "protocol",
            Self::Remote(_) => "remote",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_startup_errors_are_not_retryable() {
        let conflict = DaemonError::DomainConflict {
            suffix: "abc".into(),
            pid: 42,
        };
        assert!(!conflict.is_retryable());
        assert!(!DaemonError::PrivilegeCheck("sudo".into()).is_retryable());
        assert!(!DaemonError::ConfigValidation("x".into()).is_retryable());
    }

    #[test]
    fn local_recovery_errors_are_retryable() {
        assert!(DaemonError::unreachable("health", "refused").is_retryable());
        assert!(DaemonError::StreamDisconnect("eof".into()).is_retryable());
        assert!(DaemonError::ProcessCrash {
            reason: "exit 1".into()
        }
        .is_retryable());
    }

    #[test]
    fn rejected_is_distinct_from_unreachable() {
        let err = DaemonError::ControlRejected {
            operation: "add_namespace".into(),
            status: 422,
            message: "bad selector".into(),
        };
        assert_eq!(err.kind(), "control-rejected");
        assert!(err.to_string().contains("422"));
    }
}
