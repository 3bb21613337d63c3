//! Error types for hostrun-exec

use std::time::Duration;

use thiserror::Error;

use crate::result::{CommandResult, Stream};

/// Number of trailing output lines quoted in failure messages
const FAILURE_TAIL_LINES: usize = 10;

/// Errors that can occur while connecting or executing commands
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailed {
        /// Endpoint that was being connected to
        endpoint: String,
        /// Transport-level reason
        reason: String,
    },

    /// Authentication failed
    #[error("authentication to {endpoint} failed: {reason}")]
    AuthenticationFailed {
        /// Endpoint that rejected authentication
        endpoint: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// Channel establishment exceeded the configured connect timeout
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Endpoint that was being connected to
        endpoint: String,
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process or remote session could not be started
    #[error("failed to start command: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// Command ran to completion with a nonzero exit status
    #[error("{}", describe_failure(result))]
    CommandFailed {
        /// Full result of the failed command
        result: Box<CommandResult>,
    },

    /// Command timed out
    #[error("command `{}` timed out after {timeout:?}", partial.command())]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
        /// Output captured up to the timeout
        partial: Box<CommandResult>,
    },

    /// Sudo password rejected or escalation denied
    #[error("sudo escalation failed for `{}`: {reason}", result.command())]
    EscalationFailed {
        /// Why escalation was considered failed
        reason: String,
        /// Output captured from sudo, including its own error text
        result: Box<CommandResult>,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Target string could not be parsed
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

/// Coarse classification of an [`ExecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel establishment failed
    Connect,
    /// Process or session could not be started, or broke mid-flight
    Execution,
    /// Command exited nonzero
    CommandFailure,
    /// Execution exceeded its time bound
    Timeout,
    /// Privilege escalation failed
    Escalation,
    /// Caller-supplied configuration was invalid
    Config,
}

impl ExecError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::ConnectionFailed { .. }
            | ExecError::AuthenticationFailed { .. }
            | ExecError::ConnectTimeout { .. }
            | ExecError::SshKeyError(_) => ErrorKind::Connect,
            ExecError::SpawnError(_) | ExecError::IoError(_) | ExecError::NotConnected => {
                ErrorKind::Execution
            }
            ExecError::CommandFailed { .. } => ErrorKind::CommandFailure,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::EscalationFailed { .. } => ErrorKind::Escalation,
            ExecError::ConfigError(_) | ExecError::InvalidTarget(_) => ErrorKind::Config,
        }
    }

    /// Result attached to this error, possibly partial
    #[must_use]
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            ExecError::CommandFailed { result } | ExecError::EscalationFailed { result, .. } => {
                Some(result)
            }
            ExecError::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed { .. }
                | ExecError::ConnectTimeout { .. }
                | ExecError::Timeout { .. }
        )
    }
}

fn describe_failure(result: &CommandResult) -> String {
    let mut message = format!(
        "command `{}` exited with status {}",
        result.command(),
        result.exited()
    );
    // Under a pty everything lands in stdout
    let stream = if result.pty() {
        Stream::Stdout
    } else {
        Stream::Stderr
    };
    let tail = result.tail(stream, FAILURE_TAIL_LINES);
    if !tail.is_empty() {
        message.push_str(":\n");
        message.push_str(&tail);
    }
    message
}
