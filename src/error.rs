//! Error types for wg-provisioner
//!
//! This module defines the error hierarchy for the provisioning service.
//! Errors are grouped by subsystem and carry a recoverability hint so that
//! callers (IPC handler, sweeper, reconciler) can decide whether to retry.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::ipc::ErrorCode;
use crate::peer::ip_allocator::IpAllocatorError;
use crate::subscription::state_machine::InvalidTransition;
use crate::subscription::validation::ValidationError;

/// Top-level error type for wg-provisioner
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Subscription lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Datastore errors raised outside of a use-case (startup, seeding)
    #[error("Datastore error: {0}")]
    Repository(#[from] RepositoryError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProvisionerError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Ipc(e) => e.is_recoverable(),
            Self::Lifecycle(e) => e.is_recoverable(),
            Self::Repository(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// IPC communication errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create Unix socket
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind Unix socket
    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Connection error
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// The server answered with an error response
    #[error("IPC request rejected ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } | Self::SerializationError(_) => {
                false
            }
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            // A timed-out request may have completed; only resubmit after checking
            Self::Remote { code, .. } => matches!(code, ErrorCode::ShuttingDown),
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Relational datastore errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be mapped onto a subscription record
    #[error("Corrupt subscription row {order_id}: {field}: {reason}")]
    CorruptRow {
        order_id: i64,
        field: &'static str,
        reason: String,
    },

    /// No row matched the requested key
    #[error("Subscription {0} not found")]
    NotFound(i64),
}

impl RepositoryError {
    /// Busy/locked databases clear up on retry; corrupt rows do not
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Database(msg) => msg.contains("locked") || msg.contains("busy"),
            Self::CorruptRow { .. } | Self::NotFound(_) => false,
        }
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Errors from the external `WireGuard` control tool
#[derive(Debug, Error)]
pub enum ControlError {
    /// The tool could not be started
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// The tool exited unsuccessfully
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The tool did not finish within the configured bound
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The tool produced output we could not use
    #[error("Unexpected output from `{command}`: {reason}")]
    InvalidOutput { command: String, reason: String },

    /// Peer-config file I/O failed
    #[error("Peer config I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    /// Timeouts and transient spawn failures are worth retrying
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Spawn { .. } => true,
            Self::Failed { .. } | Self::InvalidOutput { .. } => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a timeout error
    pub fn timeout(command: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            command: command.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Create an invalid output error
    pub fn invalid_output(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOutput {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Spool write failed
    #[error("Notification I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be encoded
    #[error("Notification serialization error: {0}")]
    Serialization(String),

    /// The collaborator refused the message
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Errors returned by lifecycle use-cases
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Request rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No client address left in the configured range
    #[error("Address allocation failed: {0}")]
    Allocation(#[from] IpAllocatorError),

    /// Row read/write failed; nothing was committed
    #[error("Datastore error: {0}")]
    Datastore(#[from] RepositoryError),

    /// External tool failure on a path where it is fatal (keypair generation)
    #[error("External tool error: {0}")]
    Control(#[from] ControlError),

    /// The requested status change is not allowed
    #[error("{0}")]
    Transition(#[from] InvalidTransition),

    /// Config artifact could not be written or read
    #[error("Config artifact error at {path}: {reason}")]
    Artifact { path: String, reason: String },

    /// The identifier has already consumed its free trial
    #[error("Free trial already used by {identifier}")]
    TrialAlreadyUsed { identifier: String },

    /// No subscription matched the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access token is unknown or already redeemed
    #[error("Access token is invalid or already used")]
    TokenInvalid,

    /// The lifecycle worker is gone (shutdown in progress)
    #[error("Lifecycle worker is not running")]
    WorkerUnavailable,

    /// The lifecycle worker did not answer in time
    ///
    /// The command may still have run; check `get_status` before retrying.
    #[error("Lifecycle request `{operation}` timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },
}

impl LifecycleError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::Allocation(_)
            | Self::TrialAlreadyUsed { .. }
            | Self::NotFound(_)
            | Self::TokenInvalid
            | Self::Transition(_)
            | Self::Artifact { .. }
            | Self::Timeout { .. } => false,
            Self::Datastore(e) => e.is_recoverable(),
            Self::Control(e) => e.is_recoverable(),
            Self::WorkerUnavailable => true,
        }
    }

    /// Create an artifact error
    pub fn artifact(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::Artifact {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Type alias for Result with `ProvisionerError`
pub type Result<T> = std::result::Result<T, ProvisionerError>;
