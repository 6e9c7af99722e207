//! Error types for db-execfilter.
//!
//! Defines the error enum returned by command execution, dispatch and
//! materialization.

use std::time::Duration;
use thiserror::Error;

/// Main error type for command execution.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The connection could not produce a command (closed, unreachable, auth failed).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The driver rejected the command (syntax errors, constraint violations, etc.)
    #[error("Command error: {0}")]
    Command(String),

    /// The command did not complete within its timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// A result could not be converted into the requested shape.
    #[error("Materialization error: {0}")]
    Materialize(String),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The installed results filter does not answer this query shape.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration errors (invalid config file, bad connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a command error with the given message.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Creates a materialization error with the given message.
    pub fn materialize(msg: impl Into<String>) -> Self {
        Self::Materialize(msg.into())
    }

    /// Creates an unsupported-capability error with the given message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error represents a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Command(_) => "Command Error",
            Self::Timeout(_) => "Timeout",
            Self::Materialize(_) => "Materialization Error",
            Self::Cancelled => "Cancelled",
            Self::Unsupported(_) => "Unsupported",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using ExecError.
pub type Result<T> = std::result::Result<T, ExecError>;
