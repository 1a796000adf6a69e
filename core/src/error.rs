//! Error types for backend operations.

use crate::failure::AggregateFailure;
use parallel_common::CommonError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the backend, the transport and the worker loop.
///
/// The type is serializable so a worker can ship a failure that is fatal to
/// a call back to root inside its task report.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {timeout_ms}ms waiting for rank {rank} during {operation}")]
    Timeout {
        rank: usize,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker execution failed: {0}")]
    WorkerExecution(AggregateFailure),

    #[error("Protocol mismatch on rank {rank}: expected {expected}, found {found}")]
    ProtocolMismatch {
        rank: usize,
        expected: String,
        found: String,
    },

    #[error("Size mismatch in {context}: expected {expected}, found {found}")]
    SizeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session aborted: {0}")]
    SessionAborted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Fatal errors abort the whole session: no partial results survive them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout { .. }
                | Self::ProtocolMismatch { .. }
                | Self::SessionAborted(_)
        )
    }

    pub(crate) fn size_mismatch(context: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::SizeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    pub(crate) fn protocol_mismatch(
        rank: usize,
        expected: impl std::fmt::Display,
        found: impl std::fmt::Display,
    ) -> Self {
        Self::ProtocolMismatch {
            rank,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

impl From<CommonError> for BackendError {
    fn from(err: CommonError) -> Self {
        let message = match &err {
            CommonError::SerializationError { source: Some(src), message }
            | CommonError::DeserializationError { source: Some(src), message } => {
                format!("{}: {}", message, src)
            }
            _ => err.message().to_string(),
        };
        match err {
            CommonError::SerializationError { .. } | CommonError::DeserializationError { .. } => {
                Self::Serialization(message)
            }
            CommonError::NetworkError { .. } => Self::Transport(message),
            CommonError::ConfigurationError { .. } => Self::Configuration(message),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
