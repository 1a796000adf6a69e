//! Error handling for the parallel-common crate.

use thiserror::Error;

/// Common error type that abstracts over underlying library errors.
///
/// Every variant carries a human readable message and, optionally, the error
/// that caused it so callers can walk the chain with `std::error::Error::source`.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Serialization failed: {message}")]
    SerializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Deserialization failed: {message}")]
    DeserializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Network operation failed: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

impl CommonError {
    /// Create a serialization error with a custom message.
    pub fn serialization_error<S: Into<String>>(message: S) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with a custom message and source error.
    pub fn serialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a deserialization error with a custom message.
    pub fn deserialization_error<S: Into<String>>(message: S) -> Self {
        Self::DeserializationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a deserialization error with a custom message and source error.
    pub fn deserialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::DeserializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with a custom message and source error.
    pub fn configuration_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a network error with a custom message.
    pub fn network_error<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with a custom message and source error.
    pub fn network_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::SerializationError { message, .. }
            | Self::DeserializationError { message, .. }
            | Self::ConfigurationError { message, .. }
            | Self::NetworkError { message, .. } => message,
        }
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::network_error_with_source(err.to_string(), err)
    }
}
