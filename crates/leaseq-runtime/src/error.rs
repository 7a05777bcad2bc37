//! Error types for queue operations.

use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ValidationError),

    #[error("Queue {queue_name} does not exist")]
    QueueNotFound { queue_name: String },

    #[error("Log {operation} failed: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt log record at line {line}: {message}")]
    CorruptRecord { line: usize, message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl QueueError {
    /// Wrap an I/O failure with the log operation that caused it
    pub fn io(operation: &str, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.to_string(),
            source,
        }
    }

    /// Check if error is transient. Nothing in this crate retries; callers may.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => false,
            Self::QueueNotFound { .. } => false,
            Self::Io { .. } => true,
            Self::CorruptRecord { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::Configuration(_) => false,
        }
    }
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Errors raised by clock implementations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("Clock does not support {operation}")]
    Unsupported { operation: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
