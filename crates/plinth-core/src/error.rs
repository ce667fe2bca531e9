//! Unified error types for Plinth using thiserror.
//!
//! Provides consistent error handling across all components.

use thiserror::Error;

/// The unified error type for Plinth operations
#[derive(Error, Debug)]
pub enum Error {
    /// Operation is not legal for the current entry or component state,
    /// e.g. completing a queue entry twice.
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// The operation was aborted because its cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking wait expired without producing a result.
    #[error("Timed out after {waited_ms}ms: {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    /// The underlying transport failed (network, storage, backend protocol).
    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// User-provided handler code failed.
    #[error("Handler error: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Missing or invalid configuration detected at construction.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Value could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// The component has been closed and no longer accepts operations.
    #[error("{component} is closed")]
    Closed { component: String },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error with source
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler error with source
    pub fn handler_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Handler {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Create a closed error
    pub fn closed(component: impl Into<String>) -> Self {
        Error::Closed {
            component: component.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Timeout { .. })
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this error is an invalid state transition
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState { .. })
    }
}

/// Result type alias for Plinth operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_retryable() {
        assert!(Error::backend("connection reset").is_retryable());
        assert!(Error::timeout("dequeue", Duration::from_secs(5)).is_retryable());
        assert!(!Error::invalid_state("entry already completed").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::closed("queue");
        assert_eq!(err.to_string(), "queue is closed");

        let err = Error::timeout("dequeue", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timed out after 250ms: dequeue");
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::invalid_state("double complete").is_invalid_state());
        assert!(!Error::backend("boom").is_invalid_state());
    }
}
