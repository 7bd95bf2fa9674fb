//! Error types for Turnstile.

use thiserror::Error;

use crate::connection::SseConnectionLimitError;
use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store failed or could not be reached
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// A connection ceiling would be exceeded
    #[error(transparent)]
    ConnectionLimit(#[from] SseConnectionLimitError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Returns the limit error if this is a connection-limit rejection.
    pub fn as_connection_limit(&self) -> Option<&SseConnectionLimitError> {
        match self {
            AdmissionError::ConnectionLimit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for AdmissionError {
    fn from(e: config::ConfigError) -> Self {
        AdmissionError::Config(e.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
