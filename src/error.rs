//! Error types for the Formgate service.

use thiserror::Error;

/// Main error type for Formgate operations.
#[derive(Error, Debug)]
pub enum FormgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client record storage errors
    #[error("Storage error: {0}")]
    Store(#[from] crate::ratelimit::StoreError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for FormgateError {
    fn from(err: ::config::ConfigError) -> Self {
        FormgateError::Config(err.to_string())
    }
}

/// Result type alias for Formgate operations.
pub type Result<T> = std::result::Result<T, FormgateError>;
