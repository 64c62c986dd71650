//! Error types for the guard engine.

use thiserror::Error;

/// Main error type for guard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors, raised at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fail-closed policy could not reach its distributed backend
    #[error("Rate limit backend unavailable for policy {policy}: {source}")]
    Backend {
        policy: &'static str,
        #[source]
        source: BackendError,
    },

    /// Telemetry sink could not be constructed
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a distributed counter backend at call time.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Redis connection, authentication or command failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend did not answer within the configured timeout
    #[error("Backend call timed out after {0}ms")]
    Timeout(u64),

    /// The backend answered with something we cannot interpret
    #[error("Unexpected backend reply: {0}")]
    Protocol(String),
}

impl From<config::ConfigError> for GuardError {
    fn from(err: config::ConfigError) -> Self {
        GuardError::Config(err.to_string())
    }
}

/// Result type alias for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
