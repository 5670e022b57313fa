//! Error types for the slms-gate service.

use thiserror::Error;

/// Main error type for slms-gate operations.
///
/// Admission decisions themselves never fail; these errors only arise while
/// loading configuration, validating policies or managing the process
/// lifecycle.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy violates its invariants
    #[error("Invalid policy: {0}")]
    Policy(String),

    /// Background task management errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for GateError {
    fn from(err: ::config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Result type alias for slms-gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
