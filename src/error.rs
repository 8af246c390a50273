//! Error types for the FormaOS rate limiter.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum FormaError {
    /// Configuration values that cannot be used
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy that can never be evaluated (zero window, empty prefix, ...)
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Policy file parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, FormaError>;
