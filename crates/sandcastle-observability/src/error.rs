//! Error types for observability

use thiserror::Error;

/// Errors raised while setting up logging or exporting metrics
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// Logging subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// A metric could not be created or registered
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Gathered metrics could not be encoded
    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Result type alias for observability operations
pub type Result<T> = std::result::Result<T, ObservabilityError>;
