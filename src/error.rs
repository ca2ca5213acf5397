//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Only configuration can fail. Admission decisions are always a normal
/// return value, never an error.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate or burst that is not a positive, finite number
    #[error("Invalid rate: {0} (must be a positive, finite number)")]
    InvalidRate(f64),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
