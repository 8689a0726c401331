//! Error types for the Sluice proxy.

use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration sources could not be read or deserialized
    #[error("Configuration source error: {0}")]
    Settings(#[from] ::config::ConfigError),

    /// Downstream HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
