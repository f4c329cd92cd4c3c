//! Core error types

use thiserror::Error;

/// Core error type for SonicWave
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be parsed as TOML
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the node cannot run with
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
