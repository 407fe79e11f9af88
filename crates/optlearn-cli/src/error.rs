//! Error types for the optlearn CLI.

use optlearn::EiError;
use thiserror::Error;

/// CLI result type alias.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    /// IO error while reading the configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or inconsistent configuration file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Evaluation failed.
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EiError),

    /// Feature not available.
    #[error("Feature not available: {0}. Enable with --features {1}")]
    FeatureNotAvailable(String, String),
}

impl From<toml::de::Error> for CliError {
    fn from(e: toml::de::Error) -> Self {
        CliError::Config(e.to_string())
    }
}
