//! CLI error types

use converge_engine::ConvergeError;
use thiserror::Error;

/// CLI error types
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be read or merged
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Configuration loaded but is not usable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Run could not start
    #[error(transparent)]
    Engine(#[from] ConvergeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
