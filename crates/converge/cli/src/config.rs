//! CLI configuration
//!
//! Layered with the `config` crate: built-in defaults, then the
//! configuration file, then `CONVERGE_*` environment variables using `__`
//! between nested keys (`CONVERGE_CREDENTIALS__MASTER`,
//! `CONVERGE_ENGINE__RETRY__MAX_ATTEMPTS`).

use crate::error::{CliError, CliResult};
use converge_engine::{dependency_order, CredentialPolicy, EngineConfig};
use converge_types::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Full configuration of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub platform: PlatformConfig,

    /// Credential sources; values are redacted when printed
    #[serde(default)]
    pub credentials: CredentialPolicy,

    /// Managed services in configuration order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Platform access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_helm_bin")]
    pub helm_bin: String,

    /// Kube context; the current context when unset
    #[serde(default)]
    pub kube_context: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            helm_bin: default_helm_bin(),
            kube_context: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_helm_bin() -> String {
    "helm".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CliConfig {
    /// Load and validate configuration.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&str>) -> CliResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&CliConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::with_name(path).required(true));
            }
            None => {
                if let Some(default) = Self::default_config_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONVERGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: CliConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every service and the dependency graph
    pub fn validate(&self) -> CliResult<()> {
        for spec in &self.services {
            spec.validate()
                .map_err(|e| CliError::Config(format!("service {}: {}", spec.name, e)))?;
        }
        dependency_order(&self.services).map_err(|e| CliError::Config(e.to_string()))?;
        Ok(())
    }

    /// `<config dir>/converge/config.yaml`
    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("converge").join("config.yaml"))
    }
}
