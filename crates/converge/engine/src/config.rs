//! Engine configuration

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one convergence run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a single install or upgrade
    #[serde(default = "default_converge_timeout")]
    pub converge_timeout_secs: u64,

    /// Upper bound for a single read-only platform query
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Structural repairs (unlock, ownership) allowed per service before
    /// giving up on the run
    #[serde(default = "default_max_structural_passes")]
    pub max_structural_passes: u32,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            converge_timeout_secs: default_converge_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            max_structural_passes: default_max_structural_passes(),
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn converge_timeout(&self) -> Duration {
        Duration::from_secs(self.converge_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Retry of transient platform failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

/// Post-action verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Wait before the single re-check of a workload that is not ready yet
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_delay(),
        }
    }
}

/// Size of the diagnostic bundle gathered on verification failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: u32,

    #[serde(default = "default_event_limit")]
    pub event_limit: u32,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: default_log_tail_lines(),
            event_limit: default_event_limit(),
        }
    }
}

// Default value functions
fn default_converge_timeout() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_max_structural_passes() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_settle_delay() -> u64 {
    30
}

fn default_log_tail_lines() -> u32 {
    50
}

fn default_event_limit() -> u32 {
    20
}
