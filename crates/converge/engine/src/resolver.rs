//! Desired state resolver
//!
//! Derives the target configuration of a service from the credential
//! policy and run flags. Performs no I/O.

use crate::error::ResolveError;
use converge_types::{DesiredState, SecretMap, SecretValue, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where credential values come from.
///
/// A per-service, per-key override wins; otherwise every credential reuses
/// the master value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialPolicy {
    #[serde(default)]
    pub master: Option<SecretValue>,

    /// service name -> credential key -> value
    #[serde(default)]
    pub overrides: BTreeMap<String, BTreeMap<String, SecretValue>>,
}

impl CredentialPolicy {
    pub fn with_master(master: impl Into<SecretValue>) -> Self {
        Self {
            master: Some(master.into()),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, service: &str, key: &str, value: impl Into<SecretValue>) -> Self {
        self.overrides
            .entry(service.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    fn lookup(&self, service: &str, key: &str) -> Option<&SecretValue> {
        self.overrides
            .get(service)
            .and_then(|keys| keys.get(key))
            .or(self.master.as_ref())
    }
}

/// Mode flags of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    /// Permit destroying an absent release's leftover workload and storage
    pub cleanup: bool,
    /// Upgrade unhealthy releases even when credentials already match
    pub force_install: bool,
}

/// Compute the desired state of `spec`
pub fn resolve(spec: &ServiceSpec, policy: &CredentialPolicy, flags: RunFlags) -> Result<DesiredState, ResolveError> {
    let mut targets = SecretMap::new();
    for key in &spec.credential_keys {
        let value = policy
            .lookup(&spec.name, key)
            .ok_or_else(|| ResolveError::MissingCredential {
                service: spec.name.clone(),
                key: key.clone(),
            })?;
        if value.is_empty() {
            return Err(ResolveError::EmptyCredential {
                service: spec.name.clone(),
                key: key.clone(),
            });
        }
        targets.insert(key.clone(), value.clone());
    }

    Ok(DesiredState {
        target_secret_values: targets,
        target_chart_version: spec.chart_version.clone(),
        target_image_tag: spec.image_tag.clone(),
        cleanup_mode: flags.cleanup,
        force_install: flags.force_install,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        serde_json::from_value(serde_json::json!({
            "name": "rabbitmq",
            "namespace": "messaging",
            "chart_ref": "bitnami/rabbitmq",
            "chart_version": "14.0.2",
            "image_tag": "3.13.1",
            "workload_selector": "app.kubernetes.io/instance=rabbitmq",
            "secret_name": "rabbitmq",
            "credential_keys": ["rabbitmq-password", "rabbitmq-erlang-cookie"]
        }))
        .unwrap()
    }

    #[test]
    fn test_master_value_reused_for_every_key() {
        let desired = resolve(&spec(), &CredentialPolicy::with_master("m4ster"), RunFlags::default()).unwrap();
        assert_eq!(desired.target_secret_values.len(), 2);
        assert!(desired
            .target_secret_values
            .values()
            .all(|v| v.expose() == "m4ster"));
        assert_eq!(desired.target_chart_version, semver::Version::new(14, 0, 2));
        assert_eq!(desired.target_image_tag.as_deref(), Some("3.13.1"));
        assert!(!desired.cleanup_mode);
    }

    #[test]
    fn test_override_wins_over_master() {
        let policy = CredentialPolicy::with_master("m4ster").with_override("rabbitmq", "rabbitmq-erlang-cookie", "c00kie");
        let desired = resolve(&spec(), &policy, RunFlags { cleanup: true, force_install: true }).unwrap();
        assert_eq!(desired.target_secret_values["rabbitmq-erlang-cookie"].expose(), "c00kie");
        assert_eq!(desired.target_secret_values["rabbitmq-password"].expose(), "m4ster");
        assert!(desired.cleanup_mode);
        assert!(desired.force_install);
    }

    #[test]
    fn test_missing_credential_is_a_configuration_error() {
        let policy = CredentialPolicy::default().with_override("rabbitmq", "rabbitmq-password", "p");
        assert_eq!(
            resolve(&spec(), &policy, RunFlags::default()),
            Err(ResolveError::MissingCredential {
                service: "rabbitmq".into(),
                key: "rabbitmq-erlang-cookie".into()
            })
        );
    }

    #[test]
    fn test_empty_value_rejected() {
        let err = resolve(&spec(), &CredentialPolicy::with_master(""), RunFlags::default()).unwrap_err();
        assert!(matches!(err, ResolveError::EmptyCredential { .. }));
    }

    #[test]
    fn test_deterministic() {
        let policy = CredentialPolicy::with_master("m4ster");
        assert_eq!(
            resolve(&spec(), &policy, RunFlags::default()),
            resolve(&spec(), &policy, RunFlags::default())
        );
    }
}
