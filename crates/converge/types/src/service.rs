//! Service specification
//!
//! A `ServiceSpec` names everything the engine needs to converge one
//! stateful service: the release, its chart, the workload that runs it and
//! the secret holding its credentials. It is loaded once per run and never
//! mutated afterwards.

use crate::ids::ReleaseRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Annotation recording which release owns a resource
pub const RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";

/// Annotation recording the namespace of the owning release
pub const RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";

/// Label the package manager requires on adopted resources
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] for package-manager owned resources
pub const MANAGED_BY_VALUE: &str = "Helm";

/// Specification of one managed stateful service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name, also used as the release name
    pub name: String,

    /// Namespace the release lives in
    pub namespace: String,

    /// Chart reference (`repo/chart` or OCI reference)
    pub chart_ref: String,

    /// Chart version to converge to
    pub chart_version: semver::Version,

    /// Kind of workload running the service
    #[serde(default)]
    pub workload_kind: WorkloadKind,

    /// Label selector identifying the workload and its pods
    pub workload_selector: String,

    /// Secret holding the service credentials
    pub secret_name: String,

    /// Credential keys expected in the secret
    #[serde(default)]
    pub credential_keys: Vec<String>,

    /// Container resource requests
    #[serde(default, skip_serializing_if = "ResourceRequests::is_empty")]
    pub resource_requests: ResourceRequests,

    /// Size of the persistent volume (e.g. `8Gi`)
    #[serde(default)]
    pub persistence_size: Option<String>,

    /// Image tag override
    #[serde(default)]
    pub image_tag: Option<String>,

    /// Services that must converge before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Resources whose ownership metadata is checked before any upgrade
    #[serde(default)]
    pub ownership_checks: Vec<ResourceRef>,

    /// Credential key to dotted chart values path (e.g. `auth.password`)
    #[serde(default)]
    pub credential_value_paths: BTreeMap<String, String>,

    /// Extra chart values, merged last
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl ServiceSpec {
    /// Release this service is deployed as
    pub fn release(&self) -> ReleaseRef {
        ReleaseRef::new(self.name.clone(), self.namespace.clone())
    }

    /// Ownership annotations every checked resource must carry
    pub fn expected_ownership(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RELEASE_NAME_ANNOTATION.to_string(), self.name.clone()),
            (
                RELEASE_NAMESPACE_ANNOTATION.to_string(),
                self.namespace.clone(),
            ),
        ])
    }

    /// Whether a resource's annotations match the expected release identity
    pub fn ownership_matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.expected_ownership()
            .iter()
            .all(|(key, value)| annotations.get(key) == Some(value))
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.name.trim().is_empty() {
            return Err(SpecValidationError::EmptyField("name"));
        }
        if self.namespace.trim().is_empty() {
            return Err(SpecValidationError::EmptyField("namespace"));
        }
        if self.chart_ref.trim().is_empty() {
            return Err(SpecValidationError::EmptyField("chart_ref"));
        }
        if self.workload_selector.trim().is_empty() {
            return Err(SpecValidationError::EmptyField("workload_selector"));
        }
        if self.secret_name.trim().is_empty() && !self.credential_keys.is_empty() {
            return Err(SpecValidationError::EmptyField("secret_name"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for key in &self.credential_keys {
            if key.trim().is_empty() {
                return Err(SpecValidationError::InvalidCredentialKey(key.clone()));
            }
            if !seen.insert(key) {
                return Err(SpecValidationError::DuplicateCredentialKey(key.clone()));
            }
        }

        for key in self.credential_value_paths.keys() {
            if !self.credential_keys.contains(key) {
                return Err(SpecValidationError::UnknownCredentialPath(key.clone()));
            }
        }

        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(SpecValidationError::SelfDependency(self.name.clone()));
        }

        Ok(())
    }
}

/// Kind of workload object running a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    #[default]
    StatefulSet,
    Deployment,
}

impl WorkloadKind {
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            WorkloadKind::StatefulSet => ResourceKind::StatefulSet,
            WorkloadKind::Deployment => ResourceKind::Deployment,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource_kind())
    }
}

/// Platform resource kinds the engine reads or mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Secret,
    ConfigMap,
    Service,
    ServiceAccount,
    StatefulSet,
    Deployment,
    PersistentVolumeClaim,
    Role,
    RoleBinding,
    PodDisruptionBudget,
    NetworkPolicy,
}

impl ResourceKind {
    /// Name used on the platform command line
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Secret => "secret",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Service => "service",
            ResourceKind::ServiceAccount => "serviceaccount",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::Deployment => "deployment",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
            ResourceKind::Role => "role",
            ResourceKind::RoleBinding => "rolebinding",
            ResourceKind::PodDisruptionBudget => "poddisruptionbudget",
            ResourceKind::NetworkPolicy => "networkpolicy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named resource of a given kind, within the service namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Container resource requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    #[serde(default)]
    pub cpu: Option<String>,

    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceRequests {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Service specification validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecValidationError {
    #[error("Field `{0}` cannot be empty")]
    EmptyField(&'static str),

    #[error("Invalid credential key: {0:?}")]
    InvalidCredentialKey(String),

    #[error("Duplicate credential key: {0}")]
    DuplicateCredentialKey(String),

    #[error("Values path configured for unknown credential key: {0}")]
    UnknownCredentialPath(String),

    #[error("Service {0} depends on itself")]
    SelfDependency(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn postgres_spec() -> ServiceSpec {
        ServiceSpec {
            name: "postgresql".into(),
            namespace: "data".into(),
            chart_ref: "bitnami/postgresql".into(),
            chart_version: semver::Version::new(15, 5, 0),
            workload_kind: WorkloadKind::StatefulSet,
            workload_selector: "app.kubernetes.io/instance=postgresql".into(),
            secret_name: "postgresql".into(),
            credential_keys: vec!["postgres-password".into(), "password".into()],
            resource_requests: ResourceRequests::default(),
            persistence_size: Some("8Gi".into()),
            image_tag: None,
            depends_on: vec![],
            ownership_checks: vec![ResourceRef::new(ResourceKind::Secret, "postgresql")],
            credential_value_paths: BTreeMap::new(),
            values: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_ownership_matches() {
        let spec = postgres_spec();
        let mut annotations = spec.expected_ownership();
        annotations.insert("unrelated".into(), "x".into());
        assert!(spec.ownership_matches(&annotations));

        annotations.insert(RELEASE_NAME_ANNOTATION.into(), "other".into());
        assert!(!spec.ownership_matches(&annotations));

        assert!(!spec.ownership_matches(&BTreeMap::new()));
    }

    #[test]
    fn test_validate_rejects_duplicate_keys() {
        let mut spec = postgres_spec();
        spec.credential_keys.push("password".into());
        assert_eq!(
            spec.validate(),
            Err(SpecValidationError::DuplicateCredentialKey("password".into()))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_value_path() {
        let mut spec = postgres_spec();
        spec.credential_value_paths
            .insert("erlang-cookie".into(), "auth.erlangCookie".into());
        assert!(matches!(
            spec.validate(),
            Err(SpecValidationError::UnknownCredentialPath(_))
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
name: rabbitmq
namespace: messaging
chart_ref: bitnami/rabbitmq
chart_version: 14.6.6
workload_selector: app.kubernetes.io/instance=rabbitmq
secret_name: rabbitmq
credential_keys: [rabbitmq-password]
ownership_checks:
  - kind: persistentvolumeclaim
    name: data-rabbitmq-0
"#;
        let spec: ServiceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.workload_kind, WorkloadKind::StatefulSet);
        assert_eq!(spec.chart_version, semver::Version::new(14, 6, 6));
        assert_eq!(
            spec.ownership_checks[0].kind,
            ResourceKind::PersistentVolumeClaim
        );
        assert!(spec.depends_on.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_resource_requests_are_not_serialized() {
        let mut spec = postgres_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("resource_requests").is_none());

        spec.resource_requests.memory = Some("256Mi".into());
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["resource_requests"]["memory"], "256Mi");
    }
}
