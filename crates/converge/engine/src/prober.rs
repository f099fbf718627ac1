//! State prober
//!
//! Reads the live state of one service. Every query runs, and each one
//! either yields its value or its explicit absent value, so the classifier
//! never sees a partially populated state. Only a platform failure that
//! survives the retry budget turns into a [`ProbeError`].

use crate::error::ProbeError;
use crate::retry::{RetryFailure, RetryPolicy};
use converge_platform::{OrchestrationApi, PackageManager};
use converge_types::{ObservedState, ResourceRef, SecretMap, ServiceSpec};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Reads observed state for a service
pub struct Prober {
    packages: Arc<dyn PackageManager>,
    api: Arc<dyn OrchestrationApi>,
    retry: RetryPolicy,
}

impl Prober {
    pub fn new(packages: Arc<dyn PackageManager>, api: Arc<dyn OrchestrationApi>, retry: RetryPolicy) -> Self {
        Self { packages, api, retry }
    }

    /// Capture a fresh [`ObservedState`] for `spec`
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn probe(&self, spec: &ServiceSpec) -> Result<ObservedState, ProbeError> {
        let release = spec.release();
        let failed = |query: &'static str| {
            move |failure: RetryFailure| ProbeError {
                service: spec.name.clone(),
                query,
                source: failure.error,
                retries: failure.retries,
            }
        };

        // All queries are issued before any failure is reported.
        let status = self
            .retry
            .run("release status", || self.packages.status(&release))
            .await
            .map_err(failed("release status"));

        let workload = self
            .retry
            .run("workload", || {
                self.api
                    .get_workload(&spec.namespace, spec.workload_kind, &spec.workload_selector)
            })
            .await
            .map_err(failed("workload"));

        let secret = if spec.credential_keys.is_empty() {
            Ok(None)
        } else {
            self.retry
                .run("secret", || self.api.get_secret(&spec.namespace, &spec.secret_name))
                .await
                .map(|r| r.value)
                .map_err(failed("secret"))
        };

        let violations = self.ownership_violations(spec).await;

        let status = status?.value;
        let ready = workload?.value.map(|w| w.ready_replicas).unwrap_or(0);
        let secret = secret?.unwrap_or_default();
        let violations = violations?;

        let current: SecretMap = spec
            .credential_keys
            .iter()
            .map(|key| (key.clone(), secret.get(key).cloned().unwrap_or_default()))
            .collect();

        let observed = ObservedState::new(status, ready, current, violations);
        debug!(
            release_status = %observed.release_status,
            ready_replicas = observed.workload_ready_replicas,
            ownership_valid = observed.ownership_annotations_valid,
            "Probed state"
        );
        Ok(observed)
    }

    /// Checked resources whose ownership annotations do not name this release.
    ///
    /// A resource that does not exist yet is not a violation: the release
    /// will create it.
    async fn ownership_violations(&self, spec: &ServiceSpec) -> Result<Vec<ResourceRef>, ProbeError> {
        let mut violations = Vec::new();
        let mut first_error = None;

        for resource in &spec.ownership_checks {
            let annotations = self
                .retry
                .run("ownership", || self.api.get_annotations(&spec.namespace, resource))
                .await;
            match annotations {
                Ok(r) => match r.value {
                    Some(annotations) if !spec.ownership_matches(&annotations) => {
                        debug!(resource = %resource, "Ownership mismatch");
                        violations.push(resource.clone());
                    }
                    _ => {}
                },
                Err(failure) => {
                    first_error.get_or_insert(ProbeError {
                        service: spec.name.clone(),
                        query: "ownership",
                        source: failure.error,
                        retries: failure.retries,
                    });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(violations),
        }
    }
}
