//! Action executor
//!
//! Performs the single planned action against the platform. Transient
//! failures of individual calls are retried under the shared policy; a
//! rejected call or an exhausted retry budget becomes
//! [`ConvergeError::FatalConverge`] carrying the decision and the observed
//! state that led to it.

use crate::error::{ConvergeError, Result};
use crate::retry::{Retried, RetryFailure, RetryPolicy};
use crate::values::render_values;
use chrono::{DateTime, Utc};
use converge_platform::{ConvergeRequest, OrchestrationApi, PackageManager, PlatformError};
use converge_types::{
    ActionKind, Decision, DesiredState, ObservedState, ResourceKind, ResourceRef, ServiceSpec,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What executing an action produced, before verification
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub retries_used: u32,
    /// Package-manager output tail, for converging actions
    pub log_excerpt: Option<String>,
    /// The change only takes effect when the workload restarts
    pub staged: bool,
    pub started_at: DateTime<Utc>,
}

impl ActionOutcome {
    fn new(action: ActionKind) -> Self {
        Self {
            action,
            retries_used: 0,
            log_excerpt: None,
            staged: false,
            started_at: Utc::now(),
        }
    }
}

/// Executes planned actions
pub struct Executor {
    packages: Arc<dyn PackageManager>,
    api: Arc<dyn OrchestrationApi>,
    retry: RetryPolicy,
    converge_timeout: Duration,
}

/// Per-action context threaded through the helpers
struct Context<'a> {
    spec: &'a ServiceSpec,
    decision: &'a Decision,
    observed: &'a ObservedState,
    outcome: ActionOutcome,
}

impl Context<'_> {
    fn fatal(&self, failure: RetryFailure) -> ConvergeError {
        let message = if failure.exhausted() {
            format!("gave up after {} retries: {}", failure.retries, failure.error)
        } else {
            failure.error.to_string()
        };
        ConvergeError::FatalConverge {
            service: self.spec.name.clone(),
            decision: Box::new(self.decision.clone()),
            observed: Box::new(self.observed.clone()),
            message,
            log_tail: failure.error.log_tail().map(str::to_string),
            retries: self.outcome.retries_used + failure.retries,
        }
    }
}

impl Executor {
    pub fn new(
        packages: Arc<dyn PackageManager>,
        api: Arc<dyn OrchestrationApi>,
        retry: RetryPolicy,
        converge_timeout: Duration,
    ) -> Self {
        Self {
            packages,
            api,
            retry,
            converge_timeout,
        }
    }

    /// Perform `decision.action` for `spec`
    #[instrument(skip_all, fields(service = %spec.name, action = %decision.action))]
    pub async fn execute(
        &self,
        spec: &ServiceSpec,
        decision: &Decision,
        observed: &ObservedState,
        desired: &DesiredState,
    ) -> Result<ActionOutcome> {
        let mut cx = Context {
            spec,
            decision,
            observed,
            outcome: ActionOutcome::new(decision.action),
        };

        if decision.action.is_destructive() && !desired.cleanup_mode {
            return Err(ConvergeError::FatalConverge {
                service: spec.name.clone(),
                decision: Box::new(decision.clone()),
                observed: Box::new(observed.clone()),
                message: "refusing to delete storage outside cleanup mode".into(),
                log_tail: None,
                retries: 0,
            });
        }

        match decision.action {
            ActionKind::Skip => {
                debug!("Nothing to execute");
            }
            ActionKind::UnlockStuckOperation => self.unlock(&mut cx).await?,
            ActionKind::RepairOwnership => self.repair_ownership(&mut cx).await?,
            ActionKind::SyncSecretOnly => self.sync_secret(&mut cx, desired).await?,
            ActionKind::Upgrade | ActionKind::FreshInstall => self.converge(&mut cx, desired).await?,
            ActionKind::DestroyAndReinstall => {
                self.destroy(&mut cx).await?;
                self.converge(&mut cx, desired).await?;
            }
        }

        Ok(cx.outcome)
    }

    /// Run one platform call under the retry policy, accounting retries
    async fn call<T, F, Fut>(&self, cx: &mut Context<'_>, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, PlatformError>>,
    {
        match self.retry.run(operation, call).await {
            Ok(Retried { value, retries }) => {
                cx.outcome.retries_used += retries;
                Ok(value)
            }
            Err(failure) => Err(cx.fatal(failure)),
        }
    }

    async fn unlock(&self, cx: &mut Context<'_>) -> Result<()> {
        let release = cx.spec.release();
        let status = cx.observed.release_status;
        let kind = self.packages.transaction_marker_kind();
        let selector = self.packages.transaction_marker_selector(&release, status);

        let markers = self
            .call(cx, "list transaction markers", || {
                self.api.list_resources(&release.namespace, kind, &selector)
            })
            .await?;
        if markers.is_empty() {
            warn!(status = %status, "No transaction markers found for pending release");
        }

        let mut removed = 0;
        for name in markers {
            let marker = ResourceRef::new(kind, name);
            let deleted = self
                .call(cx, "delete transaction marker", || {
                    self.api.delete_resource(&release.namespace, &marker)
                })
                .await?;
            if deleted {
                removed += 1;
            } else {
                debug!(marker = %marker, "Marker already gone");
            }
        }

        info!(status = %status, removed, "Cleared pending transaction");
        Ok(())
    }

    async fn repair_ownership(&self, cx: &mut Context<'_>) -> Result<()> {
        let namespace = cx.spec.namespace.clone();
        let annotations = cx.spec.expected_ownership();
        let labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]);

        for resource in cx.observed.ownership_violations.clone() {
            match self.patch_ownership(cx, &namespace, &resource, &annotations, &labels).await {
                Ok(()) => info!(resource = %resource, "Ownership metadata patched"),
                Err(failure) if failure.error.is_not_found() => {
                    debug!(resource = %resource, "Resource disappeared before repair");
                }
                Err(failure) if matches!(failure.error, PlatformError::Rejected { .. }) => {
                    warn!(resource = %resource, error = %failure.error, "Patch rejected, deleting resource for the release to recreate");
                    self.call(cx, "delete unowned resource", || {
                        self.api.delete_resource(&namespace, &resource)
                    })
                    .await?;
                }
                Err(failure) => return Err(cx.fatal(failure)),
            }
        }
        Ok(())
    }

    async fn patch_ownership(
        &self,
        cx: &mut Context<'_>,
        namespace: &str,
        resource: &ResourceRef,
        annotations: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> std::result::Result<(), RetryFailure> {
        let patched = self
            .retry
            .run("patch ownership annotations", || {
                self.api.patch_annotations(namespace, resource, annotations)
            })
            .await?;
        cx.outcome.retries_used += patched.retries;

        let labelled = self
            .retry
            .run("patch managed-by label", || {
                self.api.patch_labels(namespace, resource, labels)
            })
            .await?;
        cx.outcome.retries_used += labelled.retries;
        Ok(())
    }

    async fn sync_secret(&self, cx: &mut Context<'_>, desired: &DesiredState) -> Result<()> {
        let spec = cx.spec;
        self.call(cx, "write credentials", || {
            self.api
                .put_secret(&spec.namespace, &spec.secret_name, &desired.target_secret_values)
        })
        .await?;
        cx.outcome.staged = true;
        info!(keys = desired.target_secret_values.len(), "Credentials written; effective on next restart");
        Ok(())
    }

    async fn converge(&self, cx: &mut Context<'_>, desired: &DesiredState) -> Result<()> {
        let request = ConvergeRequest {
            release: cx.spec.release(),
            chart_ref: cx.spec.chart_ref.clone(),
            chart_version: desired.target_chart_version.clone(),
            values: render_values(cx.spec, desired),
            timeout: self.converge_timeout,
        };

        let log = self
            .call(cx, "converge release", || self.packages.converge(&request))
            .await?;
        cx.outcome.log_excerpt = Some(log).filter(|l| !l.is_empty());
        info!(version = %request.chart_version, "Release converged");
        Ok(())
    }

    /// Remove the release, its workload objects and its volume claims
    async fn destroy(&self, cx: &mut Context<'_>) -> Result<()> {
        let spec = cx.spec;
        let release = spec.release();

        let uninstalled = self
            .call(cx, "uninstall release", || {
                self.packages.uninstall(&release, self.converge_timeout)
            })
            .await?;
        debug!(uninstalled, "Release uninstall");

        for kind in [spec.workload_kind.resource_kind(), ResourceKind::PersistentVolumeClaim] {
            let names = self
                .call(cx, "list leftovers", || {
                    self.api.list_resources(&spec.namespace, kind, &spec.workload_selector)
                })
                .await?;
            for name in names {
                let resource = ResourceRef::new(kind, name);
                warn!(resource = %resource, "Deleting leftover resource");
                self.call(cx, "delete leftover", || {
                    self.api.delete_resource(&spec.namespace, &resource)
                })
                .await?;
            }
        }
        Ok(())
    }
}
