//! Post-action verifier

use crate::config::DiagnosticsConfig;
use crate::error::ProbeError;
use crate::prober::Prober;
use converge_platform::OrchestrationApi;
use converge_types::{ActionKind, ObservedState, ServiceSpec};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Evidence gathered when a workload fails to become ready.
///
/// Each part is the platform's output as returned, or a note that it could
/// not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub log_tail: String,
    pub pod_status: String,
    pub recent_events: String,
}

/// Verdict on an executed action
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Passed { observed: ObservedState },
    NotReady {
        observed: ObservedState,
        diagnostics: Diagnostics,
    },
}

impl Verification {
    pub fn passed(&self) -> bool {
        matches!(self, Verification::Passed { .. })
    }

    pub fn observed(&self) -> &ObservedState {
        match self {
            Verification::Passed { observed } | Verification::NotReady { observed, .. } => observed,
        }
    }

    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Verification::NotReady { diagnostics, .. } => Some(diagnostics),
            Verification::Passed { .. } => None,
        }
    }
}

/// Re-probes after an action and judges it
pub struct Verifier {
    api: Arc<dyn OrchestrationApi>,
    settle_delay: Duration,
    diagnostics: DiagnosticsConfig,
}

impl Verifier {
    pub fn new(api: Arc<dyn OrchestrationApi>, settle_delay: Duration, diagnostics: DiagnosticsConfig) -> Self {
        Self {
            api,
            settle_delay,
            diagnostics,
        }
    }

    /// Judge `action` on `spec`.
    ///
    /// Skip and SyncSecretOnly pass on the first probe. Converging actions
    /// pass once a replica is ready; a workload that is not ready gets one
    /// settle delay and one re-check before diagnostics are collected.
    #[instrument(skip_all, fields(service = %spec.name, action = %action))]
    pub async fn verify(&self, prober: &Prober, spec: &ServiceSpec, action: ActionKind) -> Result<Verification, ProbeError> {
        let observed = prober.probe(spec).await?;
        if !action.expects_readiness() || observed.is_ready() {
            return Ok(Verification::Passed { observed });
        }

        info!(settle_secs = self.settle_delay.as_secs(), "Workload not ready, waiting to re-check");
        tokio::time::sleep(self.settle_delay).await;

        let observed = prober.probe(spec).await?;
        if observed.is_ready() {
            return Ok(Verification::Passed { observed });
        }

        warn!(
            ready_replicas = observed.workload_ready_replicas,
            "Workload still not ready, collecting diagnostics"
        );
        let diagnostics = self.collect(spec).await;
        Ok(Verification::NotReady { observed, diagnostics })
    }

    async fn collect(&self, spec: &ServiceSpec) -> Diagnostics {
        let unavailable = |what: &str, err: converge_platform::PlatformError| format!("<{} unavailable: {}>", what, err);

        let log_tail = self
            .api
            .workload_logs(&spec.namespace, &spec.workload_selector, self.diagnostics.log_tail_lines)
            .await
            .unwrap_or_else(|e| unavailable("logs", e));
        let pod_status = self
            .api
            .pod_summary(&spec.namespace, &spec.workload_selector)
            .await
            .unwrap_or_else(|e| unavailable("pod status", e));
        let recent_events = self
            .api
            .recent_events(&spec.namespace, self.diagnostics.event_limit)
            .await
            .unwrap_or_else(|e| unavailable("events", e));

        Diagnostics {
            log_tail,
            pod_status,
            recent_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use converge_platform::{InMemoryPlatform, Operation, PlatformError};
    use converge_types::{ReleaseRef, ReleaseStatus, WorkloadKind};

    const SELECTOR: &str = "app.kubernetes.io/instance=kafka";

    fn spec() -> ServiceSpec {
        serde_json::from_value(serde_json::json!({
            "name": "kafka",
            "namespace": "streaming",
            "chart_ref": "bitnami/kafka",
            "chart_version": "28.0.0",
            "workload_selector": SELECTOR,
            "secret_name": "kafka"
        }))
        .unwrap()
    }

    fn setup(ready: u32) -> (Arc<InMemoryPlatform>, Prober, Verifier) {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_release(&ReleaseRef::new("kafka", "streaming"), ReleaseStatus::Deployed);
        platform.add_workload("streaming", WorkloadKind::StatefulSet, "kafka-controller", SELECTOR, ready);
        let prober = Prober::new(platform.clone(), platform.clone(), RetryPolicy::immediate(1));
        let verifier = Verifier::new(platform.clone(), Duration::from_secs(30), DiagnosticsConfig::default());
        (platform, prober, verifier)
    }

    #[tokio::test]
    async fn test_ready_workload_passes_immediately() {
        let (platform, prober, verifier) = setup(1);
        let verdict = verifier.verify(&prober, &spec(), ActionKind::Upgrade).await.unwrap();
        assert!(verdict.passed());
        assert_eq!(platform.count(Operation::GetWorkload), 1);
    }

    #[tokio::test]
    async fn test_sync_secret_passes_without_readiness() {
        let (_, prober, verifier) = setup(0);
        let verdict = verifier.verify(&prober, &spec(), ActionKind::SyncSecretOnly).await.unwrap();
        assert!(verdict.passed());
        assert_eq!(verdict.observed().workload_ready_replicas, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_ready_within_settle_delay_passes() {
        let (platform, prober, verifier) = setup(0);

        let rollout = platform.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            rollout.add_workload("streaming", WorkloadKind::StatefulSet, "kafka-controller", SELECTOR, 1);
        });

        let verdict = verifier.verify(&prober, &spec(), ActionKind::Upgrade).await.unwrap();
        assert!(verdict.passed());
        assert_eq!(verdict.observed().workload_ready_replicas, 1);
        assert!(verdict.diagnostics().is_none());
        assert_eq!(platform.count(Operation::GetWorkload), 2);
        assert_eq!(platform.count(Operation::Diagnostics), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_collects_diagnostics_after_one_recheck() {
        let (platform, prober, verifier) = setup(0);
        platform.set_workload_logs("FATAL: broker id mismatch");
        platform.fail_next(Operation::Diagnostics, PlatformError::Transient("skip".into()));

        let verdict = verifier.verify(&prober, &spec(), ActionKind::FreshInstall).await.unwrap();
        assert!(!verdict.passed());
        assert_eq!(platform.count(Operation::GetWorkload), 2);

        let diagnostics = verdict.diagnostics().unwrap();
        assert!(diagnostics.log_tail.contains("logs unavailable"));
        assert!(diagnostics.pod_status.contains("kafka-controller-0   0/1"));
    }
}
