//! Contracts the engine drives the platform through

use crate::error::PlatformResult;
use async_trait::async_trait;
use converge_types::{ReleaseRef, ReleaseStatus, ResourceKind, ResourceRef, SecretMap, WorkloadKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Request to install or upgrade a release
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergeRequest {
    pub release: ReleaseRef,
    pub chart_ref: String,
    pub chart_version: semver::Version,
    /// Fully rendered chart values
    pub values: serde_json::Value,
    pub timeout: Duration,
}

/// Readiness of the workload running a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
}

/// Release lifecycle operations of the package manager
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Transaction status of a release; `Absent` when it does not exist
    async fn status(&self, release: &ReleaseRef) -> PlatformResult<ReleaseStatus>;

    /// Install or upgrade the release, blocking for at most `request.timeout`.
    ///
    /// Returns the package manager's output.
    async fn converge(&self, request: &ConvergeRequest) -> PlatformResult<String>;

    /// Remove the release. Returns `false` if it did not exist.
    async fn uninstall(&self, release: &ReleaseRef, timeout: Duration) -> PlatformResult<bool>;

    /// Kind of the objects recording release transactions
    fn transaction_marker_kind(&self) -> ResourceKind {
        ResourceKind::Secret
    }

    /// Label selector matching the transaction markers left in `status`
    fn transaction_marker_selector(&self, release: &ReleaseRef, status: ReleaseStatus) -> String;
}

/// Object-level operations against the orchestration API.
///
/// Every call is scoped to a namespace. Reads return `None` for absent
/// objects rather than an error.
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    /// Workloads of `kind` matching `selector`, ready replicas summed
    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        selector: &str,
    ) -> PlatformResult<Option<WorkloadStatus>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> PlatformResult<Option<SecretMap>>;

    /// Write `data` keys onto the secret, creating it if needed. Keys not in
    /// `data` are left untouched.
    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretMap) -> PlatformResult<()>;

    async fn get_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
    ) -> PlatformResult<Option<BTreeMap<String, String>>>;

    async fn patch_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        annotations: &BTreeMap<String, String>,
    ) -> PlatformResult<()>;

    async fn patch_labels(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<()>;

    /// Delete a resource. Returns `false` if it was already gone.
    async fn delete_resource(&self, namespace: &str, resource: &ResourceRef) -> PlatformResult<bool>;

    /// Names of resources of `kind` matching `selector`
    async fn list_resources(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> PlatformResult<Vec<String>>;

    /// Last `tail_lines` log lines of pods matching `selector`
    async fn workload_logs(&self, namespace: &str, selector: &str, tail_lines: u32) -> PlatformResult<String>;

    /// Human-readable status of pods matching `selector`
    async fn pod_summary(&self, namespace: &str, selector: &str) -> PlatformResult<String>;

    /// Most recent `limit` platform events in the namespace
    async fn recent_events(&self, namespace: &str, limit: u32) -> PlatformResult<String>;
}
