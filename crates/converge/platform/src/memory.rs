//! In-memory platform for development and testing.
//!
//! Implements both [`PackageManager`] and [`OrchestrationApi`] over a single
//! shared object store, so that one adapter's writes are visible through the
//! other the way they would be on a real cluster. Every call is recorded and
//! failures can be scripted per operation.

use crate::error::{PlatformError, PlatformResult};
use crate::traits::{ConvergeRequest, OrchestrationApi, PackageManager, WorkloadStatus};
use async_trait::async_trait;
use converge_types::{
    ReleaseRef, ReleaseStatus, ResourceKind, ResourceRef, SecretMap, SecretValue, WorkloadKind,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_NAMESPACE_ANNOTATION, RELEASE_NAME_ANNOTATION,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Platform operations, for scripting failures and counting calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Status,
    Converge,
    Uninstall,
    GetWorkload,
    GetSecret,
    PutSecret,
    GetAnnotations,
    PatchAnnotations,
    PatchLabels,
    DeleteResource,
    ListResources,
    Diagnostics,
}

impl Operation {
    /// Whether the operation changes platform state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Converge
                | Operation::Uninstall
                | Operation::PutSecret
                | Operation::PatchAnnotations
                | Operation::PatchLabels
                | Operation::DeleteResource
        )
    }
}

/// A recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCall {
    pub operation: Operation,
    /// Release or resource the call addressed
    pub target: String,
}

#[derive(Debug, Clone)]
struct Release {
    status: ReleaseStatus,
    /// Status restored once every pending marker is removed
    previous: ReleaseStatus,
    chart_version: Option<semver::Version>,
    revision: u32,
    values: Value,
}

#[derive(Debug, Clone, Default)]
struct Object {
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    data: SecretMap,
    /// Desired and ready replicas, for workload objects
    replicas: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
struct Binding {
    workload: Option<(WorkloadKind, String)>,
    secret: Option<(String, BTreeMap<String, String>)>,
}

#[derive(Debug)]
struct State {
    releases: HashMap<ReleaseRef, Release>,
    objects: BTreeMap<(String, ResourceRef), Object>,
    bindings: HashMap<ReleaseRef, Binding>,
    failures: HashMap<Operation, VecDeque<PlatformError>>,
    reject_annotation_patches: bool,
    converge_ready_replicas: u32,
    workload_logs: String,
    calls: Vec<PlatformCall>,
}

/// In-memory package manager and orchestration API
#[derive(Debug)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn labels_match(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    parse_selector(selector)
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

fn ownership_of(release: &ReleaseRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RELEASE_NAME_ANNOTATION.to_string(), release.name.clone()),
        (RELEASE_NAMESPACE_ANNOTATION.to_string(), release.namespace.clone()),
    ])
}

fn owned_by(object: &Object, release: &ReleaseRef) -> bool {
    object.annotations.get(RELEASE_NAME_ANNOTATION) == Some(&release.name)
        && object.annotations.get(RELEASE_NAMESPACE_ANNOTATION) == Some(&release.namespace)
}

fn lookup_path<'a>(values: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(values, |node, segment| node.get(segment))
}

impl State {
    fn record(&mut self, operation: Operation, target: impl Into<String>) -> PlatformResult<()> {
        self.calls.push(PlatformCall {
            operation,
            target: target.into(),
        });
        match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn marker_name(release: &ReleaseRef, revision: u32) -> String {
        format!("sh.helm.release.v1.{}.v{}", release.name, revision)
    }

    /// Restore a stuck release once its last pending marker is gone
    fn settle_release(&mut self, release: &ReleaseRef) {
        let remaining = self.objects.iter().any(|((ns, r), obj)| {
            ns == &release.namespace
                && r.kind == ResourceKind::Secret
                && obj.labels.get("owner").map(String::as_str) == Some("helm")
                && obj.labels.get("name") == Some(&release.name)
                && obj
                    .labels
                    .get("status")
                    .is_some_and(|s| s.starts_with("pending-"))
        });
        if remaining {
            return;
        }
        if let Some(record) = self.releases.get(release) {
            if record.status.is_pending() {
                if record.previous.exists() {
                    let previous = record.previous;
                    if let Some(record) = self.releases.get_mut(release) {
                        record.status = previous;
                    }
                } else {
                    self.releases.remove(release);
                }
            }
        }
    }

    fn adopt_or_reject(&self, namespace: &str, resource: &ResourceRef, release: &ReleaseRef) -> PlatformResult<()> {
        match self.objects.get(&(namespace.to_string(), resource.clone())) {
            Some(object) if !owned_by(object, release) => Err(PlatformError::Rejected {
                message: format!(
                    "rendered manifests contain a resource that already exists: {} exists and cannot be imported into the current release: invalid ownership metadata",
                    resource
                ),
                log_tail: None,
            }),
            _ => Ok(()),
        }
    }

    fn upsert_owned(&mut self, namespace: &str, resource: ResourceRef, release: &ReleaseRef) -> &mut Object {
        let object = self.objects.entry((namespace.to_string(), resource)).or_default();
        object.annotations.extend(ownership_of(release));
        object
            .labels
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        object
    }
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                releases: HashMap::new(),
                objects: BTreeMap::new(),
                bindings: HashMap::new(),
                failures: HashMap::new(),
                reject_annotation_patches: false,
                converge_ready_replicas: 1,
                workload_logs: String::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---- Setup ----

    /// Register a release in `status` without any transaction marker
    pub fn add_release(&self, release: &ReleaseRef, status: ReleaseStatus) {
        if !status.exists() {
            self.state().releases.remove(release);
            return;
        }
        self.state().releases.insert(
            release.clone(),
            Release {
                status,
                previous: status,
                chart_version: None,
                revision: 1,
                values: Value::Null,
            },
        );
    }

    /// Register a release left in a pending status with its marker object
    pub fn add_stuck_release(&self, release: &ReleaseRef, status: ReleaseStatus) {
        let previous = if status == ReleaseStatus::PendingInstall {
            ReleaseStatus::Absent
        } else {
            ReleaseStatus::Deployed
        };
        let revision = if previous.exists() { 2 } else { 1 };

        let mut state = self.state();
        state.releases.insert(
            release.clone(),
            Release {
                status,
                previous,
                chart_version: None,
                revision,
                values: Value::Null,
            },
        );
        let marker = ResourceRef::new(ResourceKind::Secret, State::marker_name(release, revision));
        state.objects.insert(
            (release.namespace.clone(), marker),
            Object {
                labels: BTreeMap::from([
                    ("owner".to_string(), "helm".to_string()),
                    ("name".to_string(), release.name.clone()),
                    ("status".to_string(), status.as_str().to_string()),
                ]),
                ..Object::default()
            },
        );
    }

    /// Add a workload object labelled with `selector`
    pub fn add_workload(&self, namespace: &str, kind: WorkloadKind, name: &str, selector: &str, ready: u32) {
        self.state().objects.insert(
            (namespace.to_string(), ResourceRef::new(kind.resource_kind(), name)),
            Object {
                labels: parse_selector(selector),
                replicas: Some((ready.max(1), ready)),
                ..Object::default()
            },
        );
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: SecretMap) {
        let mut state = self.state();
        let object = state
            .objects
            .entry((namespace.to_string(), ResourceRef::new(ResourceKind::Secret, name)))
            .or_default();
        object.data = data;
    }

    /// Add an arbitrary resource with the given annotations and labels
    pub fn add_resource(
        &self,
        namespace: &str,
        resource: ResourceRef,
        annotations: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    ) {
        let mut state = self.state();
        let object = state.objects.entry((namespace.to_string(), resource)).or_default();
        object.annotations = annotations;
        object.labels = labels;
    }

    /// Mark an existing resource as owned by `release`
    pub fn set_owner(&self, namespace: &str, resource: &ResourceRef, release: &ReleaseRef) {
        self.state().upsert_owned(namespace, resource.clone(), release);
    }

    /// Workload the chart of `release` creates on converge
    pub fn bind_workload(&self, release: &ReleaseRef, kind: WorkloadKind, selector: &str) {
        self.state()
            .bindings
            .entry(release.clone())
            .or_insert(Binding {
                workload: None,
                secret: None,
            })
            .workload = Some((kind, selector.to_string()));
    }

    /// Secret the chart of `release` renders on converge, keyed by the values
    /// path each credential is read from
    pub fn bind_secret(&self, release: &ReleaseRef, name: &str, value_paths: BTreeMap<String, String>) {
        self.state()
            .bindings
            .entry(release.clone())
            .or_insert(Binding {
                workload: None,
                secret: None,
            })
            .secret = Some((name.to_string(), value_paths));
    }

    /// Ready replicas of bound workloads after a converge
    pub fn set_converge_ready_replicas(&self, ready: u32) {
        self.state().converge_ready_replicas = ready;
    }

    pub fn set_workload_logs(&self, logs: impl Into<String>) {
        self.state().workload_logs = logs.into();
    }

    /// Reject every annotation patch, as for immutable or protected objects
    pub fn reject_annotation_patches(&self) {
        self.state().reject_annotation_patches = true;
    }

    /// Fail the next call of `operation` with `error`
    pub fn fail_next(&self, operation: Operation, error: PlatformError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    // ---- Inspection ----

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn mutation_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation.is_mutation())
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn release_status(&self, release: &ReleaseRef) -> ReleaseStatus {
        self.state()
            .releases
            .get(release)
            .map(|r| r.status)
            .unwrap_or(ReleaseStatus::Absent)
    }

    pub fn release_revision(&self, release: &ReleaseRef) -> Option<u32> {
        self.state().releases.get(release).map(|r| r.revision)
    }

    /// Values the release was last converged with
    pub fn release_values(&self, release: &ReleaseRef) -> Option<Value> {
        self.state().releases.get(release).map(|r| r.values.clone())
    }

    pub fn release_chart_version(&self, release: &ReleaseRef) -> Option<semver::Version> {
        self.state()
            .releases
            .get(release)
            .and_then(|r| r.chart_version.clone())
    }

    pub fn secret_data(&self, namespace: &str, name: &str) -> Option<SecretMap> {
        self.state()
            .objects
            .get(&(namespace.to_string(), ResourceRef::new(ResourceKind::Secret, name)))
            .map(|o| o.data.clone())
    }

    pub fn resource_exists(&self, namespace: &str, resource: &ResourceRef) -> bool {
        self.state()
            .objects
            .contains_key(&(namespace.to_string(), resource.clone()))
    }

    pub fn labels_of(&self, namespace: &str, resource: &ResourceRef) -> Option<BTreeMap<String, String>> {
        self.state()
            .objects
            .get(&(namespace.to_string(), resource.clone()))
            .map(|o| o.labels.clone())
    }
}

#[async_trait]
impl PackageManager for InMemoryPlatform {
    async fn status(&self, release: &ReleaseRef) -> PlatformResult<ReleaseStatus> {
        let mut state = self.state();
        state.record(Operation::Status, release.to_string())?;
        Ok(state
            .releases
            .get(release)
            .map(|r| r.status)
            .unwrap_or(ReleaseStatus::Absent))
    }

    async fn converge(&self, request: &ConvergeRequest) -> PlatformResult<String> {
        let release = &request.release;
        let namespace = release.namespace.as_str();
        let mut state = self.state();
        state.record(Operation::Converge, release.to_string())?;

        if state.releases.get(release).is_some_and(|r| r.status.is_pending()) {
            return Err(PlatformError::rejected(
                "another operation (install/upgrade/rollback) is in progress",
            ));
        }

        let binding = state.bindings.get(release).cloned();
        let workload_ref = binding.as_ref().and_then(|b| {
            b.workload
                .as_ref()
                .map(|(kind, _)| ResourceRef::new(kind.resource_kind(), release.name.clone()))
        });
        let secret_ref = binding.as_ref().and_then(|b| {
            b.secret
                .as_ref()
                .map(|(name, _)| ResourceRef::new(ResourceKind::Secret, name.clone()))
        });
        for resource in workload_ref.iter().chain(secret_ref.iter()) {
            state.adopt_or_reject(namespace, resource, release)?;
        }

        let revision = state.releases.get(release).map(|r| r.revision + 1).unwrap_or(1);
        state.releases.insert(
            release.clone(),
            Release {
                status: ReleaseStatus::Deployed,
                previous: ReleaseStatus::Deployed,
                chart_version: Some(request.chart_version.clone()),
                revision,
                values: request.values.clone(),
            },
        );

        let ready = state.converge_ready_replicas;
        if let (Some(resource), Some((_, selector))) = (
            workload_ref,
            binding.as_ref().and_then(|b| b.workload.clone()),
        ) {
            let object = state.upsert_owned(namespace, resource, release);
            object.labels.extend(parse_selector(&selector));
            object.replicas = Some((1, ready));
        }
        if let (Some(resource), Some((_, paths))) =
            (secret_ref, binding.as_ref().and_then(|b| b.secret.clone()))
        {
            let object = state.upsert_owned(namespace, resource, release);
            for (key, path) in paths {
                if let Some(Value::String(value)) = lookup_path(&request.values, &path) {
                    object.data.insert(key, SecretValue::new(value.clone()));
                }
            }
        }

        debug!(release = %release, revision, "Release converged");
        Ok(format!(
            "Release \"{}\" has been upgraded. Happy Helming!\nREVISION: {}\nSTATUS: deployed",
            release.name, revision
        ))
    }

    async fn uninstall(&self, release: &ReleaseRef, _timeout: Duration) -> PlatformResult<bool> {
        let mut state = self.state();
        state.record(Operation::Uninstall, release.to_string())?;

        let existed = state.releases.remove(release).is_some();
        state.objects.retain(|(ns, _), object| {
            let marker = object.labels.get("owner").map(String::as_str) == Some("helm")
                && object.labels.get("name") == Some(&release.name);
            !(ns == &release.namespace && (owned_by(object, release) || marker))
        });
        Ok(existed)
    }

    fn transaction_marker_selector(&self, release: &ReleaseRef, status: ReleaseStatus) -> String {
        format!("owner=helm,name={},status={}", release.name, status.as_str())
    }
}

#[async_trait]
impl OrchestrationApi for InMemoryPlatform {
    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        selector: &str,
    ) -> PlatformResult<Option<WorkloadStatus>> {
        let mut state = self.state();
        state.record(Operation::GetWorkload, format!("{}/{}", namespace, selector))?;

        let matching: Vec<(&ResourceRef, (u32, u32))> = state
            .objects
            .iter()
            .filter(|((ns, r), o)| {
                ns == namespace && r.kind == kind.resource_kind() && labels_match(&o.labels, selector)
            })
            .filter_map(|((_, r), o)| o.replicas.map(|rep| (r, rep)))
            .collect();
        let Some((first, _)) = matching.first() else {
            return Ok(None);
        };
        Ok(Some(WorkloadStatus {
            name: first.name.clone(),
            desired_replicas: matching.iter().map(|(_, (d, _))| d).sum(),
            ready_replicas: matching.iter().map(|(_, (_, r))| r).sum(),
        }))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> PlatformResult<Option<SecretMap>> {
        let mut state = self.state();
        state.record(Operation::GetSecret, format!("{}/secret/{}", namespace, name))?;
        Ok(state
            .objects
            .get(&(namespace.to_string(), ResourceRef::new(ResourceKind::Secret, name)))
            .map(|o| o.data.clone()))
    }

    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretMap) -> PlatformResult<()> {
        let mut state = self.state();
        state.record(Operation::PutSecret, format!("{}/secret/{}", namespace, name))?;
        let object = state
            .objects
            .entry((namespace.to_string(), ResourceRef::new(ResourceKind::Secret, name)))
            .or_default();
        object
            .data
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
    ) -> PlatformResult<Option<BTreeMap<String, String>>> {
        let mut state = self.state();
        state.record(Operation::GetAnnotations, format!("{}/{}", namespace, resource))?;
        Ok(state
            .objects
            .get(&(namespace.to_string(), resource.clone()))
            .map(|o| o.annotations.clone()))
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        annotations: &BTreeMap<String, String>,
    ) -> PlatformResult<()> {
        let mut state = self.state();
        state.record(Operation::PatchAnnotations, format!("{}/{}", namespace, resource))?;
        if state.reject_annotation_patches {
            return Err(PlatformError::rejected(format!(
                "{} is immutable and cannot be annotated",
                resource
            )));
        }
        match state.objects.get_mut(&(namespace.to_string(), resource.clone())) {
            Some(object) => {
                object.annotations.extend(annotations.clone());
                Ok(())
            }
            None => Err(PlatformError::NotFound(resource.to_string())),
        }
    }

    async fn patch_labels(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<()> {
        let mut state = self.state();
        state.record(Operation::PatchLabels, format!("{}/{}", namespace, resource))?;
        match state.objects.get_mut(&(namespace.to_string(), resource.clone())) {
            Some(object) => {
                object.labels.extend(labels.clone());
                Ok(())
            }
            None => Err(PlatformError::NotFound(resource.to_string())),
        }
    }

    async fn delete_resource(&self, namespace: &str, resource: &ResourceRef) -> PlatformResult<bool> {
        let mut state = self.state();
        state.record(Operation::DeleteResource, format!("{}/{}", namespace, resource))?;

        let Some(object) = state.objects.remove(&(namespace.to_string(), resource.clone())) else {
            return Ok(false);
        };
        if let Some(name) = object.labels.get("name") {
            if object.labels.get("owner").map(String::as_str) == Some("helm") {
                state.settle_release(&ReleaseRef::new(name.clone(), namespace));
            }
        }
        Ok(true)
    }

    async fn list_resources(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> PlatformResult<Vec<String>> {
        let mut state = self.state();
        state.record(Operation::ListResources, format!("{}/{} -l {}", namespace, kind, selector))?;
        Ok(state
            .objects
            .iter()
            .filter(|((ns, r), o)| ns == namespace && r.kind == kind && labels_match(&o.labels, selector))
            .map(|((_, r), _)| r.name.clone())
            .collect())
    }

    async fn workload_logs(&self, namespace: &str, selector: &str, tail_lines: u32) -> PlatformResult<String> {
        let mut state = self.state();
        state.record(Operation::Diagnostics, format!("{}/logs -l {}", namespace, selector))?;
        let lines: Vec<&str> = state.workload_logs.lines().collect();
        let start = lines.len().saturating_sub(tail_lines as usize);
        Ok(lines[start..].join("\n"))
    }

    async fn pod_summary(&self, namespace: &str, selector: &str) -> PlatformResult<String> {
        let mut state = self.state();
        state.record(Operation::Diagnostics, format!("{}/pods -l {}", namespace, selector))?;
        let rows: Vec<String> = state
            .objects
            .iter()
            .filter(|((ns, _), o)| ns == namespace && o.replicas.is_some() && labels_match(&o.labels, selector))
            .filter_map(|((_, r), o)| {
                o.replicas
                    .map(|(desired, ready)| format!("{}-0   {}/{}", r.name, ready, desired))
            })
            .collect();
        Ok(rows.join("\n"))
    }

    async fn recent_events(&self, namespace: &str, _limit: u32) -> PlatformResult<String> {
        let mut state = self.state();
        state.record(Operation::Diagnostics, format!("{}/events", namespace))?;
        Ok(String::new())
    }
}
