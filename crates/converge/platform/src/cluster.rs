//! Orchestration API backed by the Kubernetes API server
//!
//! The client is built from the kubeconfig on first use, so commands that
//! never reach the cluster do not need one. Failures are mapped from the
//! API status code, never from message text.

use crate::error::{PlatformError, PlatformResult};
use crate::traits::{OrchestrationApi, WorkloadStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use converge_types::{ResourceKind, ResourceRef, SecretMap, SecretValue, WorkloadKind};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams, ResourceExt,
};
use kube::config::KubeConfigOptions;
use kube::core::ErrorResponse;
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Interval between checks that a deleted object is gone
const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Orchestration API talking to the cluster through `kube`
pub struct KubeApi {
    client: OnceCell<Client>,
    context: Option<String>,
    request_timeout: Duration,
    delete_timeout: Duration,
}

impl Default for KubeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl KubeApi {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            context: None,
            request_timeout: Duration::from_secs(15),
            delete_timeout: Duration::from_secs(600),
        }
    }

    /// Kubeconfig context; the current context when unset
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Connect and read bound of every API request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long a deletion may take to complete, finalizers included
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    async fn client(&self) -> PlatformResult<Client> {
        self.client.get_or_try_init(|| self.connect()).await.cloned()
    }

    async fn connect(&self) -> PlatformResult<Client> {
        let unreachable = |e: &dyn std::fmt::Display| {
            PlatformError::Unreachable(format!("kubeconfig: {}", e))
        };
        let mut config = match &self.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..KubeConfigOptions::default()
                };
                kube::Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| unreachable(&e))?
            }
            None => kube::Config::infer().await.map_err(|e| unreachable(&e))?,
        };
        config.connect_timeout = Some(self.request_timeout);
        config.read_timeout = Some(self.request_timeout);

        debug!(cluster = %config.cluster_url, "Connecting to cluster");
        Client::try_from(config).map_err(platform_error)
    }

    async fn api<K>(&self, namespace: &str) -> PlatformResult<Api<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Ok(Api::namespaced(self.client().await?, namespace))
    }

    async fn dynamic(&self, namespace: &str, kind: ResourceKind) -> PlatformResult<Api<DynamicObject>> {
        Ok(Api::namespaced_with(self.client().await?, namespace, &api_resource(kind)))
    }

    /// Poll until `resource` no longer exists, bounded by the delete timeout
    async fn wait_deleted(&self, api: &Api<DynamicObject>, resource: &ResourceRef) -> PlatformResult<()> {
        let gone = async {
            loop {
                match api.get_opt(&resource.name).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(_)) => tokio::time::sleep(DELETE_POLL_INTERVAL).await,
                    Err(e) => return Err(platform_error(e)),
                }
            }
        };
        match tokio::time::timeout(self.delete_timeout, gone).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout {
                operation: format!("delete {}", resource),
                after_secs: self.delete_timeout.as_secs(),
            }),
        }
    }
}

/// Map a client error onto the platform taxonomy
fn platform_error(err: kube::Error) -> PlatformError {
    match err {
        kube::Error::Api(response) => api_error(response),
        kube::Error::HyperError(e) => PlatformError::Unreachable(e.to_string()),
        kube::Error::Service(e) => PlatformError::Unreachable(e.to_string()),
        kube::Error::SerdeError(e) => PlatformError::InvalidResponse(e.to_string()),
        other => PlatformError::Transient(other.to_string()),
    }
}

fn api_error(response: ErrorResponse) -> PlatformError {
    match response.code {
        404 => PlatformError::NotFound(response.message),
        // 409 covers both stale resourceVersion writes and create races
        409 | 429 | 500 | 502 | 503 | 504 => PlatformError::Transient(response.message),
        _ => PlatformError::rejected(format!("{}: {}", response.reason, response.message)),
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
        ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        ResourceKind::Service => ApiResource::erase::<Service>(&()),
        ResourceKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
        ResourceKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
        ResourceKind::Role => ApiResource::erase::<Role>(&()),
        ResourceKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
        ResourceKind::PodDisruptionBudget => ApiResource::erase::<PodDisruptionBudget>(&()),
        ResourceKind::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
    }
}

fn count(value: Option<i32>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

/// Replica counts of one workload object
#[derive(Debug, Clone, PartialEq, Eq)]
struct Replicas {
    name: String,
    desired: u32,
    ready: u32,
}

impl From<&StatefulSet> for Replicas {
    fn from(set: &StatefulSet) -> Self {
        Self {
            name: set.name_any(),
            // unset means the API default of one
            desired: count(set.spec.as_ref().and_then(|s| s.replicas).or(Some(1))),
            ready: count(set.status.as_ref().and_then(|s| s.ready_replicas)),
        }
    }
}

impl From<&Deployment> for Replicas {
    fn from(deployment: &Deployment) -> Self {
        Self {
            name: deployment.name_any(),
            desired: count(deployment.spec.as_ref().and_then(|s| s.replicas).or(Some(1))),
            ready: count(deployment.status.as_ref().and_then(|s| s.ready_replicas)),
        }
    }
}

/// Sum the replicas of every matching workload, `None` if there is none
fn summarize(workloads: &[Replicas]) -> Option<WorkloadStatus> {
    let first = workloads.first()?;
    Some(WorkloadStatus {
        name: first.name.clone(),
        desired_replicas: workloads.iter().map(|w| w.desired).sum(),
        ready_replicas: workloads.iter().map(|w| w.ready).sum(),
    })
}

fn secret_values(secret: &Secret) -> PlatformResult<SecretMap> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(key, bytes)| {
            String::from_utf8(bytes.0.clone())
                .map(|value| (key.clone(), SecretValue::new(value)))
                .map_err(|_| PlatformError::InvalidResponse(format!("secret key {} is not UTF-8", key)))
        })
        .collect()
}

/// Overwrite `data` keys, keeping every other key of the secret
fn merge_secret_data(secret: &mut Secret, data: &SecretMap) {
    let existing = secret.data.get_or_insert_with(BTreeMap::new);
    for (key, value) in data {
        existing.insert(key.clone(), ByteString(value.expose().as_bytes().to_vec()));
    }
}

fn new_secret(namespace: &str, name: &str, data: &SecretMap) -> Secret {
    let mut secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    };
    merge_secret_data(&mut secret, data);
    secret
}

/// `NAME READY STATUS RESTARTS` row of one pod
fn pod_row(pod: &Pod) -> String {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    let total = pod.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0);
    let ready = statuses.iter().filter(|c| c.ready).count();
    let restarts: i32 = statuses.iter().map(|c| c.restart_count).sum();
    let waiting = statuses
        .iter()
        .find_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.clone());
    let phase = waiting
        .or_else(|| pod.status.as_ref().and_then(|s| s.phase.clone()))
        .unwrap_or_else(|| "Unknown".to_string());
    format!("{:<48} {}/{:<4} {:<24} {}", pod.name_any(), ready, total, phase, restarts)
}

fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// The `limit` most recent events, oldest first
fn format_events(mut events: Vec<Event>, limit: usize) -> String {
    events.sort_by_key(event_time);
    let start = events.len().saturating_sub(limit);
    events[start..]
        .iter()
        .map(|e| {
            format!(
                "{:<8} {:<24} {}/{}: {}",
                e.type_.as_deref().unwrap_or("-"),
                e.reason.as_deref().unwrap_or("-"),
                e.involved_object.kind.as_deref().unwrap_or("-").to_lowercase(),
                e.involved_object.name.as_deref().unwrap_or("-"),
                e.message.as_deref().unwrap_or("").trim(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl OrchestrationApi for KubeApi {
    #[instrument(skip(self))]
    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        selector: &str,
    ) -> PlatformResult<Option<WorkloadStatus>> {
        let params = ListParams::default().labels(selector);
        let workloads: Vec<Replicas> = match kind {
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = self.api(namespace).await?;
                api.list(&params).await.map_err(platform_error)?.items.iter().map(Replicas::from).collect()
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = self.api(namespace).await?;
                api.list(&params).await.map_err(platform_error)?.items.iter().map(Replicas::from).collect()
            }
        };

        let status = summarize(&workloads);
        if let Some(status) = &status {
            debug!(ready = status.ready_replicas, desired = status.desired_replicas, "Workload status");
        }
        Ok(status)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> PlatformResult<Option<SecretMap>> {
        let api: Api<Secret> = self.api(namespace).await?;
        match api.get_opt(name).await.map_err(platform_error)? {
            Some(secret) => Ok(Some(secret_values(&secret)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, data), fields(keys = data.len()))]
    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretMap) -> PlatformResult<()> {
        let api: Api<Secret> = self.api(namespace).await?;

        // replace carries the resourceVersion read here, so a concurrent
        // writer surfaces as a conflict instead of being overwritten
        match api.get_opt(name).await.map_err(platform_error)? {
            Some(mut secret) => {
                merge_secret_data(&mut secret, data);
                api.replace(name, &PostParams::default(), &secret)
                    .await
                    .map_err(platform_error)?;
            }
            None => {
                api.create(&PostParams::default(), &new_secret(namespace, name, data))
                    .await
                    .map_err(platform_error)?;
            }
        }
        Ok(())
    }

    async fn get_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
    ) -> PlatformResult<Option<BTreeMap<String, String>>> {
        let api = self.dynamic(namespace, resource.kind).await?;
        Ok(api
            .get_opt(&resource.name)
            .await
            .map_err(platform_error)?
            .map(|object| object.metadata.annotations.unwrap_or_default()))
    }

    #[instrument(skip(self, annotations))]
    async fn patch_annotations(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        annotations: &BTreeMap<String, String>,
    ) -> PlatformResult<()> {
        let api = self.dynamic(namespace, resource.kind).await?;
        let patch = Patch::Merge(json!({ "metadata": { "annotations": annotations } }));
        api.patch(&resource.name, &PatchParams::default(), &patch)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    #[instrument(skip(self, labels))]
    async fn patch_labels(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<()> {
        let api = self.dynamic(namespace, resource.kind).await?;
        let patch = Patch::Merge(json!({ "metadata": { "labels": labels } }));
        api.patch(&resource.name, &PatchParams::default(), &patch)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    /// Delete and wait until the object is gone
    #[instrument(skip(self))]
    async fn delete_resource(&self, namespace: &str, resource: &ResourceRef) -> PlatformResult<bool> {
        let api = self.dynamic(namespace, resource.kind).await?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(e) => match platform_error(e) {
                PlatformError::NotFound(_) => return Ok(false),
                other => return Err(other),
            },
        }

        self.wait_deleted(&api, resource).await?;
        info!(resource = %resource, "Deleted");
        Ok(true)
    }

    async fn list_resources(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> PlatformResult<Vec<String>> {
        let api = self.dynamic(namespace, kind).await?;
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(platform_error)?;
        Ok(list.items.iter().map(ResourceExt::name_any).collect())
    }

    async fn workload_logs(&self, namespace: &str, selector: &str, tail_lines: u32) -> PlatformResult<String> {
        let pods: Api<Pod> = self.api(namespace).await?;
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(platform_error)?;

        let mut sections = Vec::new();
        for pod in &list.items {
            let name = pod.name_any();
            for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
                let params = LogParams {
                    container: Some(container.name.clone()),
                    tail_lines: Some(i64::from(tail_lines)),
                    ..LogParams::default()
                };
                let text = pods
                    .logs(&name, &params)
                    .await
                    .unwrap_or_else(|e| format!("<logs unavailable: {}>", platform_error(e)));
                sections.push(format!("==> {}/{} <==\n{}", name, container.name, text.trim_end()));
            }
        }
        Ok(sections.join("\n"))
    }

    async fn pod_summary(&self, namespace: &str, selector: &str) -> PlatformResult<String> {
        let pods: Api<Pod> = self.api(namespace).await?;
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(platform_error)?;
        Ok(list.items.iter().map(pod_row).collect::<Vec<_>>().join("\n"))
    }

    async fn recent_events(&self, namespace: &str, limit: u32) -> PlatformResult<String> {
        let events: Api<Event> = self.api(namespace).await?;
        let list = events.list(&ListParams::default()).await.map_err(platform_error)?;
        Ok(format_events(list.items, limit as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateWaiting, ContainerStatus, ObjectReference, PodSpec,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn error_response(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse {
            status: "Failure".into(),
            message: format!("{} from server", reason),
            reason: reason.into(),
            code,
        }
    }

    fn stateful_set(name: &str, replicas: Option<i32>, ready: Option<i32>) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                replicas,
                ..StatefulSetSpec::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: ready,
                ..StatefulSetStatus::default()
            }),
        }
    }

    #[test]
    fn test_status_codes_map_onto_taxonomy() {
        assert!(api_error(error_response(404, "NotFound")).is_not_found());

        let conflict = api_error(error_response(409, "Conflict"));
        assert!(matches!(conflict, PlatformError::Transient(_)));
        assert!(api_error(error_response(429, "TooManyRequests")).is_transient());
        assert!(api_error(error_response(503, "ServiceUnavailable")).is_transient());

        let forbidden = api_error(error_response(403, "Forbidden"));
        assert!(matches!(forbidden, PlatformError::Rejected { .. }));
        assert!(!forbidden.is_transient());
        assert!(!api_error(error_response(422, "Invalid")).is_transient());
    }

    #[test]
    fn test_api_error_keeps_server_message() {
        let err = platform_error(kube::Error::Api(error_response(404, "NotFound")));
        assert_eq!(err, PlatformError::NotFound("NotFound from server".into()));
    }

    #[test]
    fn test_summarize_sums_every_matching_workload() {
        let sets = [
            stateful_set("kafka-controller", Some(3), Some(2)),
            stateful_set("kafka-broker", None, None),
        ];
        let replicas: Vec<Replicas> = sets.iter().map(Replicas::from).collect();

        let status = summarize(&replicas).unwrap();
        assert_eq!(status.name, "kafka-controller");
        assert_eq!(status.desired_replicas, 4);
        assert_eq!(status.ready_replicas, 2);
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_secret_merge_keeps_other_keys() {
        let mut secret = new_secret(
            "data",
            "postgresql",
            &SecretMap::from([("replication-password".to_string(), SecretValue::new("keep"))]),
        );
        secret.metadata.resource_version = Some("42".into());

        merge_secret_data(
            &mut secret,
            &SecretMap::from([("postgres-password".to_string(), SecretValue::new("s3cret"))]),
        );

        let values = secret_values(&secret).unwrap();
        assert_eq!(values["postgres-password"].expose(), "s3cret");
        assert_eq!(values["replication-password"].expose(), "keep");
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
    }

    #[test]
    fn test_secret_values_reject_binary_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([("keystore".to_string(), ByteString(vec![0xff, 0xfe]))])),
            ..Secret::default()
        };
        assert!(matches!(secret_values(&secret), Err(PlatformError::InvalidResponse(_))));
        assert!(secret_values(&Secret::default()).unwrap().is_empty());
    }

    #[test]
    fn test_api_resource_names_plural_paths() {
        assert_eq!(api_resource(ResourceKind::PersistentVolumeClaim).plural, "persistentvolumeclaims");
        assert_eq!(api_resource(ResourceKind::StatefulSet).group, "apps");
        assert_eq!(api_resource(ResourceKind::PodDisruptionBudget).api_version, "policy/v1");
        assert_eq!(api_resource(ResourceKind::Secret).api_version, "v1");
    }

    #[test]
    fn test_pod_row_prefers_waiting_reason() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("postgresql-0".into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "postgresql".into(),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "postgresql".into(),
                    ready: false,
                    restart_count: 7,
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".into()),
                            ..ContainerStateWaiting::default()
                        }),
                        ..ContainerState::default()
                    }),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
        };

        let row = pod_row(&pod);
        assert!(row.starts_with("postgresql-0"));
        assert!(row.contains("0/1"));
        assert!(row.contains("CrashLoopBackOff"));
        assert!(row.trim_end().ends_with('7'));
    }

    #[test]
    fn test_format_events_keeps_most_recent() {
        let event = |reason: &str, minutes_ago: i64| Event {
            type_: Some("Warning".into()),
            reason: Some(reason.into()),
            message: Some(format!("{} happened", reason)),
            involved_object: ObjectReference {
                kind: Some("Pod".into()),
                name: Some("postgresql-0".into()),
                ..ObjectReference::default()
            },
            last_timestamp: Some(Time(Utc::now() - chrono::Duration::minutes(minutes_ago))),
            ..Event::default()
        };

        let out = format_events(vec![event("BackOff", 1), event("Scheduled", 9), event("Pulled", 5)], 2);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Pulled"));
        assert!(lines[1].contains("pod/postgresql-0: BackOff happened"));
    }

    #[test]
    fn test_deletes_wait_longer_than_requests() {
        let api = KubeApi::new()
            .with_request_timeout(Duration::from_secs(15))
            .with_delete_timeout(Duration::from_secs(900));
        assert_eq!(api.request_timeout, Duration::from_secs(15));
        assert_eq!(api.delete_timeout, Duration::from_secs(900));
        assert!(KubeApi::new().delete_timeout > KubeApi::new().request_timeout);
    }

    #[tokio::test]
    async fn test_unknown_context_is_unreachable() {
        let api = KubeApi::new().with_context(Some("converge-no-such-context".into()));
        let err = api.get_secret("data", "postgresql").await.unwrap_err();
        assert!(matches!(err, PlatformError::Unreachable(_)));
        assert!(err.is_transient());
    }
}
