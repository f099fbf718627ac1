//! Helm-backed package manager

use crate::error::{classify_release_failure, tail, PlatformError, PlatformResult, LOG_TAIL_LINES};
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::traits::{ConvergeRequest, PackageManager};
use async_trait::async_trait;
use converge_types::{ReleaseRef, ReleaseStatus};
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Extra time granted to the process beyond helm's own `--timeout`
const PROCESS_GRACE: Duration = Duration::from_secs(30);

/// Package manager driving the `helm` binary
pub struct HelmCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    kube_context: Option<String>,
    query_timeout: Duration,
}

impl HelmCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            kube_context: None,
            query_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_kube_context(mut self, context: Option<String>) -> Self {
        self.kube_context = context;
        self
    }

    /// Bound for read-only calls such as `helm status`
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    fn invocation(&self, release: &ReleaseRef, timeout: Duration) -> Invocation {
        let mut inv = Invocation::new(&self.binary, timeout);
        if let Some(context) = &self.kube_context {
            inv = inv.args(["--kube-context", context.as_str()]);
        }
        inv.args(["--namespace", release.namespace.as_str()])
    }

    /// Run an install, upgrade or uninstall. Nothing it fails with is
    /// transient: the release is left pending or half-applied.
    async fn run_release_mutation(&self, inv: &Invocation, verb: &str) -> PlatformResult<CommandOutput> {
        match self.runner.run(inv).await {
            Ok(output) => Ok(output),
            Err(PlatformError::Timeout { operation, after_secs }) => Err(PlatformError::Rejected {
                message: format!("{} did not finish within {}s", verb, after_secs),
                log_tail: Some(operation),
            }),
            Err(PlatformError::Transient(message)) => Err(PlatformError::rejected(message)),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    info: StatusInfo,
}

#[derive(Debug, Deserialize)]
struct StatusInfo {
    status: String,
}

/// Map helm's release status names onto the typed status
fn parse_status(raw: &str) -> ReleaseStatus {
    match raw {
        "deployed" | "superseded" => ReleaseStatus::Deployed,
        "pending-install" => ReleaseStatus::PendingInstall,
        "pending-upgrade" => ReleaseStatus::PendingUpgrade,
        "pending-rollback" => ReleaseStatus::PendingRollback,
        "uninstalled" => ReleaseStatus::Absent,
        "failed" => ReleaseStatus::Failed,
        other => {
            warn!(status = other, "Unrecognised release status, treating as failed");
            ReleaseStatus::Failed
        }
    }
}

#[async_trait]
impl PackageManager for HelmCli {
    #[instrument(skip(self), fields(release = %release))]
    async fn status(&self, release: &ReleaseRef) -> PlatformResult<ReleaseStatus> {
        let inv = self
            .invocation(release, self.query_timeout)
            .args(["status", release.name.as_str(), "--output", "json"]);

        match self.runner.run(&inv).await?.into_result(&self.binary) {
            Ok(stdout) => {
                let doc: StatusDocument = serde_json::from_str(&stdout)?;
                let status = parse_status(&doc.info.status);
                debug!(status = %status, "Release status");
                Ok(status)
            }
            Err(e) if e.is_not_found() => Ok(ReleaseStatus::Absent),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, request), fields(release = %request.release, chart = %request.chart_ref))]
    async fn converge(&self, request: &ConvergeRequest) -> PlatformResult<String> {
        let mut values_file = tempfile::Builder::new()
            .prefix("converge-values-")
            .suffix(".json")
            .tempfile()?;
        values_file.write_all(serde_json::to_string_pretty(&request.values)?.as_bytes())?;
        values_file.flush()?;

        let version = request.chart_version.to_string();
        let helm_timeout = format!("{}s", request.timeout.as_secs());
        let inv = self
            .invocation(&request.release, request.timeout + PROCESS_GRACE)
            .args([
                "upgrade",
                "--install",
                request.release.name.as_str(),
                request.chart_ref.as_str(),
                "--version",
                version.as_str(),
                "--values",
            ])
            .arg(values_file.path().to_string_lossy())
            .args(["--wait", "--timeout", helm_timeout.as_str()]);

        info!(version = %version, "Converging release");

        let output = self.run_release_mutation(&inv, "converge").await?;
        if !output.is_success() {
            return Err(classify_release_failure(&self.binary, &output.stdout, &output.stderr));
        }
        Ok(tail(&format!("{}{}", output.stdout, output.stderr), LOG_TAIL_LINES).unwrap_or_default())
    }

    #[instrument(skip(self), fields(release = %release))]
    async fn uninstall(&self, release: &ReleaseRef, timeout: Duration) -> PlatformResult<bool> {
        let helm_timeout = format!("{}s", timeout.as_secs());
        let inv = self.invocation(release, timeout + PROCESS_GRACE).args([
            "uninstall",
            release.name.as_str(),
            "--wait",
            "--timeout",
            helm_timeout.as_str(),
        ]);

        let output = self.run_release_mutation(&inv, "uninstall").await?;
        if output.is_success() {
            info!("Release uninstalled");
            return Ok(true);
        }
        match output.clone().into_result(&self.binary) {
            Err(e) if e.is_not_found() => Ok(false),
            _ => Err(classify_release_failure(&self.binary, &output.stdout, &output.stderr)),
        }
    }

    fn transaction_marker_selector(&self, release: &ReleaseRef, status: ReleaseStatus) -> String {
        format!("owner=helm,name={},status={}", release.name, status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};

    fn helm(runner: Arc<ScriptedRunner>) -> HelmCli {
        HelmCli::new(runner, "helm").with_kube_context(Some("staging".into()))
    }

    #[tokio::test]
    async fn test_status_parses_pending_upgrade() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::success(
            r#"{"name":"db","info":{"status":"pending-upgrade","description":"Preparing upgrade"},"version":4}"#,
        ))]));
        let pm = helm(runner.clone());

        let status = pm.status(&ReleaseRef::new("db", "data")).await.unwrap();
        assert_eq!(status, ReleaseStatus::PendingUpgrade);

        let inv = &runner.invocations()[0];
        assert_eq!(
            inv.args,
            vec!["--kube-context", "staging", "--namespace", "data", "status", "db", "--output", "json"]
        );
    }

    #[tokio::test]
    async fn test_status_not_found_is_absent() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::failure(
            1,
            "Error: release: not found\n",
        ))]));
        let status = helm(runner).status(&ReleaseRef::new("db", "data")).await.unwrap();
        assert_eq!(status, ReleaseStatus::Absent);
    }

    #[tokio::test]
    async fn test_status_unreachable_propagates() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::failure(
            1,
            "Error: Kubernetes cluster unreachable: Get \"https://10.0.0.1/version\": dial tcp",
        ))]));
        let err = helm(runner).status(&ReleaseRef::new("db", "data")).await.unwrap_err();
        assert!(matches!(err, PlatformError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_converge_builds_upgrade_install() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::success(
            "Release \"db\" has been upgraded. Happy Helming!\n",
        ))]));
        let pm = helm(runner.clone());
        let request = ConvergeRequest {
            release: ReleaseRef::new("db", "data"),
            chart_ref: "bitnami/postgresql".into(),
            chart_version: semver::Version::new(15, 5, 0),
            values: serde_json::json!({"auth": {"password": "x"}}),
            timeout: Duration::from_secs(600),
        };

        let log = pm.converge(&request).await.unwrap();
        assert!(log.contains("Happy Helming"));

        let inv = &runner.invocations()[0];
        assert_eq!(inv.timeout, Duration::from_secs(630));
        let args = inv.args.join(" ");
        assert!(args.contains("upgrade --install db bitnami/postgresql --version 15.5.0 --values"));
        assert!(args.ends_with("--wait --timeout 600s"));
        // credentials travel in the values file, not on the command line
        assert!(!args.contains("password"));
    }

    #[tokio::test]
    async fn test_converge_timeout_is_not_retryable() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Err(PlatformError::Timeout {
            operation: "helm upgrade".into(),
            after_secs: 630,
        })]));
        let request = ConvergeRequest {
            release: ReleaseRef::new("db", "data"),
            chart_ref: "bitnami/postgresql".into(),
            chart_version: semver::Version::new(15, 5, 0),
            values: serde_json::json!({}),
            timeout: Duration::from_secs(600),
        };
        let err = helm(runner).converge(&request).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_converge_wait_deadline_is_not_retryable() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput {
            code: Some(1),
            stdout: "Release \"db\" has been upgraded. Waiting for resources\n".into(),
            stderr: "Error: UPGRADE FAILED: context deadline exceeded\n".into(),
        })]));
        let request = ConvergeRequest {
            release: ReleaseRef::new("db", "data"),
            chart_ref: "bitnami/postgresql".into(),
            chart_version: semver::Version::new(15, 5, 0),
            values: serde_json::json!({}),
            timeout: Duration::from_secs(600),
        };

        let err = helm(runner).converge(&request).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("context deadline exceeded"));
        assert!(err.log_tail().unwrap().contains("Waiting for resources"));
    }

    #[tokio::test]
    async fn test_uninstall_wait_timeout_is_not_retryable() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::failure(
            1,
            "Error: uninstallation completed with 1 error(s): timed out waiting for the condition",
        ))]));
        let err = helm(runner)
            .uninstall(&ReleaseRef::new("db", "data"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_uninstall_missing_release() {
        let runner = Arc::new(ScriptedRunner::with_responses(vec![Ok(CommandOutput::failure(
            1,
            "Error: uninstall: Release not loaded: db: release: not found",
        ))]));
        let removed = helm(runner)
            .uninstall(&ReleaseRef::new("db", "data"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!removed);
    }

    #[test]
    fn test_marker_selector() {
        let pm = helm(Arc::new(ScriptedRunner::new()));
        assert_eq!(
            pm.transaction_marker_selector(&ReleaseRef::new("db", "data"), ReleaseStatus::PendingInstall),
            "owner=helm,name=db,status=pending-install"
        );
    }

    #[test]
    fn test_parse_status_names() {
        assert_eq!(parse_status("superseded"), ReleaseStatus::Deployed);
        assert_eq!(parse_status("uninstalled"), ReleaseStatus::Absent);
        assert_eq!(parse_status("uninstalling"), ReleaseStatus::Failed);
    }
}
