//! Run report

use crate::verifier::Diagnostics;
use chrono::{DateTime, Utc};
use converge_types::{ActionKind, Decision, DriftClass, ExecutionResult, ObservedState, RunId};
use serde::Serialize;
use std::fmt;

/// Outcome of one service in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    /// A converging action ran and the workload is ready
    Converged,
    /// Nothing needed doing, or an unhealthy service was left alone
    Skipped,
    /// Credentials written; effective on the next restart
    Staged,
    /// The action ran but the workload did not become ready
    Degraded,
    Failed,
    /// The run stopped before this service was reached
    NotAttempted,
    /// Dry run: decision made, nothing executed
    Planned,
}

impl ServiceStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Converged | ServiceStatus::Skipped | ServiceStatus::Staged | ServiceStatus::Planned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Converged => "converged",
            ServiceStatus::Skipped => "skipped",
            ServiceStatus::Staged => "staged",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Failed => "failed",
            ServiceStatus::NotAttempted => "not-attempted",
            ServiceStatus::Planned => "planned",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReport {
    pub service: String,
    pub namespace: String,
    pub status: ServiceStatus,

    /// Every decision of the pass, structural repairs first
    pub decisions: Vec<Decision>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Live state behind a failed decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<ObservedState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
}

impl ServiceReport {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>, status: ServiceStatus) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            status,
            decisions: Vec::new(),
            result: None,
            error: None,
            observed: None,
            log_tail: None,
            diagnostics: None,
        }
    }

    /// Final decision of the pass
    pub fn decision(&self) -> Option<&Decision> {
        self.decisions.last()
    }

    pub fn classification(&self) -> Option<DriftClass> {
        self.decision().map(|d| d.classification)
    }

    pub fn action(&self) -> Option<ActionKind> {
        self.decision().map(|d| d.action)
    }

    pub fn warning(&self) -> Option<&str> {
        self.decisions.iter().rev().find_map(|d| d.warning.as_deref())
    }

    pub fn retries_used(&self) -> u32 {
        self.result.as_ref().map(|r| r.retries_used).unwrap_or(0)
    }
}

/// Report of a whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub services: Vec<ServiceReport>,

    /// Why the run stopped early, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::generate(),
            dry_run,
            started_at: now,
            completed_at: now,
            services: Vec::new(),
            aborted: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.services.iter().all(|s| s.status.is_success())
    }

    pub fn count(&self, status: ServiceStatus) -> usize {
        self.services.iter().filter(|s| s.status == status).count()
    }

    /// Process exit code: 0 on success, 2 when the only problem is a
    /// workload that did not become ready, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return 0;
        }
        let hard_failure = self.aborted.is_some()
            || self
                .services
                .iter()
                .any(|s| matches!(s.status, ServiceStatus::Failed | ServiceStatus::NotAttempted));
        if hard_failure {
            1
        } else {
            2
        }
    }
}
