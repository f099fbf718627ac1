//! Observed and desired state of a service

use crate::secret::SecretMap;
use crate::service::ResourceRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction status of a release, as reported by the package manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Last transaction completed
    Deployed,
    /// An upgrade was interrupted before completing or rolling back
    PendingUpgrade,
    /// An install was interrupted before completing
    PendingInstall,
    /// A rollback was interrupted before completing
    PendingRollback,
    /// Last transaction failed
    Failed,
    /// No release with this name exists
    Absent,
}

impl ReleaseStatus {
    /// Whether a transaction is left open on the release
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingRollback
        )
    }

    /// Whether a release record exists at all
    pub fn exists(&self) -> bool {
        !matches!(self, ReleaseStatus::Absent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live platform state of one service, captured fresh by the prober.
///
/// Every field is fully populated: a missing object is recorded as its
/// explicit absent value (no release, zero replicas, empty secret value).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    pub release_exists: bool,

    pub release_status: ReleaseStatus,

    /// Ready replicas of the workload, 0 if the workload is absent
    pub workload_ready_replicas: u32,

    /// Value of every credential key, empty if the secret or key is absent
    pub current_secret_values: SecretMap,

    /// Whether every checked resource carries the expected ownership
    pub ownership_annotations_valid: bool,

    /// Checked resources whose ownership is missing or mismatched
    pub ownership_violations: Vec<ResourceRef>,

    pub captured_at: DateTime<Utc>,
}

impl ObservedState {
    pub fn new(
        release_status: ReleaseStatus,
        workload_ready_replicas: u32,
        current_secret_values: SecretMap,
        ownership_violations: Vec<ResourceRef>,
    ) -> Self {
        Self {
            release_exists: release_status.exists(),
            release_status,
            workload_ready_replicas,
            current_secret_values,
            ownership_annotations_valid: ownership_violations.is_empty(),
            ownership_violations,
            captured_at: Utc::now(),
        }
    }

    /// Whether at least one replica can serve
    pub fn is_ready(&self) -> bool {
        self.workload_ready_replicas >= 1
    }
}

/// Target configuration of one service, derived without I/O
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredState {
    pub target_secret_values: SecretMap,

    pub target_chart_version: semver::Version,

    pub target_image_tag: Option<String>,

    /// Permits deleting release, workload and storage of an absent release
    pub cleanup_mode: bool,

    /// Upgrade unhealthy releases even when credentials already match
    pub force_install: bool,
}
