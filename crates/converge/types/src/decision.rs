//! Drift classification and the action chosen for it

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of observed state against desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftClass {
    /// A package-manager transaction was left pending
    OperationStuck,
    /// No release exists
    Absent,
    /// A checked resource is not owned by the release
    OwnershipInvalid,
    /// Not ready, credentials match
    UnhealthyMatching,
    /// Not ready, credentials differ
    UnhealthyDrifted,
    /// Ready, credentials match
    HealthyMatching,
    /// Ready, credentials differ
    HealthyDrifted,
}

impl DriftClass {
    /// Structural blockers must be cleared before health or credentials
    /// can be judged
    pub fn is_structural(&self) -> bool {
        matches!(self, DriftClass::OperationStuck | DriftClass::OwnershipInvalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftClass::OperationStuck => "operation-stuck",
            DriftClass::Absent => "absent",
            DriftClass::OwnershipInvalid => "ownership-invalid",
            DriftClass::UnhealthyMatching => "unhealthy-matching",
            DriftClass::UnhealthyDrifted => "unhealthy-drifted",
            DriftClass::HealthyMatching => "healthy-matching",
            DriftClass::HealthyDrifted => "healthy-drifted",
        }
    }
}

impl fmt::Display for DriftClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single action taken in a convergence pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Nothing to do
    Skip,
    /// Overwrite credential fields on the secret only
    SyncSecretOnly,
    /// Converge the existing release
    Upgrade,
    /// Converge a release that does not exist yet
    FreshInstall,
    /// Delete release, workload and storage, then install fresh
    DestroyAndReinstall,
    /// Remove the pending transaction markers of a stuck release
    UnlockStuckOperation,
    /// Restore ownership metadata on resources the release must adopt
    RepairOwnership,
}

impl ActionKind {
    /// Whether the action may delete persistent storage
    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionKind::DestroyAndReinstall)
    }

    /// Whether state must be probed and classified again afterwards
    pub fn requires_reclassify(&self) -> bool {
        matches!(
            self,
            ActionKind::UnlockStuckOperation | ActionKind::RepairOwnership
        )
    }

    /// Whether the action invokes the package manager's converge
    pub fn invokes_converge(&self) -> bool {
        matches!(
            self,
            ActionKind::Upgrade | ActionKind::FreshInstall | ActionKind::DestroyAndReinstall
        )
    }

    /// Whether success is judged by workload readiness.
    ///
    /// Skip and SyncSecretOnly make no readiness promise.
    pub fn expects_readiness(&self) -> bool {
        self.invokes_converge()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Skip => "skip",
            ActionKind::SyncSecretOnly => "sync-secret-only",
            ActionKind::Upgrade => "upgrade",
            ActionKind::FreshInstall => "fresh-install",
            ActionKind::DestroyAndReinstall => "destroy-and-reinstall",
            ActionKind::UnlockStuckOperation => "unlock-stuck-operation",
            ActionKind::RepairOwnership => "repair-ownership",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification and action for one pass, with the reason for the choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub classification: DriftClass,
    pub action: ActionKind,
    pub rationale: String,
    /// Set when the action leaves a known problem in place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Decision {
    pub fn new(classification: DriftClass, action: ActionKind, rationale: impl Into<String>) -> Self {
        Self {
            classification,
            action,
            rationale: rationale.into(),
            warning: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.classification, self.action, self.rationale)
    }
}
