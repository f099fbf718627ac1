//! Action planner

use converge_types::{ActionKind, Decision, DesiredState, DriftClass};

/// Choose the single action for `classification`.
///
/// `DestroyAndReinstall` is only ever chosen for an absent release in
/// cleanup mode.
pub fn plan(classification: DriftClass, desired: &DesiredState) -> Decision {
    match classification {
        DriftClass::OperationStuck => Decision::new(
            classification,
            ActionKind::UnlockStuckOperation,
            "a package-manager transaction is pending; clearing it before anything else",
        ),
        DriftClass::OwnershipInvalid => Decision::new(
            classification,
            ActionKind::RepairOwnership,
            "resources carry foreign or missing ownership metadata; the release cannot adopt them",
        ),
        DriftClass::Absent if desired.cleanup_mode => Decision::new(
            classification,
            ActionKind::DestroyAndReinstall,
            "no release exists and cleanup is enabled; removing leftover workload and storage",
        ),
        DriftClass::Absent => Decision::new(classification, ActionKind::FreshInstall, "no release exists"),
        DriftClass::HealthyMatching => Decision::new(
            classification,
            ActionKind::Skip,
            "workload is ready and credentials match",
        ),
        DriftClass::HealthyDrifted => Decision::new(
            classification,
            ActionKind::SyncSecretOnly,
            "workload is ready; only credentials differ",
        ),
        DriftClass::UnhealthyMatching if desired.force_install => Decision::new(
            classification,
            ActionKind::Upgrade,
            "workload is not ready and force-install is set",
        ),
        DriftClass::UnhealthyMatching => Decision::new(
            classification,
            ActionKind::Skip,
            "credentials match; leaving the unready workload alone",
        )
        .with_warning("workload has no ready replicas; rerun with force-install to upgrade it"),
        DriftClass::UnhealthyDrifted => Decision::new(
            classification,
            ActionKind::Upgrade,
            "workload is not ready and credentials differ",
        ),
    }
}
