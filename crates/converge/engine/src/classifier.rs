//! Drift classifier
//!
//! Pure mapping of observed x desired state to a [`DriftClass`]. Rules are
//! applied in strict priority order and the first match wins:
//!
//! 1. pending transaction -> `OperationStuck`
//! 2. no release -> `Absent`
//! 3. ownership mismatch -> `OwnershipInvalid`
//! 4. no ready replica -> `UnhealthyMatching` / `UnhealthyDrifted`
//! 5. otherwise -> `HealthyMatching` / `HealthyDrifted`

use converge_types::{DesiredState, DriftClass, ObservedState};

pub fn classify(observed: &ObservedState, desired: &DesiredState) -> DriftClass {
    if observed.release_status.is_pending() {
        return DriftClass::OperationStuck;
    }
    if !observed.release_exists {
        return DriftClass::Absent;
    }
    if !observed.ownership_annotations_valid {
        return DriftClass::OwnershipInvalid;
    }

    let drifted = secrets_drifted(observed, desired);
    match (observed.is_ready(), drifted) {
        (false, false) => DriftClass::UnhealthyMatching,
        (false, true) => DriftClass::UnhealthyDrifted,
        (true, false) => DriftClass::HealthyMatching,
        (true, true) => DriftClass::HealthyDrifted,
    }
}

/// Whether any desired credential differs from its observed value.
///
/// Compares exact values; a key missing from the observed state counts as
/// the empty value.
pub fn secrets_drifted(observed: &ObservedState, desired: &DesiredState) -> bool {
    !drifted_keys(observed, desired).is_empty()
}

/// Names of the credential keys whose observed value differs
pub fn drifted_keys<'a>(observed: &ObservedState, desired: &'a DesiredState) -> Vec<&'a str> {
    desired
        .target_secret_values
        .iter()
        .filter(|(key, target)| {
            observed
                .current_secret_values
                .get(*key)
                .map_or(true, |current| current != *target)
        })
        .map(|(key, _)| key.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_types::{ReleaseStatus, ResourceKind, ResourceRef, SecretMap, SecretValue};

    fn secrets(value: &str) -> SecretMap {
        SecretMap::from([("password".to_string(), SecretValue::new(value))])
    }

    fn desired() -> DesiredState {
        DesiredState {
            target_secret_values: secrets("target"),
            target_chart_version: semver::Version::new(1, 0, 0),
            target_image_tag: None,
            cleanup_mode: false,
            force_install: false,
        }
    }

    fn observed(status: ReleaseStatus, ready: u32, value: &str) -> ObservedState {
        ObservedState::new(status, ready, secrets(value), vec![])
    }

    #[test]
    fn test_health_and_drift_quadrants() {
        let d = desired();
        assert_eq!(classify(&observed(ReleaseStatus::Deployed, 1, "target"), &d), DriftClass::HealthyMatching);
        assert_eq!(classify(&observed(ReleaseStatus::Deployed, 3, "old"), &d), DriftClass::HealthyDrifted);
        assert_eq!(classify(&observed(ReleaseStatus::Deployed, 0, "target"), &d), DriftClass::UnhealthyMatching);
        assert_eq!(classify(&observed(ReleaseStatus::Failed, 0, "old"), &d), DriftClass::UnhealthyDrifted);
    }

    #[test]
    fn test_absent_before_health() {
        assert_eq!(classify(&observed(ReleaseStatus::Absent, 2, "old"), &desired()), DriftClass::Absent);
    }

    #[test]
    fn test_stuck_beats_ownership() {
        let stuck = ObservedState::new(
            ReleaseStatus::PendingInstall,
            0,
            secrets("old"),
            vec![ResourceRef::new(ResourceKind::Secret, "db")],
        );
        assert_eq!(classify(&stuck, &desired()), DriftClass::OperationStuck);
    }

    #[test]
    fn test_exact_value_comparison() {
        // same length, different content
        let o = observed(ReleaseStatus::Deployed, 1, "tarxet");
        assert!(secrets_drifted(&o, &desired()));
        assert_eq!(drifted_keys(&o, &desired()), vec!["password"]);

        let empty = ObservedState::new(ReleaseStatus::Deployed, 1, SecretMap::new(), vec![]);
        assert!(secrets_drifted(&empty, &desired()));
    }
}
