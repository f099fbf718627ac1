//! Engine error types

use converge_platform::PlatformError;
use converge_types::{Decision, ObservedState, SpecValidationError};
use thiserror::Error;

/// Live state could not be read
#[derive(Debug, Clone, Error)]
#[error("Probe of {service} failed reading {query}: {source}")]
pub struct ProbeError {
    pub service: String,
    /// Query that failed (release status, workload, secret, ownership)
    pub query: &'static str,
    #[source]
    pub source: PlatformError,
    pub retries: u32,
}

/// Desired state cannot be derived from the supplied credentials
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("No value for credential {key} of {service}: set a master credential or an override")]
    MissingCredential { service: String, key: String },

    #[error("Credential {key} of {service} resolves to an empty value")]
    EmptyCredential { service: String, key: String },
}

/// Service dependency graph errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("Service {0} is defined more than once")]
    DuplicateService(String),

    #[error("Service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("Dependency cycle between services: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Errors raised while converging
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("Invalid service {service}: {source}")]
    InvalidSpec {
        service: String,
        #[source]
        source: SpecValidationError,
    },

    #[error("Unknown service selected: {0}")]
    UnknownService(String),

    /// The action was rejected, or transient failures outlasted the retry budget
    #[error("Converging {service} failed ({}): {message}", .decision.action)]
    FatalConverge {
        service: String,
        decision: Box<Decision>,
        observed: Box<ObservedState>,
        message: String,
        log_tail: Option<String>,
        retries: u32,
    },

    /// Structural repairs kept finding new structural drift
    #[error("{service} still {} after {passes} repair passes", .last.classification)]
    UnresolvedDrift {
        service: String,
        passes: u32,
        last: Box<Decision>,
        observed: Box<ObservedState>,
    },

    #[error("Run cancelled")]
    Cancelled,
}

impl ConvergeError {
    /// Decision that produced the failure, if one was made
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            ConvergeError::FatalConverge { decision, .. } => Some(&**decision),
            ConvergeError::UnresolvedDrift { last, .. } => Some(&**last),
            _ => None,
        }
    }

    /// Live state the failing decision was made on
    pub fn observed(&self) -> Option<&ObservedState> {
        match self {
            ConvergeError::FatalConverge { observed, .. } => Some(&**observed),
            ConvergeError::UnresolvedDrift { observed, .. } => Some(&**observed),
            _ => None,
        }
    }

    /// Package-manager output captured with the failure
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            ConvergeError::FatalConverge { log_tail, .. } => log_tail.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure makes every later service pointless to attempt
    pub fn aborts_run(&self) -> bool {
        matches!(self, ConvergeError::Probe(_) | ConvergeError::Cancelled)
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ConvergeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use converge_types::{ActionKind, DriftClass};

    #[test]
    fn test_fatal_converge_display() {
        let err = ConvergeError::FatalConverge {
            service: "postgresql".into(),
            decision: Box::new(Decision::new(DriftClass::Absent, ActionKind::FreshInstall, "no release")),
            observed: Box::new(ObservedState::new(
                converge_types::ReleaseStatus::Absent,
                0,
                Default::default(),
                vec![],
            )),
            message: "INSTALLATION FAILED: schema".into(),
            log_tail: Some("line".into()),
            retries: 0,
        };
        assert_eq!(
            err.to_string(),
            "Converging postgresql failed (fresh-install): INSTALLATION FAILED: schema"
        );
        assert_eq!(err.log_tail(), Some("line"));
        assert_eq!(err.decision().unwrap().action, ActionKind::FreshInstall);
        assert!(!err.observed().unwrap().release_exists);
        assert!(!err.aborts_run());
    }

    #[test]
    fn test_cycle_display() {
        let err = OrderError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Dependency cycle between services: a, b");
    }
}
