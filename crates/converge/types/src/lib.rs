//! Converge Types - Core value objects for stateful service convergence
//!
//! A convergence pass takes a service running on an orchestration platform
//! in an unknown state and decides, once per pipeline run, whether to skip,
//! patch credentials, upgrade, or reinstall it.
//!
//! ## Key Concepts
//!
//! - **ServiceSpec**: What to converge (release, chart, workload, secret)
//! - **ObservedState**: What the platform currently looks like
//! - **DesiredState**: What the run wants, derived from credentials and flags
//! - **Decision**: The classification and single action chosen for a pass
//! - **ExecutionResult**: What happened once the action ran and was verified
//!
//! Every value here is constructed fresh for a run and discarded after it.
//! Nothing in this crate performs I/O.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod decision;
pub mod ids;
pub mod result;
pub mod secret;
pub mod service;
pub mod state;

// Re-export main types
pub use decision::{ActionKind, Decision, DriftClass};
pub use ids::{ReleaseRef, RunId};
pub use result::ExecutionResult;
pub use secret::{SecretMap, SecretValue};
pub use service::{
    ResourceKind, ResourceRef, ResourceRequests, ServiceSpec, SpecValidationError, WorkloadKind,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_NAME_ANNOTATION, RELEASE_NAMESPACE_ANNOTATION,
};
pub use state::{DesiredState, ObservedState, ReleaseStatus};
