//! Converge Platform - Package manager and orchestration adapters
//!
//! The engine talks to the platform exclusively through two traits:
//!
//! - [`PackageManager`]: release status, converge (install or upgrade), uninstall
//! - [`OrchestrationApi`]: workloads, secrets, ownership metadata, diagnostics
//!
//! [`HelmCli`] drives the `helm` binary through a [`CommandRunner`];
//! [`KubeApi`] talks to the API server through `kube`. Raw command output and
//! API status codes are interpreted only here; callers see typed statuses and
//! [`PlatformError`] variants. [`InMemoryPlatform`] implements both traits
//! for tests.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod cluster;
pub mod error;
pub mod helm;
pub mod memory;
pub mod runner;
pub mod traits;

pub use cluster::KubeApi;
pub use error::{PlatformError, PlatformResult};
pub use helm::HelmCli;
pub use memory::{InMemoryPlatform, Operation, PlatformCall};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner, ScriptedRunner};
pub use traits::{ConvergeRequest, OrchestrationApi, PackageManager, WorkloadStatus};
