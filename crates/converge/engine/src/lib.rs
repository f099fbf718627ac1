//! Converge Engine - One-shot convergence of stateful services
//!
//! Given services in an unknown, possibly half-applied state, the engine
//! decides once per pipeline run whether to skip, patch credentials,
//! upgrade, or reinstall each of them, clearing stuck package-manager
//! transactions and broken ownership metadata on the way.
//!
//! ## Stages
//!
//! - [`Prober`]: reads live state into an `ObservedState`
//! - [`resolve`]: derives the `DesiredState` from credentials and flags
//! - [`classify`]: pure mapping to a `DriftClass`
//! - [`plan`]: pure mapping to a single `Decision`
//! - [`Executor`]: performs the action with bounded retry
//! - [`Verifier`]: re-probes and judges the result
//!
//! [`Reconciler`] runs the stages for every service in dependency order
//! and produces a [`RunReport`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod order;
pub mod planner;
pub mod prober;
pub mod reconciler;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod values;
pub mod verifier;

pub use classifier::{classify, drifted_keys, secrets_drifted};
pub use config::{DiagnosticsConfig, EngineConfig, RetryConfig, VerifyConfig};
pub use error::{ConvergeError, OrderError, ProbeError, ResolveError, Result};
pub use executor::{ActionOutcome, Executor};
pub use order::dependency_order;
pub use planner::plan;
pub use prober::Prober;
pub use reconciler::{Reconciler, RunOptions};
pub use report::{RunReport, ServiceReport, ServiceStatus};
pub use resolver::{resolve, CredentialPolicy, RunFlags};
pub use retry::{Retried, RetryFailure, RetryPolicy};
pub use values::render_values;
pub use verifier::{Diagnostics, Verification, Verifier};
