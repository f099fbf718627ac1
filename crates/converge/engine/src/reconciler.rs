//! One-shot reconciliation of the managed services
//!
//! Services are converged one at a time in dependency order. For each
//! service the stages run strictly in sequence:
//!
//! ```text
//! probe -> resolve -> classify -> plan -> execute -> verify
//! ```
//!
//! Structural actions (unlocking a stuck release, repairing ownership) are
//! followed by a fresh probe and classification, bounded by
//! `max_structural_passes`. Every other action is terminal for the pass.

use crate::classifier::classify;
use crate::config::EngineConfig;
use crate::error::{ConvergeError, Result};
use crate::executor::{ActionOutcome, Executor};
use crate::order::{dependency_order, has_dependents};
use crate::planner::plan;
use crate::prober::Prober;
use crate::report::{RunReport, ServiceReport, ServiceStatus};
use crate::resolver::{resolve, CredentialPolicy, RunFlags};
use crate::retry::RetryPolicy;
use crate::verifier::{Verification, Verifier};
use chrono::Utc;
use converge_platform::{OrchestrationApi, PackageManager};
use converge_types::{ActionKind, DesiredState, ExecutionResult, ServiceSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Options of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub flags: RunFlags,
    /// Plan only, execute nothing
    pub dry_run: bool,
    /// Restrict the run to these services; empty means all
    pub services: Vec<String>,
}

/// Drives every stage of a run
pub struct Reconciler {
    config: EngineConfig,
    credentials: CredentialPolicy,
    prober: Prober,
    executor: Executor,
    verifier: Verifier,
    cancelled: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        packages: Arc<dyn PackageManager>,
        api: Arc<dyn OrchestrationApi>,
        config: EngineConfig,
        credentials: CredentialPolicy,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            prober: Prober::new(packages.clone(), api.clone(), retry.clone()),
            executor: Executor::new(packages, api.clone(), retry, config.converge_timeout()),
            verifier: Verifier::new(
                api,
                Duration::from_secs(config.verify.settle_delay_secs),
                config.diagnostics.clone(),
            ),
            config,
            credentials,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Flag that, once set, stops the run at the next stage boundary
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ConvergeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Select, validate and order the services of a run, and resolve their
    /// desired state. Performs no I/O.
    pub fn prepare<'a>(&self, specs: &'a [ServiceSpec], options: &RunOptions) -> Result<Vec<(&'a ServiceSpec, DesiredState)>> {
        for spec in specs {
            spec.validate().map_err(|source| ConvergeError::InvalidSpec {
                service: spec.name.clone(),
                source,
            })?;
        }
        if let Some(unknown) = options
            .services
            .iter()
            .find(|name| !specs.iter().any(|s| &s.name == *name))
        {
            return Err(ConvergeError::UnknownService(unknown.clone()));
        }

        let mut selected = Vec::new();
        for spec in dependency_order(specs)? {
            if options.services.is_empty() || options.services.contains(&spec.name) {
                selected.push((spec, resolve(spec, &self.credentials, options.flags)?));
            }
        }
        Ok(selected)
    }

    /// Converge every selected service once.
    ///
    /// Configuration errors are returned before anything touches the
    /// platform. Failures after that are recorded in the report: a probe
    /// failure or cancellation stops the run, and so does a failed service
    /// that a later service depends on.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub async fn run(&self, specs: &[ServiceSpec], options: &RunOptions) -> Result<RunReport> {
        let selected = self.prepare(specs, options)?;
        let mut report = RunReport::new(options.dry_run);
        info!(run_id = %report.run_id, services = selected.len(), "Starting convergence run");

        let ordered: Vec<&ServiceSpec> = selected.iter().map(|(spec, _)| *spec).collect();
        for (index, (spec, desired)) in selected.iter().enumerate() {
            if let Some(reason) = &report.aborted {
                let mut skipped = ServiceReport::new(&spec.name, &spec.namespace, ServiceStatus::NotAttempted);
                skipped.error = Some(reason.clone());
                report.services.push(skipped);
                continue;
            }

            match self.converge_service(spec, desired, options.dry_run).await {
                Ok(service) => report.services.push(service),
                Err(err) => {
                    error!(service = %spec.name, error = %err, "Service convergence failed");
                    if err.aborts_run() {
                        report.aborted = Some(err.to_string());
                    } else if has_dependents(&ordered, index) {
                        report.aborted = Some(format!("{} failed and later services depend on it", spec.name));
                    }
                    report.services.push(failed_report(spec, &err));
                }
            }
        }

        report.completed_at = Utc::now();
        info!(
            run_id = %report.run_id,
            succeeded = report.is_success(),
            exit_code = report.exit_code(),
            "Convergence run finished"
        );
        Ok(report)
    }

    /// Converge one service: structural passes, then one terminal action
    #[instrument(skip_all, fields(service = %spec.name))]
    pub async fn converge_service(&self, spec: &ServiceSpec, desired: &DesiredState, dry_run: bool) -> Result<ServiceReport> {
        let mut report = ServiceReport::new(&spec.name, &spec.namespace, ServiceStatus::Planned);
        let mut structural_passes = 0;
        let mut structural_retries = 0;

        loop {
            self.check_cancelled()?;
            let observed = self.prober.probe(spec).await?;
            let decision = plan(classify(&observed, desired), desired);
            info!(
                classification = %decision.classification,
                action = %decision.action,
                rationale = %decision.rationale,
                "Planned action"
            );
            if let Some(warning) = &decision.warning {
                warn!(warning = %warning, "Leaving known problem in place");
            }
            report.decisions.push(decision.clone());

            if dry_run {
                return Ok(report);
            }

            if decision.action.requires_reclassify() {
                structural_passes += 1;
                if structural_passes > self.config.max_structural_passes {
                    return Err(ConvergeError::UnresolvedDrift {
                        service: spec.name.clone(),
                        passes: self.config.max_structural_passes,
                        last: Box::new(decision),
                        observed: Box::new(observed),
                    });
                }
                self.check_cancelled()?;
                let outcome = self.executor.execute(spec, &decision, &observed, desired).await?;
                structural_retries += outcome.retries_used;
                continue;
            }

            self.check_cancelled()?;
            let mut outcome = self.executor.execute(spec, &decision, &observed, desired).await?;
            outcome.retries_used += structural_retries;

            // once an action ran it is always verified, cancellation or not
            let verification = self.verifier.verify(&self.prober, spec, decision.action).await?;
            report.status = outcome_status(&outcome, &verification);
            if let Verification::NotReady { diagnostics, .. } = &verification {
                warn!(service = %spec.name, "Workload not ready after {}", decision.action);
                report.error = Some("workload did not become ready".to_string());
                report.diagnostics = Some(diagnostics.clone());
            }
            report.log_tail = outcome.log_excerpt.clone();
            let result = execution_result(outcome, &verification);
            info!(
                status = %report.status,
                retries = result.retries_used,
                duration_ms = result.duration_ms(),
                "Service finished"
            );
            report.result = Some(result);
            return Ok(report);
        }
    }
}

fn outcome_status(outcome: &ActionOutcome, verification: &Verification) -> ServiceStatus {
    match outcome.action {
        ActionKind::Skip => ServiceStatus::Skipped,
        ActionKind::SyncSecretOnly => ServiceStatus::Staged,
        _ if verification.passed() => ServiceStatus::Converged,
        _ => ServiceStatus::Degraded,
    }
}

fn execution_result(outcome: ActionOutcome, verification: &Verification) -> ExecutionResult {
    ExecutionResult {
        action: outcome.action,
        succeeded: verification.passed(),
        final_ready_replicas: verification.observed().workload_ready_replicas,
        log_excerpt: outcome.log_excerpt,
        retries_used: outcome.retries_used,
        staged: outcome.staged,
        started_at: outcome.started_at,
        completed_at: Utc::now(),
    }
}

fn failed_report(spec: &ServiceSpec, err: &ConvergeError) -> ServiceReport {
    let status = match err {
        ConvergeError::Cancelled => ServiceStatus::NotAttempted,
        _ => ServiceStatus::Failed,
    };
    let mut report = ServiceReport::new(&spec.name, &spec.namespace, status);
    report.decisions.extend(err.decision().cloned());
    report.observed = err.observed().cloned();
    report.error = Some(err.to_string());
    report.log_tail = err.log_tail().map(str::to_string);
    report
}
