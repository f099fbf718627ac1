//! Output formatting utilities

use crate::error::CliResult;
use colored::*;
use converge_engine::{RunReport, ServiceReport, ServiceStatus};
use converge_types::ServiceSpec;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Print a single item as JSON or YAML
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(data)?);
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "CLASSIFICATION")]
    classification: String,
    #[tabled(rename = "ACTION")]
    action: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "READY")]
    ready: String,
    #[tabled(rename = "RETRIES")]
    retries: u32,
}

impl From<&ServiceReport> for ServiceRow {
    fn from(report: &ServiceReport) -> Self {
        let actions: Vec<&str> = report.decisions.iter().map(|d| d.action.as_str()).collect();
        Self {
            service: report.service.clone(),
            namespace: report.namespace.clone(),
            classification: report
                .classification()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            action: if actions.is_empty() {
                "-".into()
            } else {
                actions.join(" > ")
            },
            status: report.status.to_string(),
            ready: report
                .result
                .as_ref()
                .map(|r| r.final_ready_replicas.to_string())
                .unwrap_or_else(|| "-".into()),
            retries: report.retries_used(),
        }
    }
}

fn colored_status(status: ServiceStatus) -> ColoredString {
    match status {
        ServiceStatus::Converged | ServiceStatus::Skipped | ServiceStatus::Staged => status.as_str().green(),
        ServiceStatus::Planned => status.as_str().cyan(),
        ServiceStatus::Degraded => status.as_str().yellow(),
        ServiceStatus::Failed | ServiceStatus::NotAttempted => status.as_str().red(),
    }
}

/// Print a run report
pub fn print_report(report: &RunReport, format: OutputFormat) -> CliResult<()> {
    if !matches!(format, OutputFormat::Table) {
        return print_single(report, format);
    }

    if report.services.is_empty() {
        println!("{}", "No services configured".dimmed());
    } else {
        let rows: Vec<ServiceRow> = report.services.iter().map(ServiceRow::from).collect();
        println!("{}", Table::new(rows));
    }

    for service in &report.services {
        for decision in &service.decisions {
            println!("  {} {}: {}", "ℹ".blue(), service.service, decision.rationale);
        }
        if let Some(warning) = service.warning() {
            print_warning(&format!("{}: {}", service.service, warning));
        }
        if let Some(error) = &service.error {
            print_error(&format!("{} ({}): {}", service.service, colored_status(service.status), error));
        }
        if let Some(tail) = &service.log_tail {
            println!("{}", tail.dimmed());
        }
        if let Some(diagnostics) = &service.diagnostics {
            println!("{}", format!("--- {} logs ---", service.service).bold());
            println!("{}", diagnostics.log_tail);
            println!("{}", format!("--- {} pods ---", service.service).bold());
            println!("{}", diagnostics.pod_status);
            println!("{}", format!("--- {} events ---", service.service).bold());
            println!("{}", diagnostics.recent_events);
        }
    }

    if let Some(reason) = &report.aborted {
        print_error(&format!("Run aborted: {}", reason));
    }

    let summary = format!(
        "{} services: {} converged, {} skipped, {} staged, {} degraded, {} failed, {} not attempted",
        report.services.len(),
        report.count(ServiceStatus::Converged),
        report.count(ServiceStatus::Skipped),
        report.count(ServiceStatus::Staged),
        report.count(ServiceStatus::Degraded),
        report.count(ServiceStatus::Failed),
        report.count(ServiceStatus::NotAttempted),
    );
    if report.dry_run {
        print_info(&format!("Dry run, nothing executed. {}", summary));
    } else if report.is_success() {
        print_success(&summary);
    } else {
        print_error(&summary);
    }
    Ok(())
}

#[derive(Tabled, Serialize)]
struct PlanRow {
    #[tabled(rename = "ORDER")]
    order: usize,
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "CHART")]
    chart: String,
    #[tabled(rename = "DEPENDS ON")]
    depends_on: String,
}

/// Print the validated services in the order a run would converge them
pub fn print_order(ordered: &[&ServiceSpec], format: OutputFormat) -> CliResult<()> {
    let rows: Vec<PlanRow> = ordered
        .iter()
        .enumerate()
        .map(|(i, spec)| PlanRow {
            order: i + 1,
            service: spec.name.clone(),
            namespace: spec.namespace.clone(),
            chart: format!("{}@{}", spec.chart_ref, spec.chart_version),
            depends_on: spec.depends_on.join(","),
        })
        .collect();

    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No services configured".dimmed());
            } else {
                println!("{}", Table::new(rows));
            }
            print_success("Configuration is valid");
            Ok(())
        }
        _ => print_single(&rows, format),
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_types::{ActionKind, Decision, DriftClass};

    #[test]
    fn test_output_format_default() {
        assert!(matches!(OutputFormat::default(), OutputFormat::Table));
    }

    #[test]
    fn test_row_joins_structural_and_final_actions() {
        let mut report = ServiceReport::new("postgresql", "data", ServiceStatus::Skipped);
        report.decisions.push(Decision::new(
            DriftClass::OperationStuck,
            ActionKind::UnlockStuckOperation,
            "pending",
        ));
        report
            .decisions
            .push(Decision::new(DriftClass::HealthyMatching, ActionKind::Skip, "ok"));

        let row = ServiceRow::from(&report);
        assert_eq!(row.classification, "healthy-matching");
        assert_eq!(row.action, format!("{} > {}", ActionKind::UnlockStuckOperation, ActionKind::Skip));
        assert_eq!(row.ready, "-");
        assert_eq!(row.status, "skipped");
    }
}
