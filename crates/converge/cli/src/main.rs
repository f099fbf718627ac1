//! convergectl - One-shot convergence of stateful services
//!
//! Meant to run as a pipeline step after image builds. Each invocation
//! probes every configured service, decides once whether to skip, patch
//! credentials, upgrade or reinstall it, executes that decision and
//! verifies the result.
//!
//! Exit codes: 0 when every service converged or was skipped, 2 when the
//! only problem is a workload that did not become ready, 1 otherwise.

use clap::{Args, Parser, Subcommand};
use converge_engine::{dependency_order, Reconciler, RunFlags, RunOptions};
use converge_platform::{HelmCli, KubeApi, ProcessRunner};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod output;

use config::CliConfig;
use error::CliResult;
use output::OutputFormat;

/// convergectl CLI application
#[derive(Parser)]
#[command(name = "convergectl")]
#[command(about = "Converge stateful services on Kubernetes via Helm", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONVERGE_CONFIG")]
    config: Option<String>,

    /// Output format (table, json, yaml)
    #[arg(short, long, default_value = "table")]
    output: OutputFormat,

    /// Log level, overriding the configuration file
    #[arg(long, env = "CONVERGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CONVERGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Converge the configured services
    Converge(RunArgs),

    /// Show what a converge would do without changing anything
    Plan(RunArgs),

    /// Check the configuration and print the convergence order
    Validate,
}

#[derive(Args)]
struct RunArgs {
    /// Only converge this service (repeatable)
    #[arg(short, long = "service")]
    services: Vec<String>,

    /// Allow deleting leftover workloads and volume claims of absent releases
    #[arg(long)]
    cleanup: bool,

    /// Upgrade unready releases even when credentials match
    #[arg(long)]
    force_install: bool,

    /// Plan only, execute nothing
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn options(&self, dry_run: bool) -> RunOptions {
        RunOptions {
            flags: RunFlags {
                cleanup: self.cleanup,
                force_install: self.force_install,
            },
            dry_run: dry_run || self.dry_run,
            services: self.services.clone(),
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    // stdout carries the report
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn reconciler(config: &CliConfig) -> Reconciler {
    let query_timeout = config.engine.probe_timeout();

    let helm = HelmCli::new(Arc::new(ProcessRunner::new()), config.platform.helm_bin.clone())
        .with_kube_context(config.platform.kube_context.clone())
        .with_query_timeout(query_timeout);
    // deletes wait out finalizers, so they get the release deadline
    let cluster = KubeApi::new()
        .with_context(config.platform.kube_context.clone())
        .with_request_timeout(query_timeout)
        .with_delete_timeout(config.engine.converge_timeout());

    Reconciler::new(
        Arc::new(helm),
        Arc::new(cluster),
        config.engine.clone(),
        config.credentials.clone(),
    )
}

async fn run(cli: Cli, config: CliConfig) -> CliResult<u8> {
    let (args, dry_run) = match cli.command {
        Commands::Validate => {
            let ordered = dependency_order(&config.services)
                .map_err(|e| error::CliError::Config(e.to_string()))?;
            // credentials resolve without touching the platform
            reconciler(&config).prepare(&config.services, &RunOptions::default())?;
            output::print_order(&ordered, cli.output)?;
            return Ok(0);
        }
        Commands::Converge(args) => (args, false),
        Commands::Plan(args) => (args, true),
    };

    if config.services.is_empty() {
        output::print_warning("No services configured");
        return Ok(0);
    }
    execute(&config, args.options(dry_run), cli.output).await
}

async fn execute(config: &CliConfig, options: RunOptions, format: OutputFormat) -> CliResult<u8> {
    let reconciler = reconciler(config);

    let cancel = reconciler.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = reconciler.run(&config.services, &options).await?;
    output::print_report(&report, format)?;

    let code = report.exit_code();
    info!(run_id = %report.run_id, exit_code = code, "Done");
    Ok(u8::try_from(code).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match CliConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            output::print_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.log_json || config.logging.json);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            output::print_error(&format!("Failed to start runtime: {}", e));
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            output::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
