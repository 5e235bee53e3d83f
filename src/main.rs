//! devcheck
//!
//! Runs every configured (or discovered) Python sub-project in its own
//! virtual environment, builds and runs the CMake project, and writes a
//! report under `.devcheck/`. Exits non-zero when any check failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devcheck::cleanup::clean_workspace;
use devcheck::config::{HarnessConfig, DEFAULT_CONFIG_FILE};
use devcheck::exec::{Executor, ProcessExecutor};
use devcheck::host::HostInfo;
use devcheck::native::NativeBuildOrchestrator;
use devcheck::report::{self, RunConfig};
use devcheck::result::ResultAggregator;
use devcheck::runner::ConcurrentRunner;
use devcheck::toolchain::ToolchainResolver;
use devcheck::venv::EnvironmentManager;

#[derive(Parser, Debug)]
#[command(name = "devcheck", version)]
#[command(about = "Local health checks for Python sub-projects and a CMake-built program")]
struct Args {
    /// Path to the config JSON, relative to the root unless absolute
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Repository root directory
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Enable debug logging (overrides --log-level and RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run Python projects in parallel
    #[arg(long)]
    parallel: bool,

    /// Maximum parallel workers
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Timeout in seconds for the native build and cap for project timeouts
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Remove build output and cached environments before running
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the summary
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Invalid root directory {}", args.root.display()))?;
    info!(root = %root.display(), "Running devcheck");

    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        root.join(&args.config)
    };
    let mut config = HarnessConfig::load_or_default(&config_path);
    config.projects = config.resolved_projects(&root);
    config.apply_timeout_cap(args.timeout);

    let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::new());

    if args.clean {
        let cleaned = clean_workspace(&root, &config.native, &config.projects).await;
        info!(
            removed = cleaned.removed.len(),
            failed = cleaned.failed.len(),
            "Workspace cleaned"
        );
    }

    let mut aggregator = ResultAggregator::new(HostInfo::detect());

    if config.projects.is_empty() {
        info!("No Python projects found");
    } else {
        let workers = if args.parallel { args.max_workers } else { 1 };
        info!(
            projects = config.projects.len(),
            workers, "Checking Python projects"
        );
        let manager = Arc::new(EnvironmentManager::new(&root, Arc::clone(&executor)));
        let runner = ConcurrentRunner::new(manager, Arc::clone(&executor), workers);
        aggregator.extend(runner.run_all(config.projects.clone()).await);
    }

    let resolver = ToolchainResolver::new(&root, Arc::clone(&executor));
    let orchestrator = NativeBuildOrchestrator::new(&root, resolver, executor);
    aggregator.record_native(orchestrator.run(&config.native).await);

    let session = aggregator.finalize();
    println!("{}", report::render_summary(&session));

    let run_config = RunConfig {
        root: root.clone(),
        parallel: args.parallel,
        max_workers: args.max_workers,
        timeout_seconds: args.timeout,
        clean: args.clean,
    };
    match report::write_json(&root, &session, &run_config) {
        Ok(path) => info!(path = %path.display(), "JSON report written"),
        Err(e) => error!(error = %format!("{e:#}"), "Failed to write JSON report"),
    }

    Ok(if session.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
