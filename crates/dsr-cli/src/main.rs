//! dsr - Degraded-State Release orchestrator CLI
//!
//! The `dsr` command drives local fallback release builds when hosted
//! CI is unavailable or throttled.
//!
//! ## Commands
//!
//! - `build`: Run the full build matrix and assemble a manifest
//! - `plan`: Print the routing decision per target without building
//! - `analyze`: Summarize a workflow's jobs by runner family
//! - `validate`: Check a repository is in a releasable state
//!
//! Diagnostics go to stderr; stdout carries only JSON results, so the
//! output is safe to pipe into `jq`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, warn, Level};

use dsr_build::backend::Backend;
use dsr_build::executor::{BuildExecutor, ExecuteOptions};
use dsr_build::{ContainerizedBackend, NativeBackend};
use dsr_core::config::{EngineConfig, RemoteHost, RepoConfig};
use dsr_core::error::{DsrError, Result};
use dsr_core::router::CONTAINER_HOST;
use dsr_core::target::Target;
use dsr_core::{repo, router, workflow};

#[derive(Parser)]
#[command(name = "dsr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Degraded-State Release orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Engine flags shared by `build` and `plan`.
#[derive(clap::Args)]
struct EngineArgs {
    /// State directory for manifests, logs and artifacts
    #[arg(long, env = "DSR_STATE_DIR", default_value = ".dsr")]
    state_dir: PathBuf,

    /// Per-target build timeout in seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// SIGTERM-to-SIGKILL grace period in seconds
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,

    /// Prune run logs/artifacts older than this many days
    #[arg(long, default_value_t = 7)]
    retention_days: u64,

    /// Retry budget for transient backend failures
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// YAML file of remote hosts, merged over the built-in defaults
    #[arg(long)]
    hosts: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured build matrix and assemble a release manifest
    Build {
        /// Tool config file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Version to release (tag `v<version>` must exist)
        version: String,

        /// Build even if the working tree is dirty
        #[arg(long)]
        allow_dirty: bool,

        /// Accept act jobs on unrecognized runner labels
        #[arg(long)]
        allow_unknown_runners: bool,

        /// Restrict the run to these targets (repeatable, `os/arch`)
        #[arg(short, long)]
        target: Vec<Target>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print the per-target routing decision without building
    Plan {
        /// Tool config file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Version the plan is for
        version: String,

        /// Plan against a dirty working tree
        #[arg(long)]
        allow_dirty: bool,

        /// Accept act jobs on unrecognized runner labels
        #[arg(long)]
        allow_unknown_runners: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Summarize a workflow's jobs by runner family
    Analyze {
        /// Workflow file (YAML)
        workflow: PathBuf,
    },

    /// Check a repository is in a releasable state
    Validate {
        /// Repository path
        repo: PathBuf,

        /// Version whose tag must exist
        version: String,

        /// Accept a dirty working tree
        #[arg(long)]
        allow_dirty: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    dsr_core::telemetry::init_tracing(cli.json, level);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            config,
            version,
            allow_dirty,
            allow_unknown_runners,
            target,
            engine,
        } => {
            let opts = ExecuteOptions {
                allow_dirty,
                allow_unknown_runners,
                targets: if target.is_empty() { None } else { Some(target) },
            };
            cmd_build(&config, &version, opts, &engine).await
        }
        Commands::Plan {
            config,
            version,
            allow_dirty,
            allow_unknown_runners,
            engine,
        } => {
            let opts = ExecuteOptions {
                allow_dirty,
                allow_unknown_runners,
                targets: None,
            };
            cmd_plan(&config, &version, opts, &engine)
        }
        Commands::Analyze { workflow } => cmd_analyze(&workflow),
        Commands::Validate {
            repo,
            version,
            allow_dirty,
        } => cmd_validate(&repo, &version, allow_dirty),
    }
}

/// Build the engine config from CLI flags plus an optional hosts file.
fn engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut engine = EngineConfig::new(&args.state_dir);
    engine.build_timeout = std::time::Duration::from_secs(args.timeout_secs);
    engine.grace_period = std::time::Duration::from_secs(args.grace_secs);
    engine.retention_days = args.retention_days;
    engine.max_retries = args.max_retries;

    if let Some(path) = &args.hosts {
        if !path.exists() {
            return Err(DsrError::InvalidArgs(format!(
                "hosts file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let hosts: BTreeMap<String, RemoteHost> = serde_yaml::from_str(&text)?;
        engine.remote_hosts.extend(hosts);
    }
    Ok(engine)
}

/// Wire the real backends for every host the matrix can route to.
fn default_backends(
    engine: &EngineConfig,
    config: &RepoConfig,
) -> Result<BTreeMap<String, Arc<dyn Backend>>> {
    let mut backends: BTreeMap<String, Arc<dyn Backend>> = BTreeMap::new();
    backends.insert(
        CONTAINER_HOST.to_string(),
        Arc::new(ContainerizedBackend::new(config.workflow.clone())),
    );
    for strategy in router::build_matrix(config)? {
        if strategy.host == CONTAINER_HOST || backends.contains_key(&strategy.host) {
            continue;
        }
        let host = engine.remote_host(&strategy.host)?.clone();
        backends.insert(strategy.host.clone(), Arc::new(NativeBackend::new(host)));
    }
    Ok(backends)
}

/// Shutdown channel fed by ctrl-c.
///
/// The sender is parked in the signal task so the channel stays open
/// for the whole run.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping in-flight builds");
            let _ = tx.send(true);
        }
        std::future::pending::<()>().await;
    });
    rx
}

async fn cmd_build(
    config: &PathBuf,
    version: &str,
    opts: ExecuteOptions,
    engine_args: &EngineArgs,
) -> Result<()> {
    let config = RepoConfig::from_yaml_file(config)?;
    let engine = engine_config(engine_args)?;
    let backends = default_backends(&engine, &config)?;
    let executor = BuildExecutor::new(engine, config, backends);

    let outcome = executor
        .execute(version, &opts, shutdown_channel())
        .await?;

    for result in &outcome.results {
        println!("{}", serde_json::to_string(result)?);
    }
    println!(
        "{}",
        serde_json::to_string(&json!({
            "run_id": outcome.run_id,
            "manifest": outcome.manifest_path,
        }))?
    );

    outcome.verdict()
}

fn cmd_plan(
    config: &PathBuf,
    version: &str,
    opts: ExecuteOptions,
    engine_args: &EngineArgs,
) -> Result<()> {
    let config = RepoConfig::from_yaml_file(config)?;
    let engine = engine_config(engine_args)?;
    let backends = default_backends(&engine, &config)?;
    let executor = BuildExecutor::new(engine, config, backends);

    let (repo_state, matrix) = executor.plan(version, &opts)?;
    let plan = json!({
        "version": version,
        "git_sha": repo_state.git_sha,
        "git_ref": repo_state.resolved_ref,
        "strategies": matrix,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn cmd_analyze(path: &PathBuf) -> Result<()> {
    let analysis = workflow::analyze(path)?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn cmd_validate(repo: &PathBuf, version: &str, allow_dirty: bool) -> Result<()> {
    match repo::validate_for_build(repo, version, allow_dirty) {
        Ok(state) => {
            let report = json!({
                "valid": true,
                "state": state,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(issues) => {
            let report = json!({
                "valid": false,
                "issues": issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Err(DsrError::Validation(issues))
        }
    }
}
