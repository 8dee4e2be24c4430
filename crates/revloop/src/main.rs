//! revloop - automated review → fix → validate loop over a branch.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::{Result, WrapErr};
use revloop::runner::{ProcessRunner, RunnerConfig};
use revloop::{git, LoopController, LoopSettings, RunOutcome, WorkspaceManager};
use revloop_core::config::ConfigError;
use revloop_core::{Config, ReportStore};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Review a branch with coding agents until a validator approves it.
#[derive(Parser)]
#[command(name = "revloop")]
#[command(about = "Review, fix and validate a branch with coding agents")]
#[command(version)]
struct Cli {
    /// Branch or revision to review
    target: String,

    /// Maximum review/fix/validate iterations (default: 3)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Per-agent timeout in minutes (default: 10)
    #[arg(long, value_name = "MINUTES")]
    timeout: Option<u64>,

    /// Prompts longer than this many characters go through a temp file (default: 8000)
    #[arg(long, value_name = "CHARS")]
    prompt_threshold: Option<usize>,

    /// Base repository
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Branch the changes are compared against (default: main)
    #[arg(long)]
    base_branch: Option<String>,

    /// Review only the target's last commit instead of everything since the base branch
    #[arg(long)]
    latest: bool,

    /// Config file path (overrides .revloop/config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory that holds run artifacts (default: tmp/revloop)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Agent CLI to invoke
    #[arg(long, env = "REVLOOP_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Keep workspaces of failed stages on disk
    #[arg(long)]
    retain_workspaces: bool,

    /// Run a finalizer agent before writing the summary
    #[arg(long)]
    finalize_agent: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let repo = git::repo_root(&cli.repo).unwrap_or_else(|_| cli.repo.clone());
    let config = match load_config(&cli, &repo) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(revloop::EXIT_USAGE);
        }
    };

    let code = match execute(&cli, config, repo) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:?}");
            revloop::EXIT_INTERNAL
        }
    };
    std::process::exit(code);
}

/// Defaults < repo config < `--config` < flags.
fn load_config(cli: &Cli, repo: &Path) -> std::result::Result<Config, ConfigError> {
    let mut config = Config::default();
    config.load_repo_file(repo)?;
    if let Some(path) = &cli.config {
        config.load_file(path)?;
    }

    if let Some(max) = cli.max_iterations {
        config.max_iterations = max;
    }
    if let Some(minutes) = cli.timeout {
        config.agent_timeout_sec = minutes.saturating_mul(60);
    }
    if let Some(threshold) = cli.prompt_threshold {
        config.prompt_threshold = threshold;
    }
    if let Some(branch) = &cli.base_branch {
        config.base_branch.clone_from(branch);
    }
    if let Some(dir) = &cli.output_dir {
        config.runs_dir.clone_from(dir);
    }
    if let Some(bin) = &cli.agent_bin {
        config.agent_bin.clone_from(bin);
    }
    if cli.latest {
        config.latest = true;
    }
    if cli.retain_workspaces {
        config.retain_failed_workspaces = true;
    }
    if cli.finalize_agent {
        config.finalize_agent = true;
    }

    config.validate()?;
    config.resolve_paths(repo);
    Ok(config)
}

fn execute(cli: &Cli, config: Config, repo: PathBuf) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        tokio::spawn(cancel_on_signal(cancel.clone()));

        let controller = LoopController::new(
            LoopSettings::from_config(&config, repo, cli.target.clone()),
            ProcessRunner::new(RunnerConfig::from_config(&config)),
            WorkspaceManager::new(&config.workspaces_dir),
            ReportStore::new(&config.runs_dir),
        );
        let outcome = controller.run(&cancel).await.wrap_err("review loop failed")?;
        print_outcome(&outcome);
        Ok(outcome.exit_code())
    })
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            warn!("failed to register signal handlers");
            return;
        };
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, cancelling run"),
            _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to register signal handler");
            return;
        }
        info!("received SIGINT, cancelling run");
    }

    cancel.cancel();
}

fn print_outcome(outcome: &RunOutcome) {
    println!("status: {}", outcome.run.status.as_str());
    if let Some(reason) = &outcome.run.reason {
        println!("reason: {reason}");
    }
    println!(
        "iterations: {}/{}",
        outcome.run.current_iteration, outcome.run.max_iterations
    );
    println!("artifacts: {}", outcome.run_dir().display());
    match outcome.last_verdict() {
        Some(verdict) => println!("verdict: {verdict}"),
        None => println!("verdict: none"),
    }
    if let Some(branch) = &outcome.result_branch {
        println!("result branch: {branch}");
    }
    for path in &outcome.retained_workspaces {
        println!("retained workspace: {}", path.display());
    }
}
