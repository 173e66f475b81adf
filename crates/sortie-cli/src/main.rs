mod client;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use client::{ApiClient, is_unreachable};
use sortie_api::{ApiState, StatusResponse};
use sortie_core::config::DaemonConfig;
use sortie_core::scheduler::{Scheduler, SchedulerSnapshot};
use sortie_core::task::{IssueNumber, Task};
use sortie_core::telemetry::{TelemetryConfig, init_telemetry};
use sortie_db::snapshot_store::SnapshotStore;
use sortie_runner::context::{DaemonContext, LoopSettings};
use sortie_runner::daemon::{self, Collaborators};
use sortie_runner::docker::{DockerRuntime, container_name};
use sortie_runner::once::{OnceOutcome, run_once};
use sortie_runner::runtime::{UnitHandle, UnitRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SORTIE_GIT_COMMIT"),
    env!("SORTIE_GIT_DIRTY"),
    ", built ",
    env!("SORTIE_BUILD_TIME"),
    ")"
);

#[derive(Parser)]
#[command(
    name = "sortie",
    version,
    long_version = LONG_VERSION,
    about = "Run tagged GitHub issues through ephemeral agent containers"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "sortie.toml", global = true)]
    config: PathBuf,

    /// Control API address (defaults to `api_bind` from the config).
    #[arg(long, env = "SORTIE_API", global = true)]
    api: Option<String>,

    /// Output JSON-structured logs to console.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground.
    Start {
        /// Fetch issues and log what would run, without containers or worktrees.
        #[arg(long)]
        dry_run: bool,
        /// Process every tagged issue once, sequentially, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Ask a running daemon to shut down gracefully.
    Stop,
    /// Show running, queued and recent tasks.
    Status,
    /// List tasks waiting for a slot.
    Queue,
    /// Stop starting new tasks. Running tasks continue.
    Pause,
    /// Start dispatching again after a pause.
    Resume,
    /// Print the output of an issue's container.
    Logs {
        /// Issue number, with or without a leading `#`.
        issue: IssueNumber,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets may live in a local .env file.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { dry_run, once } => {
            cmd_start(&cli.config, cli.json_logs, *dry_run, *once).await
        }
        Commands::Stop => {
            let resp = api_client(&cli)?.control("stop").await?;
            println!("{}", resp.message);
            Ok(())
        }
        Commands::Pause => {
            let resp = api_client(&cli)?.control("pause").await?;
            println!("{}", resp.message);
            Ok(())
        }
        Commands::Resume => {
            let resp = api_client(&cli)?.control("resume").await?;
            println!("{}", resp.message);
            Ok(())
        }
        Commands::Status => cmd_status(&cli).await,
        Commands::Queue => {
            let queued = api_client(&cli)?.queue().await?;
            if queued.is_empty() {
                println!("Queue is empty.");
            }
            for task in &queued {
                println!("{}", task_line(task));
            }
            Ok(())
        }
        Commands::Logs { issue } => cmd_logs(&cli, *issue).await,
    }
}

fn api_client(cli: &Cli) -> Result<ApiClient> {
    let addr = match &cli.api {
        Some(addr) => addr.clone(),
        None => DaemonConfig::load(&cli.config)?.api_bind,
    };
    ApiClient::new(&addr)
}

// ─── start ───────────────────────────────────────────────────────────────

async fn cmd_start(config_path: &Path, json_logs: bool, dry_run: bool, once: bool) -> Result<()> {
    let config = DaemonConfig::from_env(config_path)?;
    config.validate(dry_run).context("invalid configuration")?;

    let telemetry = TelemetryConfig {
        json_logs,
        log_file: config.log_file.clone(),
        ..TelemetryConfig::default()
    };
    let _telemetry_guard = init_telemetry(&telemetry)?;
    tracing::info!(
        repo = %config.github_repo,
        max_concurrent = config.max_concurrent,
        poll_interval_secs = config.poll_interval_secs,
        dry_run,
        once,
        "sortie starting"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let collaborators = Collaborators::from_config(&config, dry_run).await?;

    if once {
        let outcomes = run_once(&collaborators, &shutdown).await?;
        return report_once(&outcomes);
    }

    let db = Arc::new(sortie_db::open_db(&config.db_path)?);
    let scheduler = Arc::new(Scheduler::new(config.max_concurrent));
    let ctx = Arc::new(
        DaemonContext::new(
            Arc::clone(&scheduler),
            Arc::clone(&collaborators.runtime),
            collaborators.workspaces,
            collaborators.tracker,
            db,
            LoopSettings::from_config(&config),
        )
        .with_shutdown(shutdown.clone()),
    );

    let api_state = Arc::new(ApiState::new(
        scheduler,
        collaborators.runtime,
        shutdown.clone(),
    ));
    let bind = config.api_bind.clone();
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = sortie_api::serve_with_shutdown(api_state, &bind, api_shutdown.clone()).await {
            tracing::error!(error = %e, "control API failed, stopping daemon");
            api_shutdown.cancel();
        }
    });

    daemon::run(ctx).await?;
    if let Err(e) = api.await {
        tracing::error!(error = %e, "control API task panicked");
    }
    tracing::info!("sortie stopped");
    Ok(())
}

/// Ctrl-C and SIGTERM both cancel the shared shutdown token.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => tracing::info!("received SIGTERM, initiating graceful shutdown"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

fn report_once(outcomes: &[OnceOutcome]) -> Result<()> {
    if outcomes.is_empty() {
        println!("No tagged issues.");
        return Ok(());
    }
    for outcome in outcomes {
        println!("=== {} {} ===", outcome.id, outcome.title);
        if let Some(container) = &outcome.container_id {
            println!("container: {container}");
        }
        if let Some(path) = &outcome.worktree {
            println!("worktree:  {}", path.display());
        }
        match &outcome.error {
            None => println!("result:    ok"),
            Some(e) => println!("result:    failed: {e}"),
        }
        if !outcome.output_tail.is_empty() {
            println!("--- output (tail) ---\n{}", outcome.output_tail.trim_end());
        }
        println!();
    }
    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    if failed > 0 {
        bail!("{failed} of {} issues failed", outcomes.len());
    }
    Ok(())
}

// ─── status / logs ───────────────────────────────────────────────────────

async fn cmd_status(cli: &Cli) -> Result<()> {
    match api_client(cli)?.status().await {
        Ok(status) => {
            print_live_status(&status);
            Ok(())
        }
        Err(e) if is_unreachable(&e) => {
            println!("{e}; showing last saved state.\n");
            print_saved_status(&cli.config)
        }
        Err(e) => Err(e),
    }
}

fn print_live_status(status: &StatusResponse) {
    let q = &status.queue;
    println!("=== Sortie Status ===\n");
    println!("  {:<12} {}", "state", if q.paused { "paused" } else { "active" });
    println!("  {:<12} {}", "since", status.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  {:<12} {}/{}", "running", q.running, q.max_concurrent);
    println!("  {:<12} {}", "starting", q.starting);
    println!("  {:<12} {}", "queued", q.queued);
    print_tasks("Running", &status.running_tasks);
    print_tasks("Recent", &status.recent);
}

fn print_saved_status(config_path: &Path) -> Result<()> {
    let config = DaemonConfig::from_env(config_path)?;
    if !config.db_path.exists() {
        println!("No saved state at {}.", config.db_path.display());
        return Ok(());
    }
    let db = sortie_db::open_db(&config.db_path)?;
    let store = SnapshotStore::new(&db);
    let snapshot: SchedulerSnapshot = store.load()?.unwrap_or_default();
    if let Some(at) = store.saved_at()? {
        println!("  {:<12} {}", "saved", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  {:<12} {}", "paused", snapshot.paused);
    print_tasks("Running at last save", &snapshot.running);
    print_tasks("Queued at last save", &snapshot.queued);
    print_tasks("Completed", &snapshot.completed);
    Ok(())
}

fn print_tasks(heading: &str, tasks: &[Task]) {
    if tasks.is_empty() {
        return;
    }
    println!("\n{heading}:");
    for task in tasks {
        println!("{}", task_line(task));
    }
}

fn task_line(task: &Task) -> String {
    let mode = if task.implement { "implement" } else { "plan" };
    let mut line = format!(
        "  {:<6} {:<10} {:<9} {}",
        task.id.to_string(),
        task.status.label(),
        mode,
        task.title
    );
    if let Some(secs) = task.elapsed_secs() {
        line.push_str(&format!(" ({secs}s)"));
    }
    if let Some(e) = &task.error {
        line.push_str(&format!("\n         error: {e}"));
    }
    line
}

/// Ask the daemon first; fall back to the container directly, which also
/// covers containers kept by `start --once`.
async fn cmd_logs(cli: &Cli, issue: IssueNumber) -> Result<()> {
    match api_client(cli)?.logs(issue).await {
        Ok(Some(output)) => {
            print!("{output}");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) if is_unreachable(&e) => {}
        Err(e) => return Err(e),
    }

    let config = DaemonConfig::from_env(&cli.config)?;
    let docker = DockerRuntime::connect(config.container, config.secrets).await?;
    let unit = UnitHandle::new(container_name(issue));
    let output = docker
        .logs(&unit)
        .await
        .with_context(|| format!("no running task or container for issue {issue}"))?;
    print!("{output}");
    Ok(())
}
