//! Daemon lifecycle: restore, run the loops, shut down gracefully.

use crate::context::DaemonContext;
use crate::docker::DockerRuntime;
use crate::repo::BaseRepo;
use crate::runtime::{DryRunRuntime, UnitRuntime};
use crate::tracker::{GhTracker, Tracker};
use crate::workspace::{DryRunWorkspaces, GitWorktrees, WorkspaceManager};
use crate::{discovery, dispatcher};
use anyhow::Result;
use sortie_core::config::DaemonConfig;
use sortie_core::scheduler::Scheduler;
use sortie_db::snapshot_store::SnapshotStore;
use std::sync::Arc;
use tokio::task::JoinSet;

/// The three external collaborators.
pub struct Collaborators {
    pub runtime: Arc<dyn UnitRuntime>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub tracker: Arc<dyn Tracker>,
}

impl Collaborators {
    /// Real Docker and git collaborators, or logging stand-ins for a dry run.
    ///
    /// The tracker is real in both cases.
    pub async fn from_config(config: &DaemonConfig, dry_run: bool) -> Result<Self> {
        let tracker: Arc<dyn Tracker> = Arc::new(GhTracker::new(
            config.github_repo.clone(),
            config.label.clone(),
            config.implement_label.clone(),
        ));

        if dry_run {
            tracing::info!("dry run: no containers or worktrees will be created");
            return Ok(Self {
                runtime: Arc::new(DryRunRuntime::new()),
                workspaces: Arc::new(DryRunWorkspaces::new(config.worktree_base.clone())),
                tracker,
            });
        }

        let docker = DockerRuntime::connect(config.container.clone(), config.secrets.clone()).await?;
        match docker.image_exists().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                image = %config.container.image,
                "container image not found locally, launches will fail until it is built or pulled"
            ),
            Err(e) => tracing::warn!(error = %e, "could not check container image"),
        }

        let repo = BaseRepo::from_config(config)?;
        Ok(Self {
            runtime: Arc::new(docker),
            workspaces: Arc::new(GitWorktrees::new(repo, config.worktree_base.clone())),
            tracker,
        })
    }
}

/// Apply the persisted snapshot, if any. An unreadable snapshot is
/// logged and ignored.
pub fn restore_snapshot(scheduler: &Scheduler, db: &redb::Database) {
    match SnapshotStore::new(db).load() {
        Ok(Some(snapshot)) => scheduler.restore(snapshot),
        Ok(None) => tracing::info!("no saved state, starting fresh"),
        Err(e) => tracing::warn!(error = %e, "failed to load saved state, starting fresh"),
    }
}

/// Persist the current scheduler state. Failures are logged.
pub fn save_snapshot(ctx: &DaemonContext) -> bool {
    match SnapshotStore::new(&ctx.db).save(&ctx.scheduler.snapshot()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "failed to save state snapshot");
            false
        }
    }
}

async fn snapshot_loop(ctx: Arc<DaemonContext>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(ctx.settings.snapshot_interval) => {
                save_snapshot(&ctx);
            }
        }
    }
}

/// Run until `ctx.shutdown` is cancelled, then drain and save state.
pub async fn run(ctx: Arc<DaemonContext>) -> Result<()> {
    restore_snapshot(&ctx.scheduler, &ctx.db);

    let mut loops = JoinSet::new();
    loops.spawn(discovery::run(Arc::clone(&ctx)));
    loops.spawn(dispatcher::run(Arc::clone(&ctx)));
    loops.spawn(snapshot_loop(Arc::clone(&ctx)));

    tracing::info!(
        max_concurrent = ctx.scheduler.max_concurrent(),
        runtime = ctx.runtime.name(),
        "daemon started"
    );

    ctx.shutdown.cancelled().await;
    shutdown(&ctx, loops).await;
    Ok(())
}

async fn shutdown(ctx: &DaemonContext, mut loops: JoinSet<()>) {
    let grace = ctx.settings.shutdown_grace;
    tracing::info!(grace_secs = grace.as_secs_f64(), "shutting down");

    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "daemon loop panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = loops.len(), "loops did not stop in time, aborting");
        loops.abort_all();
    }

    ctx.watchdogs.close();
    if tokio::time::timeout(grace, ctx.watchdogs.wait()).await.is_err() {
        let orphaned: Vec<String> = ctx
            .scheduler
            .running_tasks()
            .into_iter()
            .filter_map(|t| t.container_id)
            .collect();
        tracing::warn!(
            watchdogs = ctx.watchdogs.len(),
            ?orphaned,
            "abandoning running containers"
        );
    }

    if save_snapshot(ctx) {
        tracing::info!("final state saved");
    }
    tracing::info!("daemon stopped");
}
