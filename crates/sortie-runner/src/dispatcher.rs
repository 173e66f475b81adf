//! Admission loop: turns pending tasks into running units.
//!
//! For each admitted task the dispatcher acquires a worktree, launches a
//! container bound to it, marks the task running and hands it to a
//! watchdog. A failure before launch finalizes the task as failed without
//! ever entering the running set, and undoes whatever was acquired.

use crate::context::DaemonContext;
use crate::runtime::{UnitHandle, UnitSpec};
use crate::watchdog;
use sortie_core::prompt::instructions_for;
use sortie_core::task::Task;
use std::path::PathBuf;
use std::sync::Arc;

/// Why a task never reached the running state.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("workspace setup failed: {0:#}")]
    Workspace(anyhow::Error),
    #[error("container launch failed: {0:#}")]
    Launch(anyhow::Error),
}

/// Run the dispatch loop until shutdown.
pub async fn run(ctx: Arc<DaemonContext>) {
    tracing::info!(
        max_concurrent = ctx.scheduler.max_concurrent(),
        runtime = ctx.runtime.name(),
        "dispatcher started"
    );

    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        match ctx.scheduler.next_admissible() {
            Some(task) => {
                // Failures are already recorded on the task.
                let _ = dispatch(&ctx, task).await;
            }
            None => {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.settings.dispatch_interval) => {}
                }
            }
        }
    }

    tracing::info!("dispatcher stopped");
}

/// Set up and start one admitted task.
pub async fn dispatch(ctx: &Arc<DaemonContext>, task: Task) -> Result<UnitHandle, SetupError> {
    let id = task.id;
    tracing::info!(issue = %id, implement = task.implement, "dispatching task");

    match setup(ctx, &task).await {
        Ok((unit, worktree)) => {
            ctx.scheduler
                .mark_running(task, unit.id.clone(), worktree.clone());
            watchdog::spawn(ctx, id, unit.clone(), worktree);
            Ok(unit)
        }
        Err(e) => {
            tracing::error!(issue = %id, error = %e, "task setup failed");
            ctx.scheduler.finalize_unstarted(task, &e.to_string());
            Err(e)
        }
    }
}

async fn setup(ctx: &DaemonContext, task: &Task) -> Result<(UnitHandle, PathBuf), SetupError> {
    let worktree = ctx
        .workspaces
        .acquire(task.id)
        .await
        .map_err(SetupError::Workspace)?;

    let spec = UnitSpec {
        issue: task.id,
        workspace: worktree.clone(),
        instructions: instructions_for(task),
    };

    match ctx.runtime.launch(&spec).await {
        Ok(unit) => Ok((unit, worktree)),
        Err(e) => {
            if let Err(release) = ctx.workspaces.release(task.id, &worktree).await {
                tracing::warn!(issue = %task.id, error = %release, "failed to release worktree after launch failure");
            }
            Err(SetupError::Launch(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_messages_carry_cause_chain() {
        let cause = anyhow::anyhow!("exit 128").context("git worktree add failed");
        let e = SetupError::Workspace(cause);
        assert_eq!(
            e.to_string(),
            "workspace setup failed: git worktree add failed: exit 128"
        );

        let e = SetupError::Launch(anyhow::anyhow!("no such image"));
        assert_eq!(e.to_string(), "container launch failed: no such image");
    }
}
