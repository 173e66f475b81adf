//! One watchdog per running unit.
//!
//! Waits for the container to exit, records the outcome, then tears down
//! the container and the worktree. Teardown failures are logged only.
//! The issue stays off the queue until teardown has finished.

use crate::context::DaemonContext;
use crate::runtime::UnitHandle;
use crate::subprocess::tail_chars;
use sortie_core::task::IssueNumber;
use std::path::PathBuf;
use std::sync::Arc;

/// How much unit output to log when a unit fails.
pub const LOG_TAIL_CHARS: usize = 2000;

/// Start watching `unit`. The task is tracked by `ctx.watchdogs`.
pub fn spawn(
    ctx: &Arc<DaemonContext>,
    id: IssueNumber,
    unit: UnitHandle,
    worktree: PathBuf,
) -> tokio::task::JoinHandle<()> {
    let watched = Arc::clone(ctx);
    ctx.watchdogs
        .spawn(async move { watch(&watched, id, unit, worktree).await })
}

/// Error text for a unit's exit code, `None` on success.
pub fn exit_error(code: i64) -> Option<String> {
    (code != 0).then(|| format!("unit exited with code {code}"))
}

pub async fn watch(ctx: &DaemonContext, id: IssueNumber, unit: UnitHandle, worktree: PathBuf) {
    tracing::debug!(issue = %id, unit = %unit, "watchdog started");

    let error = match ctx.runtime.wait(&unit).await {
        Ok(code) => {
            let error = exit_error(code);
            if error.is_some() {
                log_output_tail(ctx, id, &unit).await;
            }
            error
        }
        Err(e) => {
            tracing::error!(issue = %id, unit = %unit, error = %e, "lost track of unit");
            Some(format!("{e:#}"))
        }
    };

    // The issue cannot be queued again until its worktree is gone.
    ctx.scheduler
        .mark_completed_pending_cleanup(id, error.as_deref());

    if let Err(e) = ctx.runtime.remove(&unit).await {
        tracing::warn!(issue = %id, unit = %unit, error = %e, "failed to remove container");
    }
    if let Err(e) = ctx.workspaces.release(id, &worktree).await {
        tracing::warn!(issue = %id, worktree = %worktree.display(), error = %e, "failed to release worktree");
    }
    ctx.scheduler.cleanup_done(id);
}

async fn log_output_tail(ctx: &DaemonContext, id: IssueNumber, unit: &UnitHandle) {
    match ctx.runtime.logs(unit).await {
        Ok(output) => tracing::warn!(
            issue = %id,
            unit = %unit,
            output = tail_chars(&output, LOG_TAIL_CHARS),
            "unit output tail"
        ),
        Err(e) => tracing::debug!(issue = %id, error = %e, "could not read unit output"),
    }
}
