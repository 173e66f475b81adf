//! One-shot mode: process every tagged issue once, sequentially.
//!
//! Nothing is queued or persisted. Containers and worktrees are left in
//! place so the results can be inspected.

use crate::daemon::Collaborators;
use crate::runtime::UnitSpec;
use crate::subprocess::tail_chars;
use crate::watchdog::{LOG_TAIL_CHARS, exit_error};
use anyhow::{Context, Result};
use sortie_core::prompt::instructions_for;
use sortie_core::task::{IssueNumber, Task};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// What happened to one issue.
#[derive(Debug, Clone)]
pub struct OnceOutcome {
    pub id: IssueNumber,
    pub title: String,
    pub container_id: Option<String>,
    pub worktree: Option<PathBuf>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub output_tail: String,
}

impl OnceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Run each tagged issue to completion, one at a time.
pub async fn run_once(
    collaborators: &Collaborators,
    shutdown: &CancellationToken,
) -> Result<Vec<OnceOutcome>> {
    let items = collaborators
        .tracker
        .list_tagged_open_items()
        .await
        .context("failed to fetch tagged issues")?;
    tracing::info!(count = items.len(), "processing tagged issues once");

    let mut outcomes = Vec::with_capacity(items.len());
    for item in &items {
        if shutdown.is_cancelled() {
            tracing::info!("interrupted, skipping remaining issues");
            break;
        }
        let task = Task::from_item(item);
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = run_one(collaborators, &task) => outcome,
        };
        match &outcome.error {
            None => tracing::info!(issue = %task.id, "issue processed"),
            Some(e) => tracing::error!(issue = %task.id, error = %e, "issue failed"),
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

async fn run_one(collaborators: &Collaborators, task: &Task) -> OnceOutcome {
    let mut outcome = OnceOutcome {
        id: task.id,
        title: task.title.clone(),
        container_id: None,
        worktree: None,
        exit_code: None,
        error: None,
        output_tail: String::new(),
    };

    let worktree = match collaborators.workspaces.acquire(task.id).await {
        Ok(path) => path,
        Err(e) => {
            outcome.error = Some(format!("workspace setup failed: {e:#}"));
            return outcome;
        }
    };
    outcome.worktree = Some(worktree.clone());

    let spec = UnitSpec {
        issue: task.id,
        workspace: worktree,
        instructions: instructions_for(task),
    };
    let unit = match collaborators.runtime.launch(&spec).await {
        Ok(unit) => unit,
        Err(e) => {
            outcome.error = Some(format!("container launch failed: {e:#}"));
            return outcome;
        }
    };
    outcome.container_id = Some(unit.id.clone());

    match collaborators.runtime.wait(&unit).await {
        Ok(code) => {
            outcome.exit_code = Some(code);
            outcome.error = exit_error(code);
        }
        Err(e) => outcome.error = Some(format!("{e:#}")),
    }

    match collaborators.runtime.logs(&unit).await {
        Ok(output) => outcome.output_tail = tail_chars(&output, LOG_TAIL_CHARS).to_string(),
        Err(e) => tracing::debug!(issue = %task.id, error = %e, "could not read unit output"),
    }
    outcome
}
