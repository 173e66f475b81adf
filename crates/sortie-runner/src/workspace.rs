//! Per-issue git worktrees.
//!
//! Each issue gets `<base>/issue-<N>` on branch `issue-<N>`, cut from the
//! freshly refreshed default branch of the base repository.

use crate::repo::{BaseRepo, git, git_ok};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sortie_core::task::IssueNumber;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Workspace manager contract. `release` is idempotent.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Create a fresh workspace for `issue` and return its path.
    async fn acquire(&self, issue: IssueNumber) -> Result<PathBuf>;

    async fn release(&self, issue: IssueNumber, path: &Path) -> Result<()>;
}

/// Branch (and directory) name for an issue.
pub fn branch_name(issue: IssueNumber) -> String {
    format!("issue-{}", issue.0)
}

pub struct GitWorktrees {
    repo: BaseRepo,
    base_dir: PathBuf,
    // Serializes git operations on the shared base repository.
    lock: Mutex<()>,
}

impl GitWorktrees {
    pub fn new(repo: BaseRepo, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, issue: IssueNumber) -> PathBuf {
        self.base_dir.join(branch_name(issue))
    }

    /// Remove a worktree directory, falling back to deleting it outright.
    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let target = path.to_string_lossy().to_string();
        if let Err(e) = git(self.repo.path(), &["worktree", "remove", "--force", &target]).await {
            tracing::warn!(worktree = %path.display(), error = %e, "git worktree remove failed, deleting directory");
            if path.exists() {
                std::fs::remove_dir_all(path)
                    .context(format!("failed to delete worktree dir: {}", path.display()))?;
            }
        }
        git_ok(self.repo.path(), &["worktree", "prune"]).await;
        Ok(())
    }
}

#[async_trait]
impl WorkspaceManager for GitWorktrees {
    async fn acquire(&self, issue: IssueNumber) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;

        let start_point = self
            .repo
            .refresh()
            .await
            .context("failed to refresh base repository")?;

        let branch = branch_name(issue);
        let path = self.path_for(issue);

        // Leftovers from an earlier run of the same issue.
        if path.exists() {
            self.remove_worktree(&path).await?;
        }
        git_ok(self.repo.path(), &["worktree", "prune"]).await;
        if git_ok(self.repo.path(), &["branch", "-D", &branch]).await {
            tracing::debug!(branch = %branch, "deleted stale local branch");
        }

        std::fs::create_dir_all(&self.base_dir).context(format!(
            "failed to create worktree base directory: {}",
            self.base_dir.display()
        ))?;

        let target = path.to_string_lossy().to_string();
        git(
            self.repo.path(),
            &["worktree", "add", "-b", &branch, &target, &start_point],
        )
        .await
        .context("git worktree add failed")?;

        tracing::info!(
            issue = %issue,
            worktree = %path.display(),
            branch = %branch,
            from = %start_point,
            "created git worktree"
        );
        Ok(path)
    }

    async fn release(&self, issue: IssueNumber, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !path.exists() {
            git_ok(self.repo.path(), &["worktree", "prune"]).await;
            return Ok(());
        }
        self.remove_worktree(path).await?;
        tracing::info!(issue = %issue, worktree = %path.display(), "removed git worktree");
        Ok(())
    }
}

/// Workspace manager that touches nothing on disk.
pub struct DryRunWorkspaces {
    base_dir: PathBuf,
}

impl DryRunWorkspaces {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl WorkspaceManager for DryRunWorkspaces {
    async fn acquire(&self, issue: IssueNumber) -> Result<PathBuf> {
        let path = self.base_dir.join(branch_name(issue));
        tracing::info!(issue = %issue, worktree = %path.display(), "[dry-run] would create git worktree");
        Ok(path)
    }

    async fn release(&self, issue: IssueNumber, path: &Path) -> Result<()> {
        tracing::info!(issue = %issue, worktree = %path.display(), "[dry-run] would remove git worktree");
        Ok(())
    }
}
