//! The base repository that issue worktrees are cut from.

use crate::subprocess::{run_cmd, run_cmd_stdout};
use anyhow::{Context, Result};
use sortie_core::config::DaemonConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single git invocation (clone and fetch included).
pub const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Run git in `cwd`, returning trimmed stdout.
pub(crate) async fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    run_cmd_stdout("git", args, cwd, GIT_TIMEOUT)
        .await
        .map(|s| s.trim().to_string())
}

/// Run git in `cwd`, reporting only whether it succeeded.
pub(crate) async fn git_ok(cwd: &Path, args: &[&str]) -> bool {
    matches!(run_cmd("git", args, cwd, GIT_TIMEOUT).await, Ok(out) if out.success())
}

/// Insert a token into an HTTPS remote URL.
///
/// Non-HTTPS URLs and URLs that already carry credentials come back unchanged.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (token, url.strip_prefix("https://")) {
        (Some(token), Some(rest)) if !rest.contains('@') => {
            format!("https://x-access-token:{token}@{rest}")
        }
        _ => url.to_string(),
    }
}

/// Directory name for a cached clone of `owner/name`.
pub fn cache_dir_name(github_repo: &str) -> String {
    github_repo.replace('/', "-")
}

pub struct BaseRepo {
    path: PathBuf,
    remote_url: Option<String>,
    token: Option<String>,
}

impl BaseRepo {
    pub fn new(path: impl Into<PathBuf>, remote_url: Option<String>, token: Option<String>) -> Self {
        Self {
            path: path.into(),
            remote_url,
            token,
        }
    }

    /// Local clone from `repo_path`, or a cached clone of `repo_url`.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let token = config.secrets.github_token.clone();
        match (&config.repo_path, &config.repo_url) {
            (Some(path), url) => Ok(Self::new(path.clone(), url.clone(), token)),
            (None, Some(url)) => Ok(Self::new(
                config.repo_cache.join(cache_dir_name(&config.github_repo)),
                Some(url.clone()),
                token,
            )),
            (None, None) => anyhow::bail!("neither repo_url nor repo_path is configured"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remote(&self) -> Option<String> {
        self.remote_url
            .as_deref()
            .map(|url| authenticated_url(url, self.token.as_deref()))
    }

    /// Clone the repository if it is not there yet.
    pub async fn ensure(&self) -> Result<()> {
        if self.path.join(".git").exists() {
            return Ok(());
        }
        let Some(remote) = self.remote() else {
            anyhow::bail!("repository not found at {}", self.path.display());
        };
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .context(format!("failed to create repo cache: {}", parent.display()))?;

        let target = self.path.to_string_lossy().to_string();
        tracing::info!(path = %self.path.display(), "cloning base repository");
        git(parent, &["clone", &remote, &target])
            .await
            .context("git clone failed")?;
        Ok(())
    }

    /// Default branch of `origin`, from `refs/remotes/origin/HEAD`, falling
    /// back to `main` and then `master`.
    pub async fn default_branch(&self) -> Result<String> {
        if let Ok(head) = git(
            &self.path,
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        )
        .await
            && let Some(branch) = head.strip_prefix("origin/")
        {
            return Ok(branch.to_string());
        }
        for candidate in ["main", "master"] {
            let remote_ref = format!("refs/remotes/origin/{candidate}");
            let local_ref = format!("refs/heads/{candidate}");
            if git_ok(&self.path, &["rev-parse", "--verify", "--quiet", &remote_ref]).await
                || git_ok(&self.path, &["rev-parse", "--verify", "--quiet", &local_ref]).await
            {
                return Ok(candidate.to_string());
            }
        }
        anyhow::bail!(
            "cannot determine default branch of {}",
            self.path.display()
        )
    }

    /// Bring the base repository up to date with `origin`.
    ///
    /// Returns the start point for new worktrees: `origin/<default>` when
    /// there is a remote, otherwise the local default branch.
    pub async fn refresh(&self) -> Result<String> {
        self.ensure().await?;

        if let Some(remote) = self.remote() {
            // The token may have been rotated since the clone.
            git(&self.path, &["remote", "set-url", "origin", &remote])
                .await
                .context("git remote set-url failed")?;
        }
        let has_origin = git_ok(&self.path, &["remote", "get-url", "origin"]).await;
        if !has_origin {
            let branch = self.default_branch().await?;
            tracing::debug!(path = %self.path.display(), branch = %branch, "no origin remote, using local branch");
            return Ok(branch);
        }

        git(&self.path, &["fetch", "origin", "--prune"])
            .await
            .context("git fetch failed")?;
        let branch = self.default_branch().await?;
        let upstream = format!("origin/{branch}");
        git(&self.path, &["checkout", "--force", &branch])
            .await
            .context(format!("git checkout {branch} failed"))?;
        git(&self.path, &["reset", "--hard", &upstream])
            .await
            .context(format!("git reset --hard {upstream} failed"))?;

        tracing::info!(path = %self.path.display(), branch = %branch, "base repository refreshed");
        Ok(upstream)
    }
}
