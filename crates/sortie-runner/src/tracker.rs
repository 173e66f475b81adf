//! Issue tracker access through the `gh` CLI.

use crate::subprocess::run_cmd_stdout;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sortie_core::task::{IssueNumber, TrackerItem};
use std::path::PathBuf;
use std::time::Duration;

const GH_TIMEOUT: Duration = Duration::from_secs(60);

/// Most issues fetched per poll.
const LIST_LIMIT: &str = "200";

#[async_trait]
pub trait Tracker: Send + Sync {
    /// Open items carrying the work label.
    async fn list_tagged_open_items(&self) -> Result<Vec<TrackerItem>>;

    async fn post_comment(&self, id: IssueNumber, body: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    updated_at: DateTime<Utc>,
}

/// Parse `gh issue list --json number,title,labels,updatedAt` output.
///
/// Label matching is case-insensitive.
pub fn parse_issue_list(json: &str, implement_label: &str) -> Result<Vec<TrackerItem>> {
    let issues: Vec<GhIssue> =
        serde_json::from_str(json).context("failed to parse gh issue list output")?;
    Ok(issues
        .into_iter()
        .map(|issue| TrackerItem {
            id: IssueNumber(issue.number),
            implement: issue
                .labels
                .iter()
                .any(|l| l.name.eq_ignore_ascii_case(implement_label)),
            title: issue.title,
            updated_at: issue.updated_at,
        })
        .collect())
}

pub struct GhTracker {
    repo: String,
    label: String,
    implement_label: String,
    cwd: PathBuf,
}

impl GhTracker {
    pub fn new(
        repo: impl Into<String>,
        label: impl Into<String>,
        implement_label: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            label: label.into(),
            implement_label: implement_label.into(),
            cwd: std::env::temp_dir(),
        }
    }
}

/// Arguments for `gh issue comment`. The body is passed as one argument,
/// never through a shell.
fn comment_args<'a>(repo: &'a str, number: &'a str, body: &'a str) -> [&'a str; 7] {
    ["issue", "comment", number, "--repo", repo, "--body", body]
}

#[async_trait]
impl Tracker for GhTracker {
    async fn list_tagged_open_items(&self) -> Result<Vec<TrackerItem>> {
        let stdout = run_cmd_stdout(
            "gh",
            &[
                "issue",
                "list",
                "--repo",
                &self.repo,
                "--label",
                &self.label,
                "--state",
                "open",
                "--limit",
                LIST_LIMIT,
                "--json",
                "number,title,labels,updatedAt",
            ],
            &self.cwd,
            GH_TIMEOUT,
        )
        .await
        .context("failed to run `gh issue list`")?;

        let items = parse_issue_list(&stdout, &self.implement_label)?;
        tracing::debug!(repo = %self.repo, label = %self.label, count = items.len(), "listed tagged issues");
        Ok(items)
    }

    async fn post_comment(&self, id: IssueNumber, body: &str) -> Result<()> {
        let number = id.0.to_string();
        run_cmd_stdout(
            "gh",
            &comment_args(&self.repo, &number, body),
            &self.cwd,
            GH_TIMEOUT,
        )
        .await
        .context(format!("failed to comment on issue {id}"))?;
        tracing::info!(issue = %id, "posted comment");
        Ok(())
    }
}
