use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Tracker issue number. Stable for the lifetime of the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueNumber(pub u64);

impl fmt::Display for IssueNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::str::FromStr for IssueNumber {
    type Err = std::num::ParseIntError;

    /// Accepts both `42` and `#42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(IssueNumber)
    }
}

/// An open, tagged item as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerItem {
    pub id: IssueNumber,
    pub title: String,
    /// Carries the implementation label: run the plan instead of writing one.
    pub implement: bool,
    pub updated_at: DateTime<Utc>,
}

/// Task status as a state machine.
///
/// Transitions:
///   Pending -> Running -> Completed | Failed
///   Pending -> Failed (setup failure before a unit was launched)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One run of one tracker issue through a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: IssueNumber,
    pub title: String,
    pub implement: bool,
    pub status: TaskStatus,
    /// Container handle, set at the Pending -> Running transition.
    #[serde(default)]
    pub container_id: Option<String>,
    /// Worktree handle, set together with `container_id`.
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present iff the task failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// Create a new pending task for a discovered item.
    pub fn new(id: IssueNumber, title: impl Into<String>, implement: bool) -> Self {
        Self {
            id,
            title: title.into(),
            implement,
            status: TaskStatus::Pending,
            container_id: None,
            worktree_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn from_item(item: &TrackerItem) -> Self {
        Self::new(item.id, item.title.clone(), item.implement)
    }

    /// Pending -> Running. Binds both handles at once.
    pub(crate) fn start(&mut self, container_id: String, worktree_path: PathBuf) {
        self.status = TaskStatus::Running;
        self.container_id = Some(container_id);
        self.worktree_path = Some(worktree_path);
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal status. An empty error string counts as success.
    pub(crate) fn finish(&mut self, error: Option<&str>) {
        self.completed_at = Some(Utc::now());
        match error.filter(|e| !e.is_empty()) {
            Some(e) => {
                self.status = TaskStatus::Failed;
                self.error = Some(e.to_string());
            }
            None => {
                self.status = TaskStatus::Completed;
                self.error = None;
            }
        }
    }

    /// Wall-clock seconds between start and completion, if both are known.
    pub fn elapsed_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}
