//! Execution-unit runtime seam.
//!
//! A unit is one ephemeral container running the agent for one issue,
//! bound to that issue's worktree.

use anyhow::Result;
use async_trait::async_trait;
use sortie_core::task::IssueNumber;
use std::path::PathBuf;
use std::sync::Mutex;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub issue: IssueNumber,
    /// Host path of the worktree, mounted read-write into the unit.
    pub workspace: PathBuf,
    pub instructions: String,
}

/// Opaque handle to a launched unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    pub id: String,
}

impl UnitHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// First 12 characters, as `docker ps` shows them.
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

impl std::fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_id())
    }
}

/// Container runtime contract.
///
/// `launch` returns once the unit has started, failing fast otherwise.
/// `wait` blocks until the unit terminates and yields its exit code.
/// `remove` is idempotent.
#[async_trait]
pub trait UnitRuntime: Send + Sync {
    async fn launch(&self, spec: &UnitSpec) -> Result<UnitHandle>;

    async fn wait(&self, unit: &UnitHandle) -> Result<i64>;

    /// Combined stdout and stderr of the unit so far.
    async fn logs(&self, unit: &UnitHandle) -> Result<String>;

    async fn remove(&self, unit: &UnitHandle) -> Result<()>;

    /// Name of this runtime, for logs.
    fn name(&self) -> &str;
}

/// Runtime that launches nothing. Every unit exits 0 immediately.
#[derive(Default)]
pub struct DryRunRuntime {
    launched: Mutex<Vec<UnitSpec>>,
}

impl DryRunRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs passed to `launch` so far.
    pub fn launched(&self) -> Vec<UnitSpec> {
        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UnitRuntime for DryRunRuntime {
    async fn launch(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        tracing::info!(
            issue = %spec.issue,
            workspace = %spec.workspace.display(),
            instructions_len = spec.instructions.len(),
            "[dry-run] would launch container"
        );
        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(spec.clone());
        Ok(UnitHandle::new(format!("dry-run-{}", spec.issue.0)))
    }

    async fn wait(&self, unit: &UnitHandle) -> Result<i64> {
        tracing::info!(unit = %unit.id, "[dry-run] container exited 0");
        Ok(0)
    }

    async fn logs(&self, unit: &UnitHandle) -> Result<String> {
        Ok(format!("[dry-run] no output for {}\n", unit.id))
    }

    async fn remove(&self, unit: &UnitHandle) -> Result<()> {
        tracing::info!(unit = %unit.id, "[dry-run] would remove container");
        Ok(())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
