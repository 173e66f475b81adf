//! In-memory collaborators for driving the daemon in tests.

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sortie_core::scheduler::Scheduler;
use sortie_core::task::{IssueNumber, TrackerItem};
use sortie_runner::context::{DaemonContext, LoopSettings};
use sortie_runner::runtime::{UnitHandle, UnitRuntime, UnitSpec};
use sortie_runner::tracker::Tracker;
use sortie_runner::workspace::WorkspaceManager;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn item(n: u64, updated: i64) -> TrackerItem {
    TrackerItem {
        id: IssueNumber(n),
        title: format!("Issue {n}"),
        implement: false,
        updated_at: ts(updated),
    }
}

// ─── Tracker ─────────────────────────────────────────────────────────────

/// Returns queued poll results in order, then repeats the last one.
#[derive(Default)]
pub struct FakeTracker {
    polls: Mutex<VecDeque<Result<Vec<TrackerItem>, String>>>,
    last: Mutex<Vec<TrackerItem>>,
    pub comments: Mutex<Vec<(IssueNumber, String)>>,
    pub calls: Mutex<usize>,
}

impl FakeTracker {
    pub fn push(&self, items: Vec<TrackerItem>) {
        self.polls.lock().unwrap().push_back(Ok(items));
    }

    pub fn push_error(&self, message: &str) {
        self.polls.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn list_tagged_open_items(&self) -> Result<Vec<TrackerItem>> {
        *self.calls.lock().unwrap() += 1;
        match self.polls.lock().unwrap().pop_front() {
            Some(Ok(items)) => {
                *self.last.lock().unwrap() = items.clone();
                Ok(items)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    async fn post_comment(&self, id: IssueNumber, body: &str) -> Result<()> {
        self.comments.lock().unwrap().push((id, body.to_string()));
        Ok(())
    }
}

// ─── Workspaces ──────────────────────────────────────────────────────────

pub struct FakeWorkspaces {
    base: PathBuf,
    pub fail_acquire: Mutex<HashSet<IssueNumber>>,
    pub fail_release: Mutex<bool>,
    release_gate: Mutex<Option<Arc<Notify>>>,
    pub acquired: Mutex<Vec<IssueNumber>>,
    pub released: Mutex<Vec<IssueNumber>>,
}

impl FakeWorkspaces {
    pub fn new() -> Self {
        Self {
            base: PathBuf::from("/fake/worktrees"),
            fail_acquire: Mutex::new(HashSet::new()),
            fail_release: Mutex::new(false),
            release_gate: Mutex::new(None),
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for(&self, id: u64) {
        self.fail_acquire.lock().unwrap().insert(IssueNumber(id));
    }

    /// The next `release` waits until the returned handle is notified.
    pub fn hold_next_release(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.release_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn released(&self) -> Vec<IssueNumber> {
        self.released.lock().unwrap().clone()
    }

    pub fn acquired(&self) -> Vec<IssueNumber> {
        self.acquired.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkspaceManager for FakeWorkspaces {
    async fn acquire(&self, issue: IssueNumber) -> Result<PathBuf> {
        if self.fail_acquire.lock().unwrap().contains(&issue) {
            return Err(anyhow!("git worktree add failed"));
        }
        self.acquired.lock().unwrap().push(issue);
        Ok(self.base.join(format!("issue-{}", issue.0)))
    }

    async fn release(&self, issue: IssueNumber, _path: &Path) -> Result<()> {
        let gate = self.release_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.released.lock().unwrap().push(issue);
        if *self.fail_release.lock().unwrap() {
            return Err(anyhow!("directory busy"));
        }
        Ok(())
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────

type Exit = Result<i64, String>;

/// Units run until the test finishes them with [`FakeRuntime::finish`],
/// unless an exit was preset with [`FakeRuntime::exit_immediately`].
#[derive(Default)]
pub struct FakeRuntime {
    fail_launch: Mutex<HashSet<IssueNumber>>,
    preset: Mutex<HashMap<IssueNumber, Exit>>,
    finishers: Mutex<HashMap<IssueNumber, oneshot::Sender<Exit>>>,
    waiters: Mutex<HashMap<String, oneshot::Receiver<Exit>>>,
    pub launched: Mutex<Vec<UnitSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub output: Mutex<String>,
}

impl FakeRuntime {
    pub fn fail_launch_for(&self, id: u64) {
        self.fail_launch.lock().unwrap().insert(IssueNumber(id));
    }

    pub fn exit_immediately(&self, id: u64, exit: Exit) {
        self.preset.lock().unwrap().insert(IssueNumber(id), exit);
    }

    /// Make the unit for `id` exit. Returns false if it is not running.
    pub fn finish(&self, id: u64, exit: Exit) -> bool {
        match self.finishers.lock().unwrap().remove(&IssueNumber(id)) {
            Some(tx) => tx.send(exit).is_ok(),
            None => false,
        }
    }

    pub fn launched_ids(&self) -> Vec<IssueNumber> {
        self.launched.lock().unwrap().iter().map(|s| s.issue).collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

pub fn unit_id(id: u64) -> String {
    format!("unit-{id}")
}

#[async_trait]
impl UnitRuntime for FakeRuntime {
    async fn launch(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        if self.fail_launch.lock().unwrap().contains(&spec.issue) {
            return Err(anyhow!("image not found"));
        }
        let (tx, rx) = oneshot::channel();
        let unit = UnitHandle::new(unit_id(spec.issue.0));
        match self.preset.lock().unwrap().remove(&spec.issue) {
            Some(exit) => {
                let _ = tx.send(exit);
            }
            None => {
                self.finishers.lock().unwrap().insert(spec.issue, tx);
            }
        }
        self.waiters.lock().unwrap().insert(unit.id.clone(), rx);
        self.launched.lock().unwrap().push(spec.clone());
        Ok(unit)
    }

    async fn wait(&self, unit: &UnitHandle) -> Result<i64> {
        let rx = self
            .waiters
            .lock()
            .unwrap()
            .remove(&unit.id)
            .ok_or_else(|| anyhow!("unknown unit {}", unit.id))?;
        match rx.await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => Err(anyhow!("unit {} vanished", unit.id)),
        }
    }

    async fn logs(&self, _unit: &UnitHandle) -> Result<String> {
        Ok(self.output.lock().unwrap().clone())
    }

    async fn remove(&self, unit: &UnitHandle) -> Result<()> {
        self.removed.lock().unwrap().push(unit.id.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub ctx: Arc<DaemonContext>,
    pub tracker: Arc<FakeTracker>,
    pub workspaces: Arc<FakeWorkspaces>,
    pub runtime: Arc<FakeRuntime>,
    pub dir: tempfile::TempDir,
}

pub fn fast_settings() -> LoopSettings {
    LoopSettings {
        poll_interval: Duration::from_millis(50),
        dispatch_interval: Duration::from_millis(10),
        snapshot_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(200),
    }
}

pub fn harness(max_concurrent: usize) -> Harness {
    harness_with(max_concurrent, fast_settings())
}

pub fn harness_with(max_concurrent: usize, settings: LoopSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = sortie_db::open_db(&dir.path().join("state.redb")).unwrap();
    harness_on(max_concurrent, settings, dir, Arc::new(db))
}

pub fn harness_on(
    max_concurrent: usize,
    settings: LoopSettings,
    dir: tempfile::TempDir,
    db: Arc<redb::Database>,
) -> Harness {
    let tracker = Arc::new(FakeTracker::default());
    let workspaces = Arc::new(FakeWorkspaces::new());
    let runtime = Arc::new(FakeRuntime::default());
    let ctx = Arc::new(DaemonContext::new(
        Arc::new(Scheduler::new(max_concurrent)),
        runtime.clone(),
        workspaces.clone(),
        tracker.clone(),
        db,
        settings,
    ));
    Harness {
        ctx,
        tracker,
        workspaces,
        runtime,
        dir,
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
