//! Bounded-concurrency task scheduler.
//!
//! Owns the FIFO queue of pending tasks, the running set, the bounded
//! history of finished tasks, and the pause flag. Every operation takes
//! one mutex, so dedup + insert and capacity check + dequeue are atomic
//! with respect to each other.
//!
//! A task returned by [`Scheduler::next_admissible`] holds a capacity slot
//! until it is either marked running or finalized with
//! [`Scheduler::finalize_unstarted`]. That keeps `running <= max_concurrent`
//! true no matter how many dispatch loops poll the scheduler.

use crate::task::{IssueNumber, Task, TrackerItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Finished tasks kept in memory.
pub const HISTORY_LIMIT: usize = 100;

/// Finished tasks written to a persisted snapshot.
pub const SNAPSHOT_HISTORY_LIMIT: usize = 20;

/// Point-in-time copy of the whole scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub paused: bool,
    #[serde(default)]
    pub queued: Vec<Task>,
    #[serde(default)]
    pub running: Vec<Task>,
    #[serde(default)]
    pub completed: Vec<Task>,
}

impl SchedulerSnapshot {
    /// Keep only the most recent `limit` finished tasks.
    pub fn trimmed(mut self, limit: usize) -> Self {
        if self.completed.len() > limit {
            let excess = self.completed.len() - limit;
            self.completed.drain(..excess);
        }
        self
    }
}

/// Counters for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub paused: bool,
    pub running: usize,
    /// Admitted by the dispatcher but not yet running.
    pub starting: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Task>,
    /// Dequeued, workspace/unit setup in progress.
    admitted: BTreeSet<IssueNumber>,
    running: BTreeMap<IssueNumber, Task>,
    /// Finished, container and worktree not yet torn down.
    cleaning_up: BTreeSet<IssueNumber>,
    completed: VecDeque<Task>,
    paused: bool,
}

impl State {
    fn is_known(&self, id: IssueNumber) -> bool {
        self.running.contains_key(&id)
            || self.admitted.contains(&id)
            || self.cleaning_up.contains(&id)
            || self.queue.iter().any(|t| t.id == id)
    }

    fn status(&self, max_concurrent: usize) -> QueueStatus {
        QueueStatus {
            paused: self.paused,
            running: self.running.len(),
            starting: self.admitted.len(),
            queued: self.queue.len(),
            max_concurrent,
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            paused: self.paused,
            queued: self.queue.iter().cloned().collect(),
            running: self.running.values().cloned().collect(),
            completed: self.completed.iter().cloned().collect(),
        }
    }

    fn complete(&mut self, id: IssueNumber, error: Option<&str>) -> Option<Task> {
        let Some(mut task) = self.running.remove(&id) else {
            tracing::warn!(issue = %id, "task not in running set, ignoring completion");
            return None;
        };
        task.finish(error);
        log_finished(&task);
        self.push_history(task.clone());
        Some(task)
    }

    fn push_history(&mut self, task: Task) {
        self.completed.push_back(task);
        while self.completed.len() > HISTORY_LIMIT {
            self.completed.pop_front();
        }
    }
}

pub struct Scheduler {
    max_concurrent: usize,
    state: Mutex<State>,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            state: Mutex::new(State::default()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    // A panic while holding the lock leaves the state consistent (every
    // mutation is a single push/pop/insert), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a pending task for `item`.
    ///
    /// Returns `false` without touching state if the issue is already
    /// queued, being set up, or running.
    pub fn add(&self, item: &TrackerItem) -> bool {
        let mut state = self.lock();
        if state.running.contains_key(&item.id) {
            tracing::info!(issue = %item.id, "already running, not queued");
            return false;
        }
        if state.is_known(item.id) {
            tracing::info!(issue = %item.id, "already queued");
            return false;
        }
        state.queue.push_back(Task::from_item(item));
        tracing::info!(issue = %item.id, title = %item.title, "queued task");
        true
    }

    /// Take the oldest pending task if the scheduler is not paused and a
    /// slot is free.
    pub fn next_admissible(&self) -> Option<Task> {
        let mut state = self.lock();
        if state.paused {
            return None;
        }
        if state.running.len() + state.admitted.len() >= self.max_concurrent {
            return None;
        }
        let task = state.queue.pop_front()?;
        state.admitted.insert(task.id);
        Some(task)
    }

    /// Record that `task` now has a container and a worktree.
    pub fn mark_running(&self, mut task: Task, container_id: String, worktree_path: PathBuf) {
        let mut state = self.lock();
        if !state.admitted.remove(&task.id) {
            tracing::warn!(issue = %task.id, "marking a task running that was not admitted");
        }
        task.start(container_id, worktree_path);
        tracing::info!(
            issue = %task.id,
            container = task.container_id.as_deref().unwrap_or_default(),
            "task running"
        );
        state.running.insert(task.id, task);
    }

    /// Finish a running task. A non-empty `error` marks it failed.
    ///
    /// Returns the finished task, or `None` (with a warning) when `id` is
    /// not running, so a task is finalized at most once.
    pub fn mark_completed(&self, id: IssueNumber, error: Option<&str>) -> Option<Task> {
        self.lock().complete(id, error)
    }

    /// Like [`mark_completed`](Self::mark_completed), but the issue stays
    /// live for [`add`](Self::add) until [`cleanup_done`](Self::cleanup_done).
    ///
    /// A new run of the same issue reuses the worktree path, so it must not
    /// start while the previous run's worktree is still being removed.
    pub fn mark_completed_pending_cleanup(
        &self,
        id: IssueNumber,
        error: Option<&str>,
    ) -> Option<Task> {
        let mut state = self.lock();
        let task = state.complete(id, error)?;
        state.cleaning_up.insert(id);
        Some(task)
    }

    /// Teardown of a finished task is over; the issue may be queued again.
    pub fn cleanup_done(&self, id: IssueNumber) {
        self.lock().cleaning_up.remove(&id);
    }

    /// Record a task that failed during setup, before it ever ran.
    ///
    /// Releases the slot taken by [`next_admissible`](Self::next_admissible)
    /// and writes the task straight into history as failed.
    pub fn finalize_unstarted(&self, mut task: Task, error: &str) -> Task {
        let mut state = self.lock();
        state.admitted.remove(&task.id);
        task.finish(Some(error).filter(|e| !e.is_empty()).or(Some("setup failed")));
        log_finished(&task);
        state.push_history(task.clone());
        task
    }

    pub fn pause(&self) {
        self.lock().paused = true;
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_running(&self, id: IssueNumber) -> bool {
        self.lock().running.contains_key(&id)
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.lock().running.values().cloned().collect()
    }

    pub fn status(&self) -> QueueStatus {
        self.lock().status(self.max_concurrent)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.lock().snapshot()
    }

    /// Counters and task lists read under one lock, so they agree.
    pub fn report(&self) -> (QueueStatus, SchedulerSnapshot) {
        let state = self.lock();
        (state.status(self.max_concurrent), state.snapshot())
    }

    /// Apply a snapshot from a previous process.
    ///
    /// Only the pause flag and finished history carry over. Queued and
    /// running tasks refer to containers and worktrees that may be gone,
    /// so they are dropped and must come back through discovery.
    pub fn restore(&self, snapshot: SchedulerSnapshot) {
        let dropped_queued = snapshot.queued.len();
        let dropped_running = snapshot.running.len();
        let snapshot = snapshot.trimmed(HISTORY_LIMIT);

        let mut state = self.lock();
        state.paused = snapshot.paused;
        state.completed = snapshot
            .completed
            .into_iter()
            .filter(|t| t.status.is_terminal())
            .collect();

        tracing::info!(
            paused = state.paused,
            completed = state.completed.len(),
            dropped_queued,
            dropped_running,
            "restored scheduler state"
        );
    }
}

fn log_finished(task: &Task) {
    match task.error.as_deref() {
        Some(error) => tracing::error!(issue = %task.id, error, "task failed"),
        None => tracing::info!(
            issue = %task.id,
            elapsed_secs = task.elapsed_secs(),
            "task completed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use chrono::Utc;

    fn item(n: u64) -> TrackerItem {
        TrackerItem {
            id: IssueNumber(n),
            title: format!("Issue {n}"),
            implement: false,
            updated_at: Utc::now(),
        }
    }

    fn run_next(s: &Scheduler) -> IssueNumber {
        let task = s.next_admissible().expect("admissible task");
        let id = task.id;
        s.mark_running(task, format!("c{}", id.0), PathBuf::from(format!("/w/{}", id.0)));
        id
    }

    #[test]
    fn add_rejects_queued_duplicate() {
        let s = Scheduler::new(2);
        assert!(s.add(&item(1)));
        let before = s.snapshot();
        assert!(!s.add(&item(1)));
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn add_rejects_running_duplicate() {
        let s = Scheduler::new(2);
        s.add(&item(1));
        run_next(&s);
        let before = s.snapshot();
        assert!(!s.add(&item(1)));
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn add_rejects_task_being_set_up() {
        let s = Scheduler::new(2);
        s.add(&item(1));
        let _admitted = s.next_admissible().unwrap();
        assert!(!s.add(&item(1)));
    }

    #[test]
    fn finished_task_blocks_requeue_until_cleanup_done() {
        let s = Scheduler::new(2);
        s.add(&item(1));
        run_next(&s);

        let done = s.mark_completed_pending_cleanup(IssueNumber(1), None).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(!s.is_running(IssueNumber(1)));
        assert!(!s.add(&item(1)));
        // Cleanup holds no slot.
        s.add(&item(2));
        assert_eq!(s.next_admissible().unwrap().id, IssueNumber(2));

        s.cleanup_done(IssueNumber(1));
        assert!(s.add(&item(1)));
    }

    #[test]
    fn report_counts_match_task_lists() {
        let s = Scheduler::new(2);
        for n in 1..=4 {
            s.add(&item(n));
        }
        run_next(&s);
        let _starting = s.next_admissible().unwrap();

        let (status, snapshot) = s.report();
        assert_eq!(status.running, snapshot.running.len());
        assert_eq!(status.queued, snapshot.queued.len());
        assert_eq!(status.starting, 1);
        assert_eq!(status, s.status());
        assert_eq!(snapshot, s.snapshot());
    }

    #[test]
    fn add_accepts_again_after_terminal() {
        let s = Scheduler::new(1);
        s.add(&item(4));
        run_next(&s);
        s.mark_completed(IssueNumber(4), None);
        assert!(s.add(&item(4)));
    }

    #[test]
    fn fifo_with_capacity_two() {
        let s = Scheduler::new(2);
        for n in [1, 2, 3] {
            s.add(&item(n));
        }
        assert_eq!(run_next(&s), IssueNumber(1));
        assert_eq!(run_next(&s), IssueNumber(2));
        assert!(s.next_admissible().is_none());

        s.mark_completed(IssueNumber(1), None);
        assert_eq!(run_next(&s), IssueNumber(3));
    }

    #[test]
    fn admitted_task_holds_a_slot() {
        let s = Scheduler::new(1);
        s.add(&item(1));
        s.add(&item(2));
        let first = s.next_admissible().unwrap();
        assert!(s.next_admissible().is_none());

        s.finalize_unstarted(first, "workspace unavailable");
        assert_eq!(s.next_admissible().unwrap().id, IssueNumber(2));
    }

    #[test]
    fn pause_blocks_admission_but_not_running() {
        let s = Scheduler::new(3);
        s.add(&item(1));
        s.add(&item(2));
        run_next(&s);

        s.pause();
        assert!(s.next_admissible().is_none());
        assert!(s.is_running(IssueNumber(1)));
        assert_eq!(s.status().queued, 1);

        s.resume();
        assert_eq!(s.next_admissible().unwrap().id, IssueNumber(2));
    }

    #[test]
    fn mark_completed_with_error_records_failure() {
        let s = Scheduler::new(8);
        s.add(&item(7));
        run_next(&s);

        let done = s.mark_completed(IssueNumber(7), Some("boom")).unwrap();
        assert_eq!(done.status, TaskStatus::Failed);

        let snap = s.snapshot();
        assert!(snap.running.is_empty());
        let last = snap.completed.last().unwrap();
        assert_eq!(last.id, IssueNumber(7));
        assert_eq!(last.status, TaskStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("boom"));
    }

    #[test]
    fn mark_completed_twice_is_noop() {
        let s = Scheduler::new(1);
        s.add(&item(5));
        run_next(&s);
        assert!(s.mark_completed(IssueNumber(5), None).is_some());
        assert!(s.mark_completed(IssueNumber(5), Some("late")).is_none());
        assert_eq!(s.snapshot().completed.len(), 1);
    }

    #[test]
    fn finalize_unstarted_goes_straight_to_history() {
        let s = Scheduler::new(1);
        s.add(&item(11));
        let task = s.next_admissible().unwrap();
        let failed = s.finalize_unstarted(task, "git worktree add failed");

        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.container_id.is_none());
        let snap = s.snapshot();
        assert!(snap.running.is_empty());
        assert_eq!(snap.completed[0].error.as_deref(), Some("git worktree add failed"));
    }

    #[test]
    fn history_keeps_latest_hundred() {
        let s = Scheduler::new(1);
        for n in 0..150 {
            s.add(&item(n));
            run_next(&s);
            s.mark_completed(IssueNumber(n), None);
        }
        let snap = s.snapshot();
        assert_eq!(snap.completed.len(), HISTORY_LIMIT);
        assert_eq!(snap.completed.first().unwrap().id, IssueNumber(50));
        assert_eq!(snap.completed.last().unwrap().id, IssueNumber(149));

        let persisted = snap.trimmed(SNAPSHOT_HISTORY_LIMIT);
        assert_eq!(persisted.completed.len(), SNAPSHOT_HISTORY_LIMIT);
        assert_eq!(persisted.completed.first().unwrap().id, IssueNumber(130));
    }

    #[test]
    fn restore_keeps_only_pause_and_history() {
        let old = Scheduler::new(2);
        old.add(&item(1));
        old.add(&item(2));
        old.add(&item(3));
        run_next(&old);
        run_next(&old);
        old.mark_completed(IssueNumber(1), None);
        old.pause();
        let saved = old.snapshot();
        assert_eq!(saved.queued.len(), 1);
        assert_eq!(saved.running.len(), 1);

        let fresh = Scheduler::new(2);
        fresh.restore(saved.clone());
        let restored = fresh.snapshot();
        assert!(restored.paused);
        assert_eq!(restored.completed, saved.completed);
        assert!(restored.queued.is_empty());
        assert!(restored.running.is_empty());
        // Items from the dropped queue can be discovered again.
        assert!(fresh.add(&item(2)));
        assert!(fresh.add(&item(3)));
    }
}
