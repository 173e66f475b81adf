//! Shared daemon state handed to every loop and watchdog.

use crate::runtime::UnitRuntime;
use crate::tracker::Tracker;
use crate::workspace::WorkspaceManager;
use sortie_core::config::DaemonConfig;
use sortie_core::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Timing knobs for the daemon loops.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub dispatch_interval: Duration,
    pub snapshot_interval: Duration,
    pub shutdown_grace: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            dispatch_interval: config.dispatch_interval(),
            snapshot_interval: config.snapshot_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Built once at startup and shared through `Arc`.
pub struct DaemonContext {
    pub scheduler: Arc<Scheduler>,
    pub runtime: Arc<dyn UnitRuntime>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub tracker: Arc<dyn Tracker>,
    pub db: Arc<redb::Database>,
    pub settings: LoopSettings,
    /// Cancelled once to stop every loop.
    pub shutdown: CancellationToken,
    /// One entry per live watchdog.
    pub watchdogs: TaskTracker,
}

impl DaemonContext {
    pub fn new(
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn UnitRuntime>,
        workspaces: Arc<dyn WorkspaceManager>,
        tracker: Arc<dyn Tracker>,
        db: Arc<redb::Database>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            scheduler,
            runtime,
            workspaces,
            tracker,
            db,
            settings,
            shutdown: CancellationToken::new(),
            watchdogs: TaskTracker::new(),
        }
    }

    /// Use an externally owned shutdown token (e.g. shared with the HTTP API).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
