//! Periodic tracker poll feeding new and updated issues to the scheduler.

use crate::context::DaemonContext;
use sortie_core::discovery::{DiscoveryKind, DiscoveryMemory};
use std::sync::Arc;

/// Poll immediately, then every `poll_interval`, until shutdown.
pub async fn run(ctx: Arc<DaemonContext>) {
    let mut memory = DiscoveryMemory::new();
    tracing::info!(
        interval_secs = ctx.settings.poll_interval.as_secs(),
        "discovery loop started"
    );

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = poll_once(&ctx, &mut memory) => {}
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(ctx.settings.poll_interval) => {}
        }
    }

    tracing::info!(seen = memory.len(), "discovery loop stopped");
}

/// One poll. Returns how many tasks were queued.
pub async fn poll_once(ctx: &DaemonContext, memory: &mut DiscoveryMemory) -> usize {
    let items = match ctx.tracker.list_tagged_open_items().await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch tagged issues");
            return 0;
        }
    };

    let mut queued = 0;
    for found in memory.observe(&items) {
        let id = found.item.id;
        if ctx.scheduler.is_running(id) {
            tracing::debug!(issue = %id, "change seen while running, not queued");
            continue;
        }
        match found.kind {
            DiscoveryKind::New => tracing::info!(issue = %id, title = %found.item.title, "new issue"),
            DiscoveryKind::Updated => tracing::info!(issue = %id, "issue updated"),
        }
        if ctx.scheduler.add(&found.item) {
            queued += 1;
        }
    }

    tracing::debug!(fetched = items.len(), queued, "poll complete");
    queued
}
