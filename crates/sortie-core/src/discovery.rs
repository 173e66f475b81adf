//! Change detection over successive tracker polls.

use crate::task::{IssueNumber, TrackerItem};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// Id never seen before.
    New,
    /// Seen before, `updated_at` moved forward.
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub kind: DiscoveryKind,
    pub item: TrackerItem,
}

/// Last-seen `updated_at` per tracker id. Never pruned.
#[derive(Debug, Default)]
pub struct DiscoveryMemory {
    seen: HashMap<IssueNumber, DateTime<Utc>>,
}

impl DiscoveryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Classify one poll result against memory, then record it.
    ///
    /// Every item is judged against the memory as it was before the batch.
    /// Recording happens afterwards, so a duplicate id inside one batch is
    /// reported once per occurrence; the scheduler drops the extra ones.
    pub fn observe(&mut self, batch: &[TrackerItem]) -> Vec<Discovered> {
        let found: Vec<Discovered> = batch
            .iter()
            .filter_map(|item| {
                let kind = match self.seen.get(&item.id) {
                    None => DiscoveryKind::New,
                    Some(last) if item.updated_at > *last => DiscoveryKind::Updated,
                    Some(_) => return None,
                };
                Some(Discovered {
                    kind,
                    item: item.clone(),
                })
            })
            .collect();

        for item in batch {
            self.seen
                .entry(item.id)
                .and_modify(|last| *last = (*last).max(item.updated_at))
                .or_insert(item.updated_at);
        }
        found
    }
}
