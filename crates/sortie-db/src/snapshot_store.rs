//! Persistent scheduler snapshot.
//!
//! A single record under the `scheduler` key holds the JSON document
//! `{paused, queued, running, completed}`. Each save replaces it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use sortie_core::scheduler::{SNAPSHOT_HISTORY_LIMIT, SchedulerSnapshot};

/// redb table: record key -> JSON document.
pub const SNAPSHOT_TABLE: TableDefinition<&str, &str> = TableDefinition::new("snapshots");

const SCHEDULER_KEY: &str = "scheduler";
const SAVED_AT_KEY: &str = "saved_at";

pub struct SnapshotStore<'a> {
    db: &'a Database,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist `snapshot`, keeping only the most recent finished tasks.
    pub fn save(&self, snapshot: &SchedulerSnapshot) -> Result<()> {
        let trimmed = snapshot.clone().trimmed(SNAPSHOT_HISTORY_LIMIT);
        let json = serde_json::to_string(&trimmed)?;
        let saved_at = Utc::now().to_rfc3339();

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOT_TABLE)?;
            table.insert(SCHEDULER_KEY, json.as_str())?;
            table.insert(SAVED_AT_KEY, saved_at.as_str())?;
        }
        write_txn.commit()?;

        tracing::debug!(
            paused = trimmed.paused,
            queued = trimmed.queued.len(),
            running = trimmed.running.len(),
            completed = trimmed.completed.len(),
            "saved scheduler snapshot"
        );
        Ok(())
    }

    /// Load the last saved snapshot, if any.
    pub fn load(&self) -> Result<Option<SchedulerSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOT_TABLE)?;
        match table.get(SCHEDULER_KEY)? {
            Some(guard) => {
                let snapshot: SchedulerSnapshot = serde_json::from_str(guard.value())
                    .context("stored scheduler snapshot is not valid JSON")?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// When the snapshot was last written.
    pub fn saved_at(&self) -> Result<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOT_TABLE)?;
        match table.get(SAVED_AT_KEY)? {
            Some(guard) => {
                let ts = DateTime::parse_from_rfc3339(guard.value())
                    .context("stored snapshot timestamp is invalid")?;
                Ok(Some(ts.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the stored record with raw text. Used to simulate damage.
    #[cfg(test)]
    fn put_raw(&self, json: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOT_TABLE)?;
            table.insert(SCHEDULER_KEY, json)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
