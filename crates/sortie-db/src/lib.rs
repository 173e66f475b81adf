pub mod snapshot_store;

use anyhow::{Context, Result};
use redb::Database;
use std::path::Path;

/// Open (or create) the state database at the given path.
pub fn open_db(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("failed to create db dir: {}", parent.display()))?;
    }
    let db = Database::create(path)
        .context(format!("failed to open state db: {}", path.display()))?;
    // Ensure all tables exist by doing a write transaction
    let write_txn = db.begin_write()?;
    {
        let _snapshots = write_txn.open_table(snapshot_store::SNAPSHOT_TABLE)?;
    }
    write_txn.commit()?;
    Ok(db)
}
