//! Commit log backed by redb.
//!
//! Stores every committed change keyed by its epoch. Entries are
//! JSON-serialized. The lease store and slot table are rebuilt from this
//! log when a meta node restarts.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use meshreg_core::{Epoch, RegistryError, RegistryResult};

use crate::typ::Committed;

/// redb table for committed changes: key = epoch, value = JSON bytes.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("commit_log");

fn storage_err(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

/// Append-only log of committed changes.
#[derive(Clone)]
pub struct CommitLog {
    db: Arc<Database>,
}

impl CommitLog {
    /// Open (or create) a persistent log at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        let db = Database::create(path).map_err(storage_err)?;
        let log = Self::new(Arc::new(db))?;
        debug!(?path, "commit log opened");
        Ok(log)
    }

    /// Create an ephemeral in-memory log (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(storage_err)?;
        Self::new(Arc::new(db))
    }

    /// Wrap an existing database, creating the log table if absent.
    pub fn new(db: Arc<Database>) -> RegistryResult<Self> {
        let txn = db.begin_write().map_err(storage_err)?;
        txn.open_table(LOG_TABLE).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Durably append a committed change.
    pub fn append(&self, entry: &Committed) -> RegistryResult<()> {
        let data = serde_json::to_vec(entry).map_err(storage_err)?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(storage_err)?;
            table
                .insert(entry.epoch, data.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        debug!(epoch = entry.epoch, kind = entry.change.kind(), "change appended");
        Ok(())
    }

    /// Entries with an epoch strictly greater than `after`, in epoch order.
    pub fn entries_after(&self, after: Epoch) -> RegistryResult<Vec<Committed>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(storage_err)?;

        let mut entries = Vec::new();
        for item in table.range(after.saturating_add(1)..).map_err(storage_err)? {
            let (_, val) = item.map_err(storage_err)?;
            let entry: Committed = serde_json::from_slice(val.value()).map_err(storage_err)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Epoch of the newest entry, or 0 for an empty log.
    pub fn last_epoch(&self) -> RegistryResult<Epoch> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(storage_err)?;
        match table.last().map_err(storage_err)? {
            Some((key, _)) => Ok(key.value()),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typ::Change;
    use meshreg_core::NodeIdentity;

    fn entry(epoch: Epoch) -> Committed {
        Committed {
            epoch,
            change: Change::Evict {
                node: NodeIdentity::data(format!("10.0.0.{epoch}:9620"), "zone-a"),
            },
        }
    }

    #[test]
    fn empty_log_state() {
        let log = CommitLog::open_in_memory().unwrap();
        assert_eq!(log.last_epoch().unwrap(), 0);
        assert!(log.entries_after(0).unwrap().is_empty());
    }

    #[test]
    fn append_and_read_in_order() {
        let log = CommitLog::open_in_memory().unwrap();
        log.append(&entry(1)).unwrap();
        log.append(&entry(2)).unwrap();
        log.append(&entry(3)).unwrap();

        assert_eq!(log.last_epoch().unwrap(), 3);
        let tail = log.entries_after(1).unwrap();
        assert_eq!(tail.iter().map(|c| c.epoch).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit.redb");

        {
            let log = CommitLog::open(&path).unwrap();
            log.append(&entry(1)).unwrap();
            log.append(&entry(2)).unwrap();
        }

        let log = CommitLog::open(&path).unwrap();
        assert_eq!(log.last_epoch().unwrap(), 2);
        assert_eq!(log.entries_after(0).unwrap().len(), 2);
    }
}
