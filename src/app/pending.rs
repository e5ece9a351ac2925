//! Bookmarks changed while the semantic index could not follow.
//!
//! Saves and deletes made with semantic search disabled, unavailable or
//! failing are recorded here and replayed the next time the index is ready.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const PENDING_FILE: &str = "index-pending.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PendingDump {
    ids: BTreeSet<u64>,
}

pub struct PendingIndex {
    store: BackendLocal,
}

impl PendingIndex {
    pub fn new(store: BackendLocal) -> Self {
        Self { store }
    }

    /// Recorded ids. An unreadable file reads as empty.
    pub fn ids(&self) -> BTreeSet<u64> {
        if !self.store.exists(PENDING_FILE) {
            return BTreeSet::new();
        }

        let data = match self.store.read(PENDING_FILE) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to read pending index changes: {e}");
                return BTreeSet::new();
            }
        };

        match serde_json::from_slice::<PendingDump>(&data) {
            Ok(dump) => dump.ids,
            Err(e) => {
                log::warn!("discarding malformed pending index changes: {e}");
                BTreeSet::new()
            }
        }
    }

    pub fn add(&self, id: u64) -> anyhow::Result<()> {
        let mut ids = self.ids();
        if !ids.insert(id) {
            return Ok(());
        }

        let data = serde_json::to_string_pretty(&PendingDump { ids })?;
        self.store.write(PENDING_FILE, data.as_bytes())?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.store.exists(PENDING_FILE) {
            self.store.delete(PENDING_FILE)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (PendingIndex, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        (PendingIndex::new(store), tmp)
    }

    #[test]
    fn test_add_and_clear() {
        let (pending, _tmp) = pending();
        assert!(pending.ids().is_empty());

        pending.add(3).unwrap();
        pending.add(1).unwrap();
        pending.add(3).unwrap();
        assert_eq!(pending.ids().into_iter().collect::<Vec<_>>(), vec![1, 3]);

        pending.clear().unwrap();
        assert!(pending.ids().is_empty());
        pending.clear().unwrap();
    }

    #[test]
    fn test_malformed_file_reads_empty() {
        let (pending, tmp) = pending();
        std::fs::write(tmp.path().join(PENDING_FILE), b"{not json").unwrap();

        assert!(pending.ids().is_empty());
        pending.add(7).unwrap();
        assert_eq!(pending.ids().into_iter().collect::<Vec<_>>(), vec![7]);
    }
}
