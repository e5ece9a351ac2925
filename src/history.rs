//! Recent semantic search queries, most recent first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const HISTORY_FILE: &str = "search-history.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query: String,
    pub searched_at: DateTime<Utc>,
    /// Bookmarks the query returned
    #[serde(default)]
    pub results: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct HistoryDump {
    entries: Vec<HistoryEntry>,
}

pub struct SearchHistory {
    store: BackendLocal,
    capacity: usize,
}

impl SearchHistory {
    pub fn new(store: BackendLocal, capacity: usize) -> Self {
        Self { store, capacity }
    }

    /// Stored entries, most recent first. An unreadable file reads as empty.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        if !self.store.exists(HISTORY_FILE) {
            return vec![];
        }

        let data = match self.store.read(HISTORY_FILE) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to read search history: {e}");
                return vec![];
            }
        };

        match serde_json::from_slice::<HistoryDump>(&data) {
            Ok(dump) => dump.entries,
            Err(e) => {
                log::warn!("discarding malformed search history: {e}");
                vec![]
            }
        }
    }

    /// Record a query, dropping the oldest entries beyond capacity.
    ///
    /// Repeating a query moves it to the front instead of duplicating it.
    pub fn record(&self, query: &str, results: usize) -> anyhow::Result<()> {
        let query = query.trim();
        if query.is_empty() || self.capacity == 0 {
            return Ok(());
        }

        let mut entries = self.entries();
        entries.retain(|entry| entry.query != query);
        entries.insert(
            0,
            HistoryEntry {
                query: query.to_string(),
                searched_at: Utc::now(),
                results,
            },
        );
        entries.truncate(self.capacity);

        self.write(entries)
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.store.exists(HISTORY_FILE) {
            self.store.delete(HISTORY_FILE)?;
        }
        Ok(())
    }

    fn write(&self, entries: Vec<HistoryEntry>) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(&HistoryDump { entries })?;
        self.store.write(HISTORY_FILE, data.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(capacity: usize) -> (SearchHistory, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        (SearchHistory::new(store, capacity), tmp)
    }

    fn queries(history: &SearchHistory) -> Vec<String> {
        history.entries().into_iter().map(|e| e.query).collect()
    }

    #[test]
    fn test_most_recent_first_and_capped() {
        let (history, _tmp) = history(2);
        history.record("first", 1).unwrap();
        history.record("second", 0).unwrap();
        history.record("third", 3).unwrap();

        assert_eq!(queries(&history), vec!["third", "second"]);
        assert_eq!(history.entries()[0].results, 3);
    }

    #[test]
    fn test_repeat_moves_to_front() {
        let (history, _tmp) = history(5);
        history.record("rust", 1).unwrap();
        history.record("bread", 1).unwrap();
        history.record("  rust ", 2).unwrap();

        assert_eq!(queries(&history), vec!["rust", "bread"]);
    }

    #[test]
    fn test_blank_queries_are_ignored() {
        let (history, _tmp) = history(5);
        history.record("   ", 0).unwrap();
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_clear() {
        let (history, _tmp) = history(5);
        history.record("rust", 1).unwrap();
        history.clear().unwrap();
        assert!(history.entries().is_empty());
        history.clear().unwrap();
    }

    #[test]
    fn test_malformed_file_reads_as_empty() {
        let (history, tmp) = history(5);
        std::fs::write(tmp.path().join(HISTORY_FILE), b"{not json").unwrap();
        assert!(history.entries().is_empty());
        history.record("rust", 1).unwrap();
        assert_eq!(queries(&history), vec!["rust"]);
    }
}
