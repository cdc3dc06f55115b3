//! Persistence for the catalog.
//!
//! Entries and usage counters live in `catalog.json` under the data
//! directory, rewritten as pretty JSON after every mutation. A change that
//! fails to reach disk is rolled back in memory.

use async_trait::async_trait;
use catalog_core::store::{self, ContentStats, EntryStore, StatsStore, StoreError, UpsertOutcome};
use catalog_core::{ContentEntry, ContentId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

pub const CATALOG_FILE: &str = "catalog.json";

/// On-disk layout, sorted for stable diffs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    entries: Vec<ContentEntry>,
    #[serde(default)]
    stats: Vec<ContentStats>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, ContentEntry>,
    stats: HashMap<ContentId, ContentStats>,
}

impl State {
    fn to_file(&self) -> CatalogFile {
        let mut entries: Vec<ContentEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.source_locator.cmp(&b.source_locator));
        let mut stats: Vec<ContentStats> = self.stats.values().cloned().collect();
        stats.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        CatalogFile { entries, stats }
    }

    fn from_file(file: CatalogFile) -> Self {
        Self {
            entries: file
                .entries
                .into_iter()
                .map(|e| (e.source_locator.clone(), e))
                .collect(),
            stats: file
                .stats
                .into_iter()
                .map(|s| (s.content_id.clone(), s))
                .collect(),
        }
    }
}

/// JSON file store for entries and stats.
pub struct JsonFileStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl JsonFileStore {
    /// Open (or create) the catalog under `data_dir`.
    pub fn open(data_dir: &Path) -> store::Result<Self> {
        fs::create_dir_all(data_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        let path = data_dir.join(CATALOG_FILE);

        let state = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            let file: CatalogFile = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            State::from_file(file)
        } else {
            State::default()
        };
        info!(
            "Opened catalog at {:?} ({} entries)",
            path,
            state.entries.len()
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, state: &State) -> store::Result<()> {
        let contents = serde_json::to_string_pretty(&state.to_file())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Write then rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        debug!("Saved catalog to {:?}", self.path);
        Ok(())
    }

    fn bump(&self, content_id: &ContentId, apply: impl FnOnce(&mut ContentStats)) -> store::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = state.stats.get(content_id).cloned();
        let record = state
            .stats
            .entry(content_id.clone())
            .or_insert_with(|| ContentStats::new(content_id.clone()));
        apply(record);

        if let Err(e) = self.save(&state) {
            match previous {
                Some(stats) => state.stats.insert(content_id.clone(), stats),
                None => state.stats.remove(content_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Insert `entry` and persist, undoing the insert if the write fails.
    fn insert_entry(&self, state: &mut State, entry: ContentEntry) -> store::Result<()> {
        let locator = entry.source_locator.clone();
        let previous = state.entries.insert(locator.clone(), entry);

        if let Err(e) = self.save(state) {
            match previous {
                Some(entry) => state.entries.insert(locator, entry),
                None => state.entries.remove(&locator),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl EntryStore for JsonFileStore {
    async fn get(&self, source_locator: &str) -> store::Result<Option<ContentEntry>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.entries.get(source_locator).cloned())
    }

    async fn put(&self, entry: ContentEntry) -> store::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.insert_entry(&mut state, entry)
    }

    async fn get_all(&self) -> store::Result<Vec<ContentEntry>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.entries.values().cloned().collect())
    }

    async fn count(&self) -> store::Result<usize> {
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()).entries.len())
    }

    async fn upsert_if_newer(&self, entry: ContentEntry) -> store::Result<UpsertOutcome> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let outcome = match state.entries.get(&entry.source_locator) {
            None => UpsertOutcome::Inserted,
            Some(existing) if entry.supersedes(existing) => UpsertOutcome::Replaced {
                previous_created_at: existing.created_at,
            },
            Some(_) => return Ok(UpsertOutcome::Stale),
        };

        self.insert_entry(&mut state, entry)?;
        Ok(outcome)
    }
}

#[async_trait]
impl StatsStore for JsonFileStore {
    async fn record_search(&self, content_id: &ContentId) -> store::Result<()> {
        self.bump(content_id, |s| s.searches += 1)
    }

    async fn record_download(&self, content_id: &ContentId) -> store::Result<()> {
        self.bump(content_id, |s| s.downloads += 1)
    }

    async fn stats(&self, content_id: &ContentId) -> store::Result<ContentStats> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .stats
            .get(content_id)
            .cloned()
            .unwrap_or_else(|| ContentStats::new(content_id.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOCATOR: &str = "https://forum.example/t/forum-post-123";

    fn entry(descriptor: &str, created_at: u64) -> ContentEntry {
        ContentEntry::new(LOCATOR, descriptor, "alice", created_at)
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store
                .upsert_if_newer(entry("d1", 1000).with_preview(vec![1, 2, 3]))
                .await
                .unwrap();
            store.record_search(&ContentId::new("forum-post-123")).await.unwrap();
        }

        let store = JsonFileStore::open(dir.path()).unwrap();
        let stored = store.get(LOCATOR).await.unwrap().unwrap();
        assert_eq!(stored.descriptor, "d1");
        assert_eq!(stored.preview, Some(vec![1, 2, 3]));
        assert_eq!(
            store
                .stats(&ContentId::new("forum-post-123"))
                .await
                .unwrap()
                .searches,
            1
        );
    }

    #[tokio::test]
    async fn test_upsert_is_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        assert_eq!(
            store.upsert_if_newer(entry("d1", 1000)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_if_newer(entry("d2", 2000)).await.unwrap(),
            UpsertOutcome::Replaced {
                previous_created_at: 1000
            }
        );
        assert_eq!(
            store.upsert_if_newer(entry("tie", 2000)).await.unwrap(),
            UpsertOutcome::Stale
        );
        assert_eq!(
            store.upsert_if_newer(entry("old", 500)).await.unwrap(),
            UpsertOutcome::Stale
        );

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(LOCATOR).await.unwrap().unwrap().descriptor, "d2");
    }

    #[tokio::test]
    async fn test_file_is_pretty_json() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.put(entry("d1", 1000)).await.unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("\n  \"entries\""));
        assert!(contents.contains("\"sourceLocator\""));
        assert!(!dir.path().join("catalog.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        // A directory where the temp file should go makes every write fail.
        fs::create_dir(dir.path().join("catalog.json.tmp")).unwrap();

        assert!(store.put(entry("d1", 1000)).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.record_download(&ContentId::new("x")).await.is_err());
        assert_eq!(store.stats(&ContentId::new("x")).await.unwrap().downloads, 0);
    }

    #[test]
    fn test_corrupt_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CATALOG_FILE), "not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(dir.path()),
            Err(StoreError::Serialization(_))
        ));
    }
}
