//! Persistence boundary for entries and usage counters.
//!
//! Implementations:
//! - `InMemoryStore` - For testing and ephemeral nodes
//! - `JsonFileStore` (in catalog-daemon) - Pretty JSON under the data directory

use crate::entry::ContentEntry;
use crate::locator::ContentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of [`EntryStore::upsert_if_newer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entry existed for the locator.
    Inserted,
    /// An older entry was replaced.
    Replaced { previous_created_at: u64 },
    /// The stored entry is as new or newer; nothing was written.
    Stale,
}

impl UpsertOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Stale)
    }
}

/// Entries keyed by source locator, one current version each.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get(&self, source_locator: &str) -> Result<Option<ContentEntry>>;

    /// Unconditional write.
    async fn put(&self, entry: ContentEntry) -> Result<()>;

    async fn get_all(&self) -> Result<Vec<ContentEntry>>;

    async fn count(&self) -> Result<usize>;

    /// Write `entry` if no entry exists for its locator or the stored one has
    /// a strictly smaller `created_at`. Check and write happen atomically.
    async fn upsert_if_newer(&self, entry: ContentEntry) -> Result<UpsertOutcome>;
}

/// Search and download counters for one content ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub content_id: ContentId,
    pub searches: u64,
    pub downloads: u64,
}

impl ContentStats {
    pub fn new(content_id: ContentId) -> Self {
        Self {
            content_id,
            searches: 0,
            downloads: 0,
        }
    }
}

/// Usage counters keyed by content ID.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn record_search(&self, content_id: &ContentId) -> Result<()>;

    async fn record_download(&self, content_id: &ContentId) -> Result<()>;

    /// Counters for `content_id`; zeroes if never recorded.
    async fn stats(&self, content_id: &ContentId) -> Result<ContentStats>;
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, ContentEntry>>,
    stats: RwLock<HashMap<ContentId, ContentStats>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, for exercising error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn bump(&self, content_id: &ContentId, apply: impl FnOnce(&mut ContentStats)) -> Result<()> {
        self.check_writable()?;
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        let record = stats
            .entry(content_id.clone())
            .or_insert_with(|| ContentStats::new(content_id.clone()));
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl EntryStore for InMemoryStore {
    async fn get(&self, source_locator: &str) -> Result<Option<ContentEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(source_locator).cloned())
    }

    async fn put(&self, entry: ContentEntry) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.source_locator.clone(), entry);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ContentEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn upsert_if_newer(&self, entry: ContentEntry) -> Result<UpsertOutcome> {
        self.check_writable()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let outcome = match entries.get(&entry.source_locator) {
            None => UpsertOutcome::Inserted,
            Some(existing) if entry.supersedes(existing) => UpsertOutcome::Replaced {
                previous_created_at: existing.created_at,
            },
            Some(_) => return Ok(UpsertOutcome::Stale),
        };

        entries.insert(entry.source_locator.clone(), entry);
        Ok(outcome)
    }
}

#[async_trait]
impl StatsStore for InMemoryStore {
    async fn record_search(&self, content_id: &ContentId) -> Result<()> {
        self.bump(content_id, |s| s.searches += 1)
    }

    async fn record_download(&self, content_id: &ContentId) -> Result<()> {
        self.bump(content_id, |s| s.downloads += 1)
    }

    async fn stats(&self, content_id: &ContentId) -> Result<ContentStats> {
        let stats = self.stats.read().unwrap_or_else(|e| e.into_inner());
        Ok(stats
            .get(content_id)
            .cloned()
            .unwrap_or_else(|| ContentStats::new(content_id.clone())))
    }
}
