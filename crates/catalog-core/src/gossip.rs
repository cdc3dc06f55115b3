//! Gossip engine: deduplicated propagation and last-writer-wins receipt.
//!
//! Outbound, each entry version (see [`EntryId`]) is broadcast at most once
//! while it is remembered in the known set. Inbound, the store's atomic
//! `upsert_if_newer` decides whether the entry is kept; only a strictly newer
//! `created_at` replaces what is stored.

use crate::PeerId;
use crate::entry::{ContentEntry, EntryId};
use crate::locator::ContentId;
use crate::peers::PeerRegistry;
use crate::protocol::{EntryCodec, StructuredCodec, WireMessage};
use crate::store::{EntryStore, StoreError, UpsertOutcome};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default bound on remembered entry IDs.
pub const DEFAULT_KNOWN_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What happened to a received entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored. `replaced` is the `created_at` of the version it superseded.
    Accepted { replaced: Option<u64> },
    /// An equal or newer version is already stored.
    Stale,
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Bounded set of entry IDs, evicting the oldest insertion first.
#[derive(Debug)]
pub struct KnownEntries {
    capacity: usize,
    ids: HashSet<EntryId>,
    order: VecDeque<EntryId>,
}

impl KnownEntries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false if already present.
    pub fn insert(&mut self, id: EntryId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct GossipEngine<S> {
    store: Arc<S>,
    codec: Box<dyn EntryCodec>,
    known: KnownEntries,
}

impl<S: EntryStore> GossipEngine<S> {
    pub fn new(store: Arc<S>, codec: Box<dyn EntryCodec>, known_capacity: usize) -> Self {
        Self {
            store,
            codec,
            known: KnownEntries::new(known_capacity),
        }
    }

    /// Engine that always sends the structured form.
    pub fn structured(store: Arc<S>, known_capacity: usize) -> Self {
        Self::new(store, Box::new(StructuredCodec), known_capacity)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn is_known(&self, id: &EntryId) -> bool {
        self.known.contains(id)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// The message carrying `entry` in the active codec, or the structured
    /// form if encoding fails.
    pub fn entry_message(&self, entry: &ContentEntry) -> WireMessage {
        match self.codec.encode(entry) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "{} encoding failed for {}, sending structured: {}",
                    self.codec.name(),
                    entry.source_locator,
                    e
                );
                WireMessage::Entry {
                    entry: entry.clone(),
                }
            }
        }
    }

    /// Broadcast `entry` to every open session unless this version was
    /// already propagated. Returns whether a broadcast happened.
    pub async fn propagate_entry(
        &mut self,
        entry: &ContentEntry,
        registry: &mut PeerRegistry,
    ) -> bool {
        let id = entry.entry_id();
        if !self.known.insert(id) {
            debug!("Entry {} already propagated", id);
            return false;
        }

        let msg = self.entry_message(entry);
        let sent = registry.broadcast(&msg).await;
        debug!("Propagated entry {} to {} peers", id, sent);
        true
    }

    /// Apply a remote entry under last-writer-wins.
    ///
    /// A store failure leaves the entry unknown so a later delivery retries.
    pub async fn receive_entry(&mut self, entry: ContentEntry) -> Result<ReceiveOutcome, GossipError> {
        let id = entry.entry_id();
        let outcome = match self.store.upsert_if_newer(entry).await? {
            UpsertOutcome::Inserted => ReceiveOutcome::Accepted { replaced: None },
            UpsertOutcome::Replaced {
                previous_created_at,
            } => ReceiveOutcome::Accepted {
                replaced: Some(previous_created_at),
            },
            UpsertOutcome::Stale => ReceiveOutcome::Stale,
        };

        self.known.insert(id);
        Ok(outcome)
    }

    /// Forward an accepted entry to every open session except its sender.
    pub async fn relay_entry(
        &self,
        entry: &ContentEntry,
        except: PeerId,
        registry: &mut PeerRegistry,
    ) -> usize {
        let msg = self.entry_message(entry);
        registry.broadcast_except(&msg, except).await
    }

    /// Stored entries whose locator maps to `content_id`.
    pub async fn entries_for(&self, content_id: &ContentId) -> Result<Vec<ContentEntry>, GossipError> {
        let entries = self.store.get_all().await?;
        Ok(entries
            .into_iter()
            .filter(|e| &e.content_id() == content_id)
            .collect())
    }
}
