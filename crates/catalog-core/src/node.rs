//! `Node`: one catalog peer.
//!
//! Owns a registry, content index, gossip engine and presence tracker, and
//! routes every inbound frame to the right one. Hosts drive it from a single
//! event loop:
//!
//! 1. `add_session` when a transport connection opens (sends our handshake)
//! 2. `handle_frame` for each inbound frame
//! 3. `remove_session` when the connection closes
//!
//! Local operations (`publish`, `search`, `request_entries`) go through the
//! same object. Nothing here sleeps or spawns; timing is the host's job.

use crate::content_index::ContentIndex;
use crate::entry::ContentEntry;
use crate::events::{CatalogEvent, EventBus};
use crate::gossip::{DEFAULT_KNOWN_CAPACITY, GossipEngine, GossipError, ReceiveOutcome};
use crate::locator::{self, ContentId};
use crate::peers::{
    ConnectionDirection, DisconnectReason, PeerError, PeerRegistry, PeerSession, SessionOpen,
    SessionState,
};
use crate::presence::PresenceTracker;
use crate::protocol::{
    CodecError, Handshake, ProtocolError, WireMessage, decode_entry_binary, select_codec,
};
use crate::store::{ContentStats, EntryStore, StatsStore, StoreError, UpsertOutcome};
use crate::transport::{Channel, TransportError};
use crate::{PeerId, time};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Gossip(#[from] GossipError),
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Human-readable identity announced in handshakes.
    pub identity: String,
    pub peer_id: PeerId,
    /// Send entries in the compact binary form when its self-test passes.
    pub prefer_binary: bool,
    /// Bound on remembered entry versions.
    pub known_entries_capacity: usize,
    /// Forward accepted remote entries to the other open sessions.
    pub relay_entries: bool,
}

impl NodeConfig {
    /// Defaults with a freshly generated peer ID.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            peer_id: PeerId::generate(),
            prefer_binary: true,
            known_entries_capacity: DEFAULT_KNOWN_CAPACITY,
            relay_entries: true,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }
}

/// Local search hits plus the content ID that was queried on the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub content_id: ContentId,
    /// Newest first.
    pub entries: Vec<ContentEntry>,
}

pub struct Node<S> {
    config: NodeConfig,
    events: Arc<EventBus>,
    registry: PeerRegistry,
    index: ContentIndex,
    gossip: GossipEngine<S>,
    presence: PresenceTracker,
}

impl<S: EntryStore + StatsStore> Node<S> {
    pub fn new(config: NodeConfig, store: Arc<S>) -> Self {
        let events = Arc::new(EventBus::new());
        let codec = select_codec(config.prefer_binary);
        info!(
            "Node {} ({}) using {} codec",
            config.peer_id,
            config.identity,
            codec.name()
        );

        Self {
            registry: PeerRegistry::new(config.peer_id).with_events(Arc::clone(&events)),
            index: ContentIndex::new(config.peer_id),
            gossip: GossipEngine::new(store, codec, config.known_entries_capacity),
            presence: PresenceTracker::new(&config.identity, config.peer_id, time::now_ms())
                .with_events(Arc::clone(&events)),
            events,
            config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.config.peer_id
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn index(&self) -> &ContentIndex {
        &self.index
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn gossip(&self) -> &GossipEngine<S> {
        &self.gossip
    }

    pub fn store(&self) -> &Arc<S> {
        self.gossip.store()
    }

    /// Shorthand for `index().find_peers`.
    pub fn find_peers(&self, content_id: &ContentId) -> Vec<PeerId> {
        self.index.find_peers(content_id)
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Register a new transport connection and send our handshake on it.
    ///
    /// Returns false if the handshake could not be sent (the session is
    /// already gone in that case).
    pub async fn add_session(
        &mut self,
        session_id: &str,
        channel: Box<dyn Channel>,
        direction: ConnectionDirection,
    ) -> bool {
        let now = time::now_ms();
        self.registry
            .session_connecting(session_id, channel, direction, now);

        let handshake = WireMessage::Handshake(Handshake::new(
            self.config.peer_id,
            self.config.identity.clone(),
        ));
        let sent = self.registry.send_to_session(session_id, &handshake).await;
        self.cleanup_dropped().await;
        sent
    }

    /// The transport reported the connection closed.
    pub async fn remove_session(&mut self, session_id: &str, reason: DisconnectReason) {
        if let Some(session) = self
            .registry
            .session_closed(session_id, reason, time::now_ms())
            .await
        {
            self.on_session_closed(session);
        }
    }

    /// Close every session.
    pub async fn shutdown(&mut self) {
        let closed = self
            .registry
            .close_all(DisconnectReason::UserRequested, time::now_ms())
            .await;
        for session in closed {
            self.on_session_closed(session);
        }
        self.cleanup_dropped().await;
    }

    fn on_session_closed(&mut self, session: PeerSession) {
        let reason = session
            .disconnect_reason
            .unwrap_or(DisconnectReason::RemoteClosed);

        if let Some(peer_id) = session.peer_id {
            let removed = self.index.remove_peer(peer_id);
            debug!(
                "Session {} closed ({:?}), dropped {} claims of {}",
                session.session_id,
                reason,
                removed,
                peer_id.short()
            );
            if let Some(identity) = self.presence.get_user_by_peer_id(peer_id).map(str::to_string) {
                self.presence.set_offline(&identity, session.last_activity);
            }
        } else {
            debug!("Session {} closed before handshake ({:?})", session.session_id, reason);
        }

        self.events.emit(CatalogEvent::SessionClosed {
            session_id: session.session_id,
            peer_id: session.peer_id,
            reason,
        });
    }

    /// Run close bookkeeping for sessions a failed send dropped.
    async fn cleanup_dropped(&mut self) {
        for session in self.registry.take_dropped() {
            if let Err(e) = session.channel().close().await {
                debug!("Closing dropped session {}: {}", session.session_id, e);
            }
            self.on_session_closed(session);
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decode and dispatch one inbound frame.
    ///
    /// Errors mean the frame was dropped; the session and the node keep
    /// running.
    pub async fn handle_frame(&mut self, session_id: &str, frame: &[u8]) -> Result<()> {
        let result = self.dispatch_frame(session_id, frame).await;
        self.cleanup_dropped().await;
        result
    }

    async fn dispatch_frame(&mut self, session_id: &str, frame: &[u8]) -> Result<()> {
        let now = time::now_ms();
        let msg = WireMessage::from_json(frame)?;

        let session = self
            .registry
            .session(session_id)
            .ok_or_else(|| PeerError::UnknownSession(session_id.to_string()))?;
        let state = session.state;
        self.registry.touch(session_id, now);

        self.events.emit(CatalogEvent::MessageReceived {
            message_type: msg.message_type().to_string(),
            size: frame.len(),
            timestamp: now,
        });

        if state == SessionState::Connecting {
            return match msg {
                WireMessage::Handshake(handshake) => {
                    self.handle_handshake(session_id, handshake, now).await
                }
                other => Err(ProtocolError::HandshakeRequired(other.message_type()).into()),
            };
        }

        let Some(from) = self.registry.peer_for_session(session_id) else {
            return Err(PeerError::UnknownSession(session_id.to_string()).into());
        };
        if let Some(identity) = self.presence.get_user_by_peer_id(from).map(str::to_string) {
            self.presence.update_last_seen(&identity, now);
        }

        match msg {
            WireMessage::Handshake(_) => {
                debug!("Ignoring repeated handshake on session {}", session_id);
                Ok(())
            }
            WireMessage::Entry { entry } => self.on_entry(entry, from).await,
            WireMessage::EntryBinary { binary, preview } => {
                let entry = decode_entry_binary(&binary, preview)?;
                self.on_entry(entry, from).await
            }
            WireMessage::Announce {
                content_id,
                peer_id,
            } => {
                if peer_id != from {
                    warn!(
                        "Session {} announced on behalf of {}, ignoring",
                        session_id,
                        peer_id.short()
                    );
                    return Ok(());
                }
                self.index.handle_announcement(content_id, peer_id);
                Ok(())
            }
            WireMessage::Query {
                content_id,
                requester_id,
            } => {
                self.index
                    .handle_query(content_id, requester_id, &mut self.registry)
                    .await;
                Ok(())
            }
            WireMessage::RequestEntry { content_id } => {
                self.handle_request_entry(content_id, from).await
            }
        }
    }

    async fn handle_handshake(
        &mut self,
        session_id: &str,
        handshake: Handshake,
        now: u64,
    ) -> Result<()> {
        if handshake.should_warn_version() {
            warn!(
                "Peer {} speaks protocol version {}",
                handshake.peer_id.short(),
                handshake.version
            );
        }

        if handshake.peer_id == self.config.peer_id {
            warn!("Session {} is a connection to ourselves, closing", session_id);
            self.remove_session(session_id, DisconnectReason::ProtocolError)
                .await;
            return Ok(());
        }

        let opened = self
            .registry
            .session_open(session_id, handshake.peer_id, handshake.identity.clone(), now)
            .await?;

        match opened {
            SessionOpen::Opened => {}
            SessionOpen::Replaced { previous_session } => {
                // The peer is still connected, so its claims and presence stay.
                self.events.emit(CatalogEvent::SessionClosed {
                    session_id: previous_session,
                    peer_id: Some(handshake.peer_id),
                    reason: DisconnectReason::Duplicate,
                });
            }
            SessionOpen::Duplicate { .. } => {
                self.events.emit(CatalogEvent::SessionClosed {
                    session_id: session_id.to_string(),
                    peer_id: Some(handshake.peer_id),
                    reason: DisconnectReason::Duplicate,
                });
                return Ok(());
            }
        }

        info!(
            "Session {} open with {} ({})",
            session_id,
            handshake.identity,
            handshake.peer_id.short()
        );
        self.presence
            .set_online(&handshake.identity, handshake.peer_id, now);
        self.index
            .bootstrap_peer(handshake.peer_id, &mut self.registry)
            .await;

        let direction = self
            .registry
            .session(session_id)
            .map(|s| s.direction)
            .unwrap_or(ConnectionDirection::Incoming);
        self.events.emit(CatalogEvent::SessionOpened {
            session_id: session_id.to_string(),
            peer_id: handshake.peer_id,
            identity: handshake.identity,
            direction,
        });
        Ok(())
    }

    async fn on_entry(&mut self, entry: ContentEntry, from: PeerId) -> Result<()> {
        let outcome = match self.gossip.receive_entry(entry.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to store entry {}: {}", entry.source_locator, e);
                return Err(e.into());
            }
        };

        let ReceiveOutcome::Accepted { replaced } = outcome else {
            debug!(
                "Discarding stale entry {} ({})",
                entry.source_locator, entry.created_at
            );
            return Ok(());
        };

        match replaced {
            Some(previous) => info!(
                "Updated {} from {}: {} -> {}",
                entry.source_locator,
                from.short(),
                previous,
                entry.created_at
            ),
            None => info!("New entry {} from {}", entry.source_locator, from.short()),
        }

        let content_id = entry.content_id();
        self.index
            .announce_content(content_id.clone(), &mut self.registry)
            .await;
        self.events.emit(CatalogEvent::EntryAccepted {
            source_locator: entry.source_locator.clone(),
            content_id,
            created_at: entry.created_at,
            from: Some(from),
        });

        if self.config.relay_entries {
            self.gossip
                .relay_entry(&entry, from, &mut self.registry)
                .await;
        }
        Ok(())
    }

    /// Send the holder's stored entries for `content_id` to `requester`.
    async fn handle_request_entry(&mut self, content_id: ContentId, requester: PeerId) -> Result<()> {
        let entries = self.gossip.entries_for(&content_id).await?;
        debug!(
            "Peer {} requested {}: sending {} entries",
            requester.short(),
            content_id,
            entries.len()
        );
        for entry in &entries {
            let msg = self.gossip.entry_message(entry);
            if !self.registry.send_to_peer(requester, &msg).await {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    /// Store a locally created entry, claim its content and gossip it.
    pub async fn publish(&mut self, entry: ContentEntry) -> Result<UpsertOutcome> {
        let outcome = self.store().upsert_if_newer(entry.clone()).await?;
        if !outcome.is_accepted() {
            info!(
                "Not publishing {}: a newer version is stored",
                entry.source_locator
            );
            return Ok(outcome);
        }

        let content_id = entry.content_id();
        info!("Publishing {} as {}", entry.source_locator, content_id);
        self.index
            .announce_content(content_id.clone(), &mut self.registry)
            .await;
        self.gossip.propagate_entry(&entry, &mut self.registry).await;
        self.events.emit(CatalogEvent::EntryAccepted {
            source_locator: entry.source_locator,
            content_id,
            created_at: entry.created_at,
            from: None,
        });

        self.cleanup_dropped().await;
        Ok(outcome)
    }

    /// Search the local store and ask the mesh who holds the content.
    ///
    /// Locators match by substring or slug; free text matches locator or
    /// title, case-insensitively.
    pub async fn search(&mut self, query: &str) -> Result<SearchResults> {
        let query = query.trim();
        let by_locator = locator::is_locator(query);
        let content_id = if by_locator {
            ContentId::from_locator(query)
        } else {
            ContentId::from_query(query)
        };

        let needle = query.to_lowercase();
        let mut entries: Vec<ContentEntry> = self
            .store()
            .get_all()
            .await?
            .into_iter()
            .filter(|e| {
                if by_locator {
                    e.source_locator.contains(query) || e.content_id().contains(&content_id)
                } else {
                    e.source_locator.to_lowercase().contains(&needle)
                        || e.title.to_lowercase().contains(&needle)
                }
            })
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Err(e) = self.store().record_search(&content_id).await {
            warn!("Failed to record search for {}: {}", content_id, e);
        }

        self.index
            .query_content(content_id.clone(), &mut self.registry)
            .await;
        self.cleanup_dropped().await;

        Ok(SearchResults {
            content_id,
            entries,
        })
    }

    /// Ask every connected holder of `content_id` for its entries.
    ///
    /// Hosts call this a short while after `search`, once query answers had
    /// time to arrive. Returns how many requests were sent.
    pub async fn request_entries(&mut self, content_id: &ContentId) -> usize {
        let mut sent = 0;
        for peer_id in self.index.find_peers(content_id) {
            if peer_id == self.config.peer_id || !self.registry.is_connected(peer_id) {
                continue;
            }
            let msg = WireMessage::RequestEntry {
                content_id: content_id.clone(),
            };
            if self.registry.send_to_peer(peer_id, &msg).await {
                sent += 1;
            }
        }
        debug!("Requested {} from {} peers", content_id, sent);
        self.cleanup_dropped().await;
        sent
    }

    /// Count a completed download of `content_id`.
    pub async fn record_download(&self, content_id: &ContentId) -> Result<()> {
        self.store().record_download(content_id).await?;
        Ok(())
    }

    pub async fn stats(&self, content_id: &ContentId) -> Result<ContentStats> {
        Ok(self.store().stats(content_id).await?)
    }

    /// Claim the content of every stored entry. Run once at startup so
    /// bootstrap pushes cover persisted content.
    pub async fn reannounce_stored(&mut self) -> Result<usize> {
        let mut ids: Vec<ContentId> = self
            .store()
            .get_all()
            .await?
            .iter()
            .map(ContentEntry::content_id)
            .collect();
        ids.sort();
        ids.dedup();

        for content_id in &ids {
            self.index
                .announce_content(content_id.clone(), &mut self.registry)
                .await;
        }
        info!("Re-announced {} stored content IDs", ids.len());
        self.cleanup_dropped().await;
        Ok(ids.len())
    }
}
