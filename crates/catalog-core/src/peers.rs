//! Peer registry: session lifecycle and fan-out.
//!
//! Each transport connection is one `PeerSession`, keyed by the host's
//! connection ID. A session starts `Connecting`, becomes `Open` once the
//! remote handshake names its peer ID, and is removed when it closes. A
//! reconnect is always a new session.

use crate::events::{CatalogEvent, EventBus};
use crate::protocol::WireMessage;
use crate::transport::Channel;
use crate::{PeerId, time};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Unknown session ID: {0}")]
    UnknownSession(String),
    #[error("Session {session_id} cannot open from state {state:?}")]
    InvalidTransition {
        session_id: String,
        state: SessionState,
    },
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Channel open, awaiting handshake
    Connecting,
    /// Handshake complete
    Open,
    /// Terminal
    Closed,
}

/// Reason for disconnection.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Closed locally (shutdown or console)
    UserRequested,
    /// Remote peer closed the connection
    RemoteClosed,
    /// Read side failed
    NetworkError,
    /// A send on the channel failed
    TransportError,
    /// Invalid handshake or protocol violation
    ProtocolError,
    /// Another open session already belongs to the same peer
    Duplicate,
}

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// One transport connection and what we know about the peer behind it.
pub struct PeerSession {
    pub session_id: String,
    /// Known after handshake.
    pub peer_id: Option<PeerId>,
    pub identity: Option<String>,
    channel: Box<dyn Channel>,
    pub direction: ConnectionDirection,
    pub state: SessionState,
    /// When the connect attempt began (ms since epoch)
    pub opened_at: u64,
    /// Last inbound frame or state change (ms since epoch)
    pub last_activity: u64,
    pub disconnect_reason: Option<DisconnectReason>,
}

impl PeerSession {
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("identity", &self.identity)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("opened_at", &self.opened_at)
            .field("last_activity", &self.last_activity)
            .field("disconnect_reason", &self.disconnect_reason)
            .finish_non_exhaustive()
    }
}

/// Result of [`PeerRegistry::session_open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOpen {
    Opened,
    /// The session opened and took over from the peer's previous one,
    /// which was closed as `Duplicate`.
    Replaced { previous_session: String },
    /// The peer already has an open session; the new one was closed.
    Duplicate { existing_session: String },
}

/// Which of two sessions to the same peer survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    CloseNew,
    CloseExisting,
}

/// Pick the surviving session when a peer already has an open one.
///
/// Both ends must agree without talking to each other, so the connection
/// dialed by the lower peer ID wins. Two connections dialed by the same
/// side keep the existing one.
pub fn check_duplicate_session(
    local: PeerId,
    remote: PeerId,
    new_direction: ConnectionDirection,
    existing_direction: ConnectionDirection,
) -> DuplicateCheck {
    if new_direction == existing_direction {
        return DuplicateCheck::CloseNew;
    }
    let preferred = if local < remote {
        ConnectionDirection::Outgoing
    } else {
        ConnectionDirection::Incoming
    };
    if new_direction == preferred {
        DuplicateCheck::CloseExisting
    } else {
        DuplicateCheck::CloseNew
    }
}

/// Registry of live sessions.
///
/// Owned by a single [`Node`](crate::Node); no interior locking.
pub struct PeerRegistry {
    /// Our own peer ID, for duplicate resolution.
    local_peer: PeerId,
    sessions: HashMap<String, PeerSession>,
    /// Open sessions only.
    by_peer: HashMap<PeerId, String>,
    /// Sessions closed by a failed send, awaiting cleanup by the owner.
    dropped: Vec<PeerSession>,
    events: Option<Arc<EventBus>>,
}

impl PeerRegistry {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            dropped: Vec::new(),
            events: None,
        }
    }

    /// Emit `MessageSent` events on this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a new transport connection, before handshake.
    pub fn session_connecting(
        &mut self,
        session_id: impl Into<String>,
        channel: Box<dyn Channel>,
        direction: ConnectionDirection,
        now: u64,
    ) {
        let session_id = session_id.into();
        debug!("Session {} connecting ({:?})", session_id, direction);
        let session = PeerSession {
            session_id: session_id.clone(),
            peer_id: None,
            identity: None,
            channel,
            direction,
            state: SessionState::Connecting,
            opened_at: now,
            last_activity: now,
            disconnect_reason: None,
        };
        if let Some(previous) = self.sessions.insert(session_id, session) {
            warn!("Session ID {} reused, replacing", previous.session_id);
            if previous.is_open() {
                if let Some(peer_id) = previous.peer_id {
                    self.by_peer.remove(&peer_id);
                }
            }
        }
    }

    /// Handshake arrived: move the session to `Open`.
    ///
    /// If the peer already has an open session, [`check_duplicate_session`]
    /// decides which one is closed as `Duplicate`.
    pub async fn session_open(
        &mut self,
        session_id: &str,
        peer_id: PeerId,
        identity: String,
        now: u64,
    ) -> Result<SessionOpen, PeerError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| PeerError::UnknownSession(session_id.to_string()))?;

        if session.state != SessionState::Connecting {
            return Err(PeerError::InvalidTransition {
                session_id: session_id.to_string(),
                state: session.state,
            });
        }

        let direction = session.direction;
        let mut opened = SessionOpen::Opened;
        if let Some(existing) = self.by_peer.get(&peer_id).cloned() {
            let existing_direction = self
                .sessions
                .get(&existing)
                .map(|s| s.direction)
                .unwrap_or(direction);
            match check_duplicate_session(self.local_peer, peer_id, direction, existing_direction) {
                DuplicateCheck::CloseNew => {
                    info!(
                        "Peer {} already connected on session {}, closing {}",
                        peer_id.short(),
                        existing,
                        session_id
                    );
                    self.session_closed(session_id, DisconnectReason::Duplicate, now)
                        .await;
                    return Ok(SessionOpen::Duplicate {
                        existing_session: existing,
                    });
                }
                DuplicateCheck::CloseExisting => {
                    info!(
                        "Peer {} connected again on session {}, closing {}",
                        peer_id.short(),
                        session_id,
                        existing
                    );
                    self.session_closed(&existing, DisconnectReason::Duplicate, now)
                        .await;
                    opened = SessionOpen::Replaced {
                        previous_session: existing,
                    };
                }
            }
        }

        let Some(session) = self.sessions.get_mut(session_id) else {
            return Err(PeerError::UnknownSession(session_id.to_string()));
        };
        session.peer_id = Some(peer_id);
        session.identity = Some(identity);
        session.state = SessionState::Open;
        session.last_activity = now;
        self.by_peer.insert(peer_id, session_id.to_string());

        Ok(opened)
    }

    /// Close and remove a session. Returns it (state `Closed`) if it existed.
    pub async fn session_closed(
        &mut self,
        session_id: &str,
        reason: DisconnectReason,
        now: u64,
    ) -> Option<PeerSession> {
        let session = self.remove_session(session_id, reason, now)?;
        if let Err(e) = session.channel.close().await {
            debug!("Closing session {}: {}", session_id, e);
        }
        Some(session)
    }

    fn remove_session(
        &mut self,
        session_id: &str,
        reason: DisconnectReason,
        now: u64,
    ) -> Option<PeerSession> {
        let mut session = self.sessions.remove(session_id)?;
        if let Some(peer_id) = session.peer_id {
            if self.by_peer.get(&peer_id).map(String::as_str) == Some(session_id) {
                self.by_peer.remove(&peer_id);
            }
        }
        session.state = SessionState::Closed;
        session.disconnect_reason = Some(reason);
        session.last_activity = now;
        Some(session)
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&mut self, reason: DisconnectReason, now: u64) -> Vec<PeerSession> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.session_closed(&id, reason, now).await {
                closed.push(session);
            }
        }
        closed
    }

    /// Sessions closed by failed sends since the last call.
    pub fn take_dropped(&mut self) -> Vec<PeerSession> {
        std::mem::take(&mut self.dropped)
    }

    /// Send to every open session. Returns how many sends succeeded.
    pub async fn broadcast(&mut self, msg: &WireMessage) -> usize {
        self.fan_out(msg, None).await
    }

    /// Send to every open session except the one belonging to `except`.
    pub async fn broadcast_except(&mut self, msg: &WireMessage, except: PeerId) -> usize {
        self.fan_out(msg, Some(except)).await
    }

    async fn fan_out(&mut self, msg: &WireMessage, except: Option<PeerId>) -> usize {
        let targets: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_open() && (except.is_none() || s.peer_id != except))
            .map(|s| s.session_id.clone())
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let Some(frame) = encode(msg) else {
            return 0;
        };

        let mut sent = 0;
        for session_id in targets {
            if self.send_frame(&session_id, &frame).await {
                sent += 1;
            }
        }
        if sent > 0 {
            self.emit_sent(msg, frame.len());
        }
        sent
    }

    /// Send to the open session of `peer_id`.
    pub async fn send_to_peer(&mut self, peer_id: PeerId, msg: &WireMessage) -> bool {
        let Some(session_id) = self.by_peer.get(&peer_id).cloned() else {
            debug!("No open session for peer {}", peer_id.short());
            return false;
        };
        self.send_to_session(&session_id, msg).await
    }

    /// Send to a specific session, whatever its state (handshakes go out
    /// while `Connecting`).
    pub async fn send_to_session(&mut self, session_id: &str, msg: &WireMessage) -> bool {
        let Some(frame) = encode(msg) else {
            return false;
        };
        let ok = self.send_frame(session_id, &frame).await;
        if ok {
            self.emit_sent(msg, frame.len());
        }
        ok
    }

    async fn send_frame(&mut self, session_id: &str, frame: &[u8]) -> bool {
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };

        let result = session.channel.send(frame.to_vec()).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to session {} failed: {}", session_id, e);
                if let Some(dropped) =
                    self.remove_session(session_id, DisconnectReason::TransportError, time::now_ms())
                {
                    self.dropped.push(dropped);
                }
                false
            }
        }
    }

    fn emit_sent(&self, msg: &WireMessage, size: usize) {
        if let Some(events) = &self.events {
            events.emit(CatalogEvent::MessageSent {
                message_type: msg.message_type().to_string(),
                size,
                timestamp: time::now_ms(),
            });
        }
    }

    /// Record inbound activity.
    pub fn touch(&mut self, session_id: &str, now: u64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = now;
        }
    }

    /// Peer IDs with an open session.
    pub fn open_peers(&self) -> Vec<PeerId> {
        self.by_peer.keys().copied().collect()
    }

    pub fn session(&self, session_id: &str) -> Option<&PeerSession> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    /// Peer behind an open session.
    pub fn peer_for_session(&self, session_id: &str) -> Option<PeerId> {
        self.sessions
            .get(session_id)
            .filter(|s| s.is_open())
            .and_then(|s| s.peer_id)
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.by_peer.contains_key(&peer_id)
    }

    pub fn open_count(&self) -> usize {
        self.by_peer.len()
    }
}

fn encode(msg: &WireMessage) -> Option<Vec<u8>> {
    match msg.to_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to encode {} message: {}", msg.message_type(), e);
            None
        }
    }
}
