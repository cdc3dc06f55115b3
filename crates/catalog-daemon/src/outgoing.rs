//! Outgoing peer connections.
//!
//! Manages connections we initiate to remote peers, including:
//! - A static peer directory read from config and CLI flags
//! - Dialing off the event loop (results come back on a channel)
//! - Automatic reconnection with jittered exponential backoff

use crate::connection::{ConnectionEvent, WsChannel};
use async_trait::async_trait;
use catalog_core::transport::{self, PeerDirectory, PeerInfo};
use catalog_core::{DisconnectReason, PeerId};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

pub type OutgoingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Give up on a single dial attempt after this long.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A session that lasted this long clears the backoff when it closes.
pub const STABLE_SESSION: Duration = Duration::from_secs(30);

/// Peer addresses fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    peers: Vec<PeerInfo>,
}

impl StaticDirectory {
    pub fn new(addresses: impl IntoIterator<Item = String>) -> Self {
        let mut peers: Vec<PeerInfo> = Vec::new();
        for address in addresses {
            if !peers.iter().any(|p| p.address == address) {
                peers.push(PeerInfo::new(address));
            }
        }
        Self { peers }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn discover_peers(&self) -> transport::Result<Vec<PeerInfo>> {
        Ok(self.peers.clone())
    }
}

/// State of an outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Not dialed yet; due on the next tick
    Idle,
    /// A connect attempt is in flight
    Dialing,
    /// WebSocket is up and registered with the node
    Connected,
    /// The peer already has an open session with us; dial again when it closes
    Standby,
    /// Disconnected, waiting to reconnect
    Reconnecting,
    /// Permanently closed (no reconnect)
    Closed,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Up to this fraction of each delay is added at random, so peers that
    /// dropped together do not redial in lockstep
    pub jitter: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Stretch `delay` by a random share of up to `jitter`.
pub fn add_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    use rand::Rng;
    delay.mul_f64(1.0 + rand::rng().random_range(0.0..jitter))
}

/// Reconnection state for a peer.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Attempts since the last session that stayed up
    pub attempts: u32,
    /// When to attempt next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        self.current_delay = add_jitter(calculate_backoff(self.attempts, config), config.jitter);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
    }

    /// Reset state after a session stayed up.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.is_some_and(|t| now_ms >= t)
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config.max_attempts.is_some_and(|max| self.attempts >= max)
    }
}

/// A peer we dial, and where that stands.
#[derive(Debug, Clone)]
pub struct OutgoingPeer {
    pub address: String,
    pub state: OutgoingState,
    /// Session of the current connection, while `Connected`
    pub session_id: Option<String>,
    /// Remote peer whose other session made ours a duplicate
    pub standby_for: Option<PeerId>,
    /// When the current connection came up (ms since epoch)
    pub connected_at: Option<u64>,
    pub reconnect: ReconnectState,
}

impl OutgoingPeer {
    fn new(address: String) -> Self {
        Self {
            address,
            state: OutgoingState::Idle,
            session_id: None,
            standby_for: None,
            connected_at: None,
            reconnect: ReconnectState::new(),
        }
    }

    fn is_due(&self, now_ms: u64) -> bool {
        match self.state {
            OutgoingState::Idle => true,
            OutgoingState::Reconnecting => self.reconnect.should_reconnect(now_ms),
            _ => false,
        }
    }
}

/// Outcome of one spawned dial.
#[derive(Debug)]
pub struct DialResult {
    pub address: String,
    pub result: Result<OutgoingStream, String>,
}

/// Dials the configured peers and keeps them connected.
pub struct Dialer {
    config: ReconnectConfig,
    peers: Vec<OutgoingPeer>,
    next_conn_id: u64,
    dial_tx: mpsc::UnboundedSender<DialResult>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Dialer {
    pub fn new(
        config: ReconnectConfig,
        dial_tx: mpsc::UnboundedSender<DialResult>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            config,
            peers: Vec::new(),
            next_conn_id: 1,
            dial_tx,
            event_tx,
        }
    }

    /// Add every address the directory knows. Returns how many were new.
    pub async fn add_from(&mut self, directory: &dyn PeerDirectory) -> transport::Result<usize> {
        let mut added = 0;
        for info in directory.discover_peers().await? {
            if self.add_peer(info.address) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Returns false if the address is already known.
    pub fn add_peer(&mut self, address: String) -> bool {
        if self.peers.iter().any(|p| p.address == address) {
            return false;
        }
        debug!("Will dial {}", address);
        self.peers.push(OutgoingPeer::new(address));
        true
    }

    pub fn peers(&self) -> &[OutgoingPeer] {
        &self.peers
    }

    fn peer_mut(&mut self, address: &str) -> Option<&mut OutgoingPeer> {
        self.peers.iter_mut().find(|p| p.address == address)
    }

    /// Mark every due peer as dialing and return their addresses.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<String> {
        self.peers
            .iter_mut()
            .filter(|p| p.is_due(now_ms))
            .map(|p| {
                p.state = OutgoingState::Dialing;
                p.address.clone()
            })
            .collect()
    }

    /// Spawn a connect attempt for every due peer.
    pub fn dial_due(&mut self, now_ms: u64) -> usize {
        let due = self.take_due(now_ms);
        for address in &due {
            let address = address.clone();
            let dial_tx = self.dial_tx.clone();
            tokio::spawn(async move {
                debug!("Dialing {}", address);
                let result = match tokio::time::timeout(DIAL_TIMEOUT, connect_async(&address)).await
                {
                    Ok(Ok((ws_stream, _))) => Ok(ws_stream),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", DIAL_TIMEOUT)),
                };
                let _ = dial_tx.send(DialResult { address, result });
            });
        }
        due.len()
    }

    /// Take a finished dial. On success returns the new session's ID and
    /// channel for the node.
    pub fn on_dialed(
        &mut self,
        dialed: DialResult,
        now_ms: u64,
    ) -> Option<(String, WsChannel<MaybeTlsStream<TcpStream>>)> {
        let DialResult { address, result } = dialed;
        match result {
            Ok(ws_stream) => {
                let session_id = format!("out-{}", self.next_conn_id);
                self.next_conn_id += 1;
                let Some(peer) = self.peer_mut(&address) else {
                    debug!("Dropping connection to forgotten peer {}", address);
                    return None;
                };
                info!("Connected to {} (session: {})", address, session_id);
                peer.state = OutgoingState::Connected;
                peer.session_id = Some(session_id.clone());
                peer.standby_for = None;
                peer.connected_at = Some(now_ms);

                let event_tx = self.event_tx.clone();
                let channel = WsChannel::spawn(session_id.clone(), ws_stream, event_tx);
                Some((session_id, channel))
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                self.schedule(&address, now_ms);
                None
            }
        }
    }

    /// The node closed a session. Decide whether its peer gets redialed.
    pub fn on_session_closed(
        &mut self,
        session_id: &str,
        peer_id: Option<PeerId>,
        reason: DisconnectReason,
        now_ms: u64,
    ) {
        if let Some(peer) = self
            .peers
            .iter_mut()
            .find(|p| p.session_id.as_deref() == Some(session_id))
        {
            peer.session_id = None;
            let stable = STABLE_SESSION.as_millis() as u64;
            if peer.connected_at.take().is_some_and(|at| now_ms.saturating_sub(at) >= stable) {
                peer.reconnect.reset();
            }
            let address = peer.address.clone();
            match reason {
                DisconnectReason::UserRequested | DisconnectReason::ProtocolError => {
                    info!("Not redialing {} ({:?})", address, reason);
                    peer.state = OutgoingState::Closed;
                }
                DisconnectReason::Duplicate => {
                    debug!("{} is already connected, standing by", address);
                    peer.state = OutgoingState::Standby;
                    peer.standby_for = peer_id;
                }
                _ => self.schedule(&address, now_ms),
            }
            return;
        }

        // The session that made one of ours a duplicate went away. A
        // duplicate being closed is not that session.
        let Some(peer_id) = peer_id else {
            return;
        };
        if reason == DisconnectReason::Duplicate {
            return;
        }
        let waiting: Vec<String> = self
            .peers
            .iter()
            .filter(|p| p.state == OutgoingState::Standby && p.standby_for == Some(peer_id))
            .map(|p| p.address.clone())
            .collect();
        for address in waiting {
            self.schedule(&address, now_ms);
        }
    }

    fn schedule(&mut self, address: &str, now_ms: u64) {
        let config = self.config.clone();
        let Some(peer) = self.peer_mut(address) else {
            return;
        };
        peer.standby_for = None;
        peer.reconnect.schedule_reconnect(now_ms, &config);
        if peer.reconnect.exceeded_max_attempts(&config) {
            warn!(
                "Giving up on {} after {} attempts",
                peer.address, peer.reconnect.attempts
            );
            peer.state = OutgoingState::Closed;
            return;
        }
        peer.state = OutgoingState::Reconnecting;
        info!(
            "Scheduled reconnect to {} in {:?} (attempt {})",
            peer.address, peer.reconnect.current_delay, peer.reconnect.attempts
        );
    }
}
