//! Transport boundary for peer-to-peer messaging.
//!
//! The core only ever sends and closes; inbound frames are pushed in by the
//! host's event loop. Implementations:
//! - `MemoryChannel` - In-process channel for tests and embedded meshes
//! - `WsChannel` (in catalog-daemon) - WebSocket connection

use crate::PeerId;
use async_trait::async_trait;
use futures::channel::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A reliable, ordered, message-oriented channel to one remote peer.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Close the channel. Further sends fail.
    async fn close(&self) -> Result<()>;
}

/// Information about a peer we may dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Known peer ID, if any (learned for certain only from the handshake).
    pub peer_id: Option<PeerId>,
    /// Human-readable name (if available)
    pub name: Option<String>,
    /// Connection address (URL)
    pub address: String,
}

impl PeerInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            peer_id: None,
            name: None,
            address: address.into(),
        }
    }
}

/// Source of peer addresses. Connecting to them is the host's job.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn discover_peers(&self) -> Result<Vec<PeerInfo>>;
}

/// In-process channel. Frames sent on it come out of the paired receiver.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.tx.is_closed()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .unbounded_send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.tx.close_channel();
        Ok(())
    }
}
