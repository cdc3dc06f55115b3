//! WebSocket listener for incoming peer connections.
//!
//! Accepting stays on the event loop, but the WebSocket upgrade of each
//! stream runs in its own task under `UPGRADE_TIMEOUT`, so a client that
//! connects and never speaks cannot hold anything up. Finished upgrades
//! come back on a channel and get a fresh session ID there. Handshakes are
//! the node's business.

use crate::connection::{ConnectionEvent, WsChannel};
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// Drop a connection whose upgrade has not finished after this long.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream that completed the WebSocket upgrade.
#[derive(Debug)]
pub struct Upgraded {
    pub addr: SocketAddr,
    pub ws_stream: WebSocketStream<TcpStream>,
}

pub struct WebSocketServer {
    listener: TcpListener,
    /// Counter for generating session IDs
    next_conn_id: u64,
    upgrade_timeout: Duration,
    upgrade_tx: mpsc::UnboundedSender<Upgraded>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl WebSocketServer {
    /// Bind to an address. Port 0 picks a free one.
    pub async fn bind(
        listen_addr: &str,
        upgrade_tx: mpsc::UnboundedSender<Upgraded>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            next_conn_id: 1,
            upgrade_timeout: UPGRADE_TIMEOUT,
            upgrade_tx,
            event_tx,
        })
    }

    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next TCP connection.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Upgrade `stream` in a background task.
    ///
    /// Success is delivered on the upgrade channel. Failures and timeouts
    /// are logged and the stream is dropped.
    pub fn spawn_upgrade(&self, stream: TcpStream, addr: SocketAddr) {
        let upgrade_tx = self.upgrade_tx.clone();
        let limit = self.upgrade_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    let _ = upgrade_tx.send(Upgraded { addr, ws_stream });
                }
                Ok(Err(e)) => {
                    // Health checks (like `nc -z`) connect and immediately close without
                    // completing the WebSocket handshake. Log these as debug, not error.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
                Err(_) => warn!("WebSocket upgrade from {} timed out after {:?}", addr, limit),
            }
        });
    }

    /// Register a finished upgrade under a new session ID.
    pub fn on_upgraded(&mut self, upgraded: Upgraded) -> (String, WsChannel<TcpStream>) {
        let Upgraded { addr, ws_stream } = upgraded;
        let session_id = format!("in-{}", self.next_conn_id);
        self.next_conn_id += 1;
        info!("New connection from {} (session: {})", addr, session_id);

        let channel = WsChannel::spawn(session_id.clone(), ws_stream, self.event_tx.clone());
        (session_id, channel)
    }
}
