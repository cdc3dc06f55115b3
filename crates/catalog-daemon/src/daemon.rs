//! The daemon's event loop.
//!
//! One task owns the `Node` and everything that feeds it: the listener,
//! connection read tasks, the dialer, the console, and the query grace
//! timers. Everything else talks to it through channels, and nothing that
//! waits on a remote peer runs inline: upgrades and dials are spawned and
//! report back.

use crate::commands;
use crate::config::Config;
use crate::connection::ConnectionEvent;
use crate::outgoing::{DialResult, Dialer, StaticDirectory};
use crate::server::{Upgraded, WebSocketServer};
use anyhow::Result;
use catalog_core::store::{EntryStore, StatsStore};
use catalog_core::{
    CatalogEvent, ConnectionDirection, ContentId, DisconnectReason, Node, NodeError, PeerId,
    Subscription, time,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often due reconnects are checked.
const DIAL_TICK: Duration = Duration::from_secs(1);

/// A session the node closed, as seen by the dialer.
#[derive(Debug)]
struct ClosedSession {
    session_id: String,
    peer_id: Option<PeerId>,
    reason: DisconnectReason,
}

/// The console side of a running daemon: lines in, text out.
pub struct Console {
    pub commands: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<String>,
}

pub struct Daemon<S> {
    node: Node<S>,
    server: WebSocketServer,
    upgrade_rx: mpsc::UnboundedReceiver<Upgraded>,
    dialer: Dialer,
    query_grace: Duration,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    dial_rx: mpsc::UnboundedReceiver<DialResult>,
    closed_rx: mpsc::UnboundedReceiver<ClosedSession>,
    grace_tx: mpsc::UnboundedSender<ContentId>,
    grace_rx: mpsc::UnboundedReceiver<ContentId>,
    console_rx: mpsc::UnboundedReceiver<String>,
    output_tx: mpsc::UnboundedSender<String>,
    _closed_sub: Subscription,
}

impl<S> Daemon<S>
where
    S: EntryStore + StatsStore + 'static,
{
    /// Build the node, re-announce stored content, bind the listener and
    /// queue the configured peers for dialing.
    pub async fn start(config: &Config, store: Arc<S>) -> Result<(Self, Console)> {
        let mut node = Node::new(config.to_node_config()?, store);
        node.reannounce_stored().await?;

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (upgrade_tx, upgrade_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        let (commands_tx, console_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let server = WebSocketServer::bind(&config.listen, upgrade_tx, conn_tx.clone()).await?;

        let mut dialer = Dialer::new(config.reconnect_config(), dial_tx, conn_tx);
        let added = dialer
            .add_from(&StaticDirectory::new(config.peers.iter().cloned()))
            .await?;
        if added > 0 {
            info!("Dialing {} configured peers", added);
        }

        let closed_sub = node.events().subscribe(move |event| {
            if let CatalogEvent::SessionClosed {
                session_id,
                peer_id,
                reason,
            } = event
            {
                let _ = closed_tx.send(ClosedSession {
                    session_id,
                    peer_id,
                    reason,
                });
            }
        });

        let daemon = Self {
            node,
            server,
            upgrade_rx,
            dialer,
            query_grace: Duration::from_millis(config.query_grace_ms),
            conn_rx,
            dial_rx,
            closed_rx,
            grace_tx,
            grace_rx,
            console_rx,
            output_tx,
            _closed_sub: closed_sub,
        };
        let console = Console {
            commands: commands_tx,
            output: output_rx,
        };
        Ok((daemon, console))
    }

    pub fn node(&self) -> &Node<S> {
        &self.node
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Run until `shutdown` resolves, then close every session.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut tick = tokio::time::interval(DIAL_TICK);
        tokio::pin!(shutdown);

        info!("Daemon running as {} ({})", self.node.identity(), self.node.peer_id());

        loop {
            tokio::select! {
                result = self.server.accept() => {
                    match result {
                        Ok((stream, addr)) => self.server.spawn_upgrade(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(upgraded) = self.upgrade_rx.recv() => {
                    let (session_id, channel) = self.server.on_upgraded(upgraded);
                    self.node
                        .add_session(&session_id, Box::new(channel), ConnectionDirection::Incoming)
                        .await;
                }

                Some(event) = self.conn_rx.recv() => {
                    self.on_connection_event(event).await;
                }

                Some(dialed) = self.dial_rx.recv() => {
                    self.on_dialed(dialed).await;
                }

                Some(closed) = self.closed_rx.recv() => {
                    self.dialer.on_session_closed(
                        &closed.session_id,
                        closed.peer_id,
                        closed.reason,
                        time::now_ms(),
                    );
                }

                Some(content_id) = self.grace_rx.recv() => {
                    let sent = self.node.request_entries(&content_id).await;
                    if sent > 0 {
                        info!("Requested {} from {} holders", content_id, sent);
                    }
                }

                Some(line) = self.console_rx.recv() => {
                    self.on_console_line(&line).await;
                }

                _ = tick.tick() => {
                    self.dialer.dial_due(time::now_ms());
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Shutting down");
        self.node.shutdown().await;
    }

    async fn on_dialed(&mut self, dialed: DialResult) {
        if let Some((session_id, channel)) = self.dialer.on_dialed(dialed, time::now_ms()) {
            self.node
                .add_session(&session_id, Box::new(channel), ConnectionDirection::Outgoing)
                .await;
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { session_id, data } => {
                match self.node.handle_frame(&session_id, &data).await {
                    Ok(()) => {}
                    // Frames racing a close land here.
                    Err(NodeError::Peer(e)) => debug!("Dropped frame on {}: {}", session_id, e),
                    Err(e) => warn!("Dropped frame on {}: {}", session_id, e),
                }
            }
            ConnectionEvent::Closed { session_id, error } => {
                let reason = if error {
                    DisconnectReason::NetworkError
                } else {
                    DisconnectReason::RemoteClosed
                };
                info!("Connection {} closed ({:?})", session_id, reason);
                self.node.remove_session(&session_id, reason).await;
            }
        }
    }

    async fn on_console_line(&mut self, line: &str) {
        let command = match commands::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                let _ = self.output_tx.send(e.to_string());
                return;
            }
        };

        let output = commands::execute(&mut self.node, command).await;
        let _ = self.output_tx.send(output.text);

        if let Some(content_id) = output.follow_up {
            self.schedule_request(content_id);
        }
    }

    /// Request entries for `content_id` once peers had time to answer.
    fn schedule_request(&self, content_id: ContentId) {
        let grace_tx = self.grace_tx.clone();
        let delay = self.query_grace;
        debug!("Requesting {} in {:?}", content_id, delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = grace_tx.send(content_id);
        });
    }
}
