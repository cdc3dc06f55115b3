//! WebSocket connection to one peer.
//!
//! Each connection is split: the write half becomes a `Channel` the node
//! sends on, and a read task forwards inbound frames to the event loop.

use async_trait::async_trait;
use catalog_core::protocol::MAX_MESSAGE_SIZE;
use catalog_core::transport::{self, Channel, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Received a frame from the peer
    Frame { session_id: String, data: Vec<u8> },
    /// The remote side closed, or the stream failed
    Closed { session_id: String, error: bool },
}

/// The write half of a WebSocket, usable as a session channel.
pub struct WsChannel<S> {
    session_id: String,
    write: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    read_task: JoinHandle<()>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split `ws_stream` and spawn the read task.
    pub fn spawn(
        session_id: String,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let read_session = session_id.clone();
        let read_task = tokio::spawn(async move {
            read_loop(read_session, read, event_tx).await;
        });

        Self {
            session_id,
            write: Mutex::new(write),
            read_task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

async fn read_loop<S>(
    session_id: String,
    mut read: SplitStream<WebSocketStream<S>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut failed = false;
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame on {}", session_id);
                        break;
                    }
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Frame on {} exceeds max size ({} > {}), dropping",
                        session_id,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                let event = ConnectionEvent::Frame {
                    session_id: session_id.clone(),
                    data,
                };
                if event_tx.send(event).is_err() {
                    // Event loop is gone.
                    return;
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", session_id);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", session_id, e);
                        failed = true;
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", session_id);
                break;
            }
        }
    }

    let _ = event_tx.send(ConnectionEvent::Closed {
        session_id,
        error: failed,
    });
}

/// JSON frames go out as text; anything else as binary.
fn to_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: Vec<u8>) -> transport::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> transport::Result<()> {
        let mut write = self.write.lock().await;
        let result = write.send(Message::Close(None)).await;
        self.read_task.abort();
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(e.to_string())),
        }
    }
}

impl<S> Drop for WsChannel<S> {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
