//! WebSocket connection to a WalletConnect v1 bridge server.
//!
//! The bridge speaks JSON text frames `{topic, type, payload, silent}`. One
//! writer task owns the sink; one reader task turns inbound frames into
//! [`TransportEvent`]s for the session that built the transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use wc_bridge::{
    Error, Message, MessageType, Result, Transport, TransportBuilder, TransportEvent,
    TransportStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Frame {
    topic: String,
    #[serde(rename = "type")]
    kind: MessageType,
    payload: String,
    #[serde(default)]
    silent: bool,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Self {
            topic: message.topic,
            kind: message.kind,
            payload: message.payload,
            silent: true,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self {
            topic: frame.topic,
            kind: frame.kind,
            payload: frame.payload,
        }
    }
}

/// Bridge URLs in pairing URIs are `http(s)`; the socket lives at the same address.
pub fn socket_url(bridge: &str) -> String {
    if let Some(rest) = bridge.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = bridge.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        bridge.to_string()
    }
}

/// How long `close` waits for queued frames to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct Connection {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    writer: JoinHandle<()>,
}

pub struct WsTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
    /// Bumped on every connect and close so a finished reader from an older
    /// connection does not report a disconnect for the current one.
    generation: Arc<AtomicU64>,
}

impl WsTransport {
    pub fn new(bridge: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            url: socket_url(bridge),
            events,
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<bool> {
        let mut connection = self.connection.lock().await;
        if self.is_connected() && connection.is_some() {
            return Ok(false);
        }
        // The bridge dropped the socket; the reader already reported it.
        if let Some(stale) = connection.take() {
            drop(stale.outgoing);
            stale.writer.abort();
        }

        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.url, "bridge connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("bridge write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });
        *connection = Some(Connection {
            outgoing: tx,
            writer,
        });

        let events = self.events.clone();
        let connected = self.connected.clone();
        let current = self.generation.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if events.send(TransportEvent::Message(frame.into())).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("ignoring bridge frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("bridge read failed: {}", e);
                        break;
                    }
                }
            }
            if current.load(Ordering::SeqCst) == generation {
                connected.store(false, Ordering::SeqCst);
                info!(url = %url, "bridge disconnected");
                let _ = events.send(TransportEvent::Status(TransportStatus::Disconnected));
            }
        });

        let _ = self
            .events
            .send(TransportEvent::Status(TransportStatus::Connected));
        Ok(true)
    }

    async fn send(&self, message: Message) -> Result<()> {
        let text = serde_json::to_string(&Frame::from(message))?;
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;
        connection
            .outgoing
            .send(WsMessage::Text(text))
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(connection.outgoing);
        if tokio::time::timeout(FLUSH_TIMEOUT, connection.writer).await.is_err() {
            warn!(url = %self.url, "gave up flushing frames to the bridge");
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Status(TransportStatus::Disconnected));
    }
}

/// Builds a [`WsTransport`] per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransportBuilder;

impl TransportBuilder for WsTransportBuilder {
    fn build(
        &self,
        bridge: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport> {
        Arc::new(WsTransport::new(bridge, events))
    }
}
