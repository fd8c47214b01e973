use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Sub,
    Pub,
}

/// A frame exchanged with the relay. `payload` is an encrypted envelope for
/// `pub` and empty for `sub`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: String,
}

impl Message {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            kind: MessageType::Sub,
            payload: String::new(),
        }
    }

    pub fn publish(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            kind: MessageType::Pub,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(TransportStatus),
    Message(Message),
}

/// Moves frames to and from one relay.
///
/// Inbound frames and status changes are delivered on the channel handed to
/// [`TransportBuilder::build`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns `true` when a new connection was started, `false` when one is
    /// already up.
    async fn connect(&self) -> Result<bool>;

    async fn send(&self, message: Message) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

pub trait TransportBuilder: Send + Sync {
    fn build(
        &self,
        bridge: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport>;
}

/// In-process relay for tests and embedding.
///
/// Routes `pub` frames to every transport subscribed to the topic and buffers
/// frames for topics nobody listens on yet, the way a bridge server does.
pub mod memory {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing::debug;

    #[derive(Default)]
    struct RelayState {
        subscribers: HashMap<String, Vec<mpsc::UnboundedSender<TransportEvent>>>,
        pending: HashMap<String, Vec<Message>>,
        sent: Vec<Message>,
        fail_sends: bool,
        /// Live flag and event channel of every transport built by this relay.
        connections: Vec<(Arc<AtomicBool>, mpsc::UnboundedSender<TransportEvent>)>,
    }

    #[derive(Clone, Default)]
    pub struct MemoryRelay {
        state: Arc<Mutex<RelayState>>,
    }

    impl MemoryRelay {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every `pub` frame the relay accepted, in order.
        pub fn published(&self) -> Vec<Message> {
            self.state
                .lock()
                .sent
                .iter()
                .filter(|m| m.kind == MessageType::Pub)
                .cloned()
                .collect()
        }

        pub fn published_to(&self, topic: &str) -> Vec<Message> {
            self.published()
                .into_iter()
                .filter(|m| m.topic == topic)
                .collect()
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.state
                .lock()
                .sent
                .iter()
                .filter(|m| m.kind == MessageType::Sub)
                .map(|m| m.topic.clone())
                .collect()
        }

        pub fn subscriber_count(&self, topic: &str) -> usize {
            self.state
                .lock()
                .subscribers
                .get(topic)
                .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
                .unwrap_or(0)
        }

        /// Makes every following send fail with a transport error.
        pub fn set_fail_sends(&self, fail: bool) {
            self.state.lock().fail_sends = fail;
        }

        /// Drops every transport connection the way a restarting bridge server
        /// does: subscriptions are forgotten and each transport sees a disconnect.
        /// Listeners from [`MemoryRelay::listen`] stay subscribed.
        pub fn drop_connections(&self) {
            let dropped: Vec<_> = {
                let mut state = self.state.lock();
                state.connections.retain(|(_, tx)| !tx.is_closed());
                let dropped: Vec<_> = state
                    .connections
                    .iter()
                    .filter(|(connected, _)| connected.swap(false, Ordering::SeqCst))
                    .map(|(_, tx)| tx.clone())
                    .collect();
                for subs in state.subscribers.values_mut() {
                    subs.retain(|s| !dropped.iter().any(|tx| s.same_channel(tx)));
                }
                dropped
            };
            debug!(count = dropped.len(), "dropping relay connections");
            for tx in dropped {
                let _ = tx.send(TransportEvent::Status(TransportStatus::Disconnected));
            }
        }

        /// Subscribes an out-of-band listener, e.g. a simulated peer.
        pub fn listen(&self, topic: &str) -> mpsc::UnboundedReceiver<TransportEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribe(topic, tx);
            rx
        }

        /// Publishes a frame as if it came from another client.
        pub fn inject(&self, message: Message) {
            self.route(message);
        }

        fn subscribe(&self, topic: &str, tx: mpsc::UnboundedSender<TransportEvent>) {
            let pending = {
                let mut state = self.state.lock();
                let subs = state.subscribers.entry(topic.to_string()).or_default();
                if !subs.iter().any(|s| s.same_channel(&tx)) {
                    subs.push(tx.clone());
                }
                state.pending.remove(topic).unwrap_or_default()
            };
            for message in pending {
                let _ = tx.send(TransportEvent::Message(message));
            }
        }

        fn unsubscribe_all(&self, tx: &mpsc::UnboundedSender<TransportEvent>) {
            let mut state = self.state.lock();
            for subs in state.subscribers.values_mut() {
                subs.retain(|s| !s.same_channel(tx));
            }
        }

        fn route(&self, message: Message) {
            let mut state = self.state.lock();
            state.sent.push(message.clone());
            let live: Vec<_> = state
                .subscribers
                .get(&message.topic)
                .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).cloned().collect())
                .unwrap_or_default();
            if live.is_empty() {
                debug!(topic = %message.topic, "buffering frame for topic without subscribers");
                state
                    .pending
                    .entry(message.topic.clone())
                    .or_default()
                    .push(message);
                return;
            }
            drop(state);
            for tx in live {
                let _ = tx.send(TransportEvent::Message(message.clone()));
            }
        }
    }

    impl TransportBuilder for MemoryRelay {
        fn build(
            &self,
            _bridge: &str,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Arc<dyn Transport> {
            let connected = Arc::new(AtomicBool::new(false));
            self.state
                .lock()
                .connections
                .push((connected.clone(), events.clone()));
            Arc::new(MemoryTransport {
                relay: self.clone(),
                events,
                connected,
            })
        }
    }

    pub struct MemoryTransport {
        relay: MemoryRelay,
        events: mpsc::UnboundedSender<TransportEvent>,
        connected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> Result<bool> {
            if self.connected.swap(true, Ordering::SeqCst) {
                return Ok(false);
            }
            let _ = self
                .events
                .send(TransportEvent::Status(TransportStatus::Connected));
            Ok(true)
        }

        async fn send(&self, message: Message) -> Result<()> {
            if !self.is_connected() {
                return Err(Error::Transport("not connected".to_string()));
            }
            if self.relay.state.lock().fail_sends {
                return Err(Error::Transport("relay unavailable".to_string()));
            }
            match message.kind {
                MessageType::Sub => {
                    self.relay.state.lock().sent.push(message.clone());
                    self.relay.subscribe(&message.topic, self.events.clone());
                }
                MessageType::Pub => self.relay.route(message),
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            if self.connected.swap(false, Ordering::SeqCst) {
                self.relay.unsubscribe_all(&self.events);
                let _ = self
                    .events
                    .send(TransportEvent::Status(TransportStatus::Disconnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRelay;
    use super::*;

    #[test]
    fn test_message_serializes_with_type_field() {
        let json = serde_json::to_value(Message::publish("t", "p")).unwrap();
        assert_eq!(json["type"], "pub");
        assert_eq!(json["topic"], "t");
        let sub: Message =
            serde_json::from_str(r#"{"topic":"x","type":"sub","payload":""}"#).unwrap();
        assert_eq!(sub, Message::subscribe("x"));
    }

    #[tokio::test]
    async fn test_relay_routes_and_buffers() {
        let relay = MemoryRelay::new();
        relay.inject(Message::publish("early", "first"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = relay.build("https://bridge", tx);
        assert!(transport.connect().await.unwrap());
        assert!(!transport.connect().await.unwrap());
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Status(TransportStatus::Connected))
        );

        transport.send(Message::subscribe("early")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(Message::publish("early", "first")))
        );

        let mut peer = relay.listen("peer");
        transport.send(Message::publish("peer", "hi")).await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(TransportEvent::Message(Message::publish("peer", "hi")))
        );
        assert_eq!(relay.subscriptions(), vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_relay_and_closed_transport_reject_sends() {
        let relay = MemoryRelay::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = relay.build("https://bridge", tx);
        assert!(transport.send(Message::publish("t", "p")).await.is_err());

        transport.connect().await.unwrap();
        relay.set_fail_sends(true);
        let err = transport.send(Message::publish("t", "p")).await.unwrap_err();
        assert!(err.is_transient());

        relay.set_fail_sends(false);
        transport.send(Message::subscribe("t")).await.unwrap();
        assert_eq!(relay.subscriber_count("t"), 1);
        transport.close().await;
        assert_eq!(relay.subscriber_count("t"), 0);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_connections_can_reconnect() {
        let relay = MemoryRelay::new();
        let mut peer = relay.listen("peer");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = relay.build("https://bridge", tx);
        transport.connect().await.unwrap();
        transport.send(Message::subscribe("t")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Status(TransportStatus::Connected))
        );

        relay.drop_connections();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Status(TransportStatus::Disconnected))
        );
        assert!(!transport.is_connected());
        assert_eq!(relay.subscriber_count("t"), 0);
        assert_eq!(relay.subscriber_count("peer"), 1);
        assert!(transport.send(Message::publish("peer", "lost")).await.is_err());

        assert!(transport.connect().await.unwrap());
        transport.send(Message::publish("peer", "back")).await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(TransportEvent::Message(Message::publish("peer", "back")))
        );
    }
}
