#![allow(dead_code)]

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use wc_bridge::codec;
use wc_bridge::transport::memory::MemoryRelay;
use wc_bridge::{
    Message, MethodCall, PeerData, PeerMeta, SessionConfig, SessionKey, TransportEvent,
};

pub const BRIDGE: &str = "https://bridge.test";
pub const WAIT: Duration = Duration::from_secs(2);

/// The dApp end of a pairing, speaking the protocol through the in-memory relay.
pub struct FakeDapp {
    pub relay: MemoryRelay,
    pub peer: PeerData,
    pub config: SessionConfig,
    /// Key the dApp currently encrypts and decrypts with.
    pub key: SessionKey,
    /// Wallet's client id once learned from a key exchange.
    pub wallet_topic: Option<String>,
    inbox: mpsc::UnboundedReceiver<TransportEvent>,
}

impl FakeDapp {
    pub fn new(relay: &MemoryRelay, peer_id: &str) -> Self {
        let key = SessionKey::generate();
        let config = SessionConfig::new(uuid::Uuid::new_v4().to_string(), BRIDGE, key.clone());
        Self {
            relay: relay.clone(),
            peer: PeerData {
                id: peer_id.to_string(),
                meta: Some(PeerMeta {
                    name: Some("Test dApp".to_string()),
                    url: Some("https://dapp.test".to_string()),
                    icons: Some(vec!["https://dapp.test/icon.png".to_string()]),
                    ..Default::default()
                }),
            },
            config,
            key,
            wallet_topic: None,
            inbox: relay.listen(peer_id),
        }
    }

    pub fn uri(&self) -> String {
        self.config.to_uri()
    }

    pub fn topic(&self) -> &str {
        &self.config.handshake_topic
    }

    /// Publishes to the wallet's client topic when known, the handshake topic otherwise.
    pub fn send(&self, call: &MethodCall) {
        self.send_with_key(call, &self.key);
    }

    pub fn send_with_key(&self, call: &MethodCall, key: &SessionKey) {
        let topic = self
            .wallet_topic
            .clone()
            .unwrap_or_else(|| self.topic().to_string());
        let payload = codec::prepare(call, key).unwrap();
        self.relay.inject(Message::publish(topic, payload));
    }

    pub fn send_raw(&self, payload: &str) {
        self.relay
            .inject(Message::publish(self.topic().to_string(), payload.to_string()));
    }

    pub fn request_session(&self, id: u64) {
        self.send(&MethodCall::SessionRequest {
            id,
            peer: self.peer.clone(),
        });
    }

    /// Next frame addressed to the dApp, decrypted with its current key.
    pub async fn next_call(&mut self) -> MethodCall {
        let key = self.key.clone();
        self.next_call_with(&key).await
    }

    pub async fn next_call_with(&mut self, key: &SessionKey) -> MethodCall {
        loop {
            let event = tokio::time::timeout(WAIT, self.inbox.recv())
                .await
                .expect("timed out waiting for the wallet")
                .expect("relay closed");
            if let TransportEvent::Message(message) = event {
                return codec::parse(&message.payload, key).unwrap();
            }
        }
    }

    /// Asserts the wallet sends nothing more within a short grace period.
    pub async fn assert_silent(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(TransportEvent::Message(message)) = self.inbox.try_recv() {
            panic!("unexpected frame on {}", message.topic);
        }
    }

    /// Expects the wallet's key exchange and answers it with `accept`.
    /// Returns the call id of the exchange.
    pub async fn answer_key_exchange(&mut self, accept: bool) -> u64 {
        let (id, next_key, wallet) = match self.next_call().await {
            MethodCall::ExchangeKey { id, next_key, peer } => (id, next_key, peer),
            other => panic!("expected key exchange, got {:?}", other),
        };
        self.wallet_topic = Some(wallet.id);
        self.send(&MethodCall::result(id, Value::Bool(accept)));
        if accept {
            self.key = next_key;
        }
        id
    }

    /// Session request followed by an accepted key exchange.
    pub async fn handshake(&mut self, id: u64) {
        self.request_session(id);
        self.answer_key_exchange(true).await;
    }
}

pub async fn next_event<T: Clone>(events: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Polls `check` until it holds or the wait budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
