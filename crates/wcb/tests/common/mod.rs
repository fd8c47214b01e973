#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, MaybeTlsStream, WebSocketStream};
use wc_bridge::{codec, MethodCall, PeerData, PeerMeta, SessionConfig, SessionKey};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn wcb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wcb"))
}

/// Runs `wcb --json --data-dir <dir> <args>` to completion and parses stdout.
pub async fn run_wcb(data_dir: &Path, args: &[&str]) -> Value {
    let output = tokio::process::Command::new(wcb_binary())
        .arg("--json")
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()
        .await
        .expect("failed to run wcb");
    assert!(
        output.status.success(),
        "wcb {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().last().expect("wcb printed nothing");
    serde_json::from_str(line).expect("wcb printed invalid JSON")
}

type Topics = Arc<Mutex<BridgeState>>;

#[derive(Default)]
struct BridgeState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<WsMessage>>>,
    pending: HashMap<String, Vec<String>>,
}

/// A WalletConnect v1 bridge server on localhost.
///
/// `pub` frames go to every socket subscribed to the topic, or wait until one
/// subscribes.
pub struct LocalBridge {
    addr: SocketAddr,
}

impl LocalBridge {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let topics: Topics = Arc::new(Mutex::new(BridgeState::default()));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let topics = topics.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::handle_connection(stream, topics).await {
                        eprintln!("local bridge error: {}", e);
                    }
                });
            }
        });

        LocalBridge { addr }
    }

    /// The address as it appears in a pairing URI.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    fn socket_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.addr.port())
    }

    async fn handle_connection(
        stream: TcpStream,
        topics: Topics,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let topic = frame["topic"].as_str().unwrap_or_default().to_string();
            let mut guard = topics.lock().unwrap();
            let state = &mut *guard;
            match frame["type"].as_str() {
                Some("sub") => {
                    for payload in state.pending.remove(&topic).unwrap_or_default() {
                        let _ = tx.send(WsMessage::Text(payload));
                    }
                    let subscribers = state.subscribers.entry(topic).or_default();
                    if !subscribers.iter().any(|s| s.same_channel(&tx)) {
                        subscribers.push(tx.clone());
                    }
                }
                Some("pub") => {
                    let subscribers = state.subscribers.entry(topic.clone()).or_default();
                    subscribers.retain(|s| !s.is_closed());
                    if subscribers.is_empty() {
                        state.pending.entry(topic).or_default().push(text);
                    } else {
                        for subscriber in subscribers.iter() {
                            let _ = subscriber.send(WsMessage::Text(text.clone()));
                        }
                    }
                }
                _ => {}
            }
        }

        for subscribers in topics.lock().unwrap().subscribers.values_mut() {
            subscribers.retain(|s| !s.same_channel(&tx));
        }
        Ok(())
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The dApp end of a pairing, talking to the bridge over a real socket.
pub struct WsDapp {
    pub config: SessionConfig,
    pub key: SessionKey,
    pub peer: PeerData,
    pub wallet_topic: Option<String>,
    sink: SplitSink<Socket, WsMessage>,
    source: SplitStream<Socket>,
}

impl WsDapp {
    pub async fn connect(bridge: &LocalBridge, peer_id: &str) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(bridge.socket_url())
            .await
            .unwrap();
        let (sink, source) = socket.split();
        let key = SessionKey::generate();
        let config = SessionConfig::new(format!("{}-handshake", peer_id), bridge.url(), key.clone());
        let mut dapp = Self {
            config,
            key,
            peer: PeerData {
                id: peer_id.to_string(),
                meta: Some(PeerMeta {
                    name: Some("Socket dApp".to_string()),
                    url: Some("https://dapp.test".to_string()),
                    ..Default::default()
                }),
            },
            wallet_topic: None,
            sink,
            source,
        };
        dapp.frame(json!({ "topic": peer_id, "type": "sub", "payload": "" }))
            .await;
        dapp
    }

    pub fn uri(&self) -> String {
        self.config.to_uri()
    }

    async fn frame(&mut self, frame: Value) {
        self.sink
            .send(WsMessage::Text(frame.to_string()))
            .await
            .unwrap();
    }

    pub async fn send(&mut self, call: &MethodCall) {
        let topic = self
            .wallet_topic
            .clone()
            .unwrap_or_else(|| self.config.handshake_topic.clone());
        let payload = codec::prepare(call, &self.key).unwrap();
        self.frame(json!({ "topic": topic, "type": "pub", "payload": payload, "silent": true }))
            .await;
    }

    pub async fn next_call(&mut self) -> MethodCall {
        loop {
            let msg = tokio::time::timeout(WAIT, self.source.next())
                .await
                .expect("timed out waiting for the wallet")
                .expect("bridge closed")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let payload = frame["payload"].as_str().unwrap();
                return codec::parse(payload, &self.key).unwrap();
            }
        }
    }

    /// Session request, then the wallet's key exchange answered with `true`.
    pub async fn handshake(&mut self, id: u64) {
        self.send(&MethodCall::SessionRequest {
            id,
            peer: self.peer.clone(),
        })
        .await;
        match self.next_call().await {
            MethodCall::ExchangeKey { id, next_key, peer } => {
                self.wallet_topic = Some(peer.id);
                self.send(&MethodCall::result(id, Value::Bool(true))).await;
                self.key = next_key;
            }
            other => panic!("expected key exchange, got {:?}", other),
        }
    }
}
