//! One paired dApp connection.
//!
//! All session state, the shared keys included, lives inside a single actor task.
//! [`Session`] is a cheap handle that talks to the actor over a command channel,
//! so encrypting, decrypting and key promotion are serialized without locks.
//! Inbound frames, commands and timeouts are processed one at a time in the
//! order the actor receives them.

use crate::codec::{self, peer_json, session_params_json};
use crate::queue::{OutboundQueue, QueuedMethod, ResponseSender};
use crate::transport::{Message, MessageType, Transport, TransportBuilder, TransportEvent, TransportStatus};
use crate::utils::{contains_account, next_call_id};
use crate::{
    BridgeConfig, Error, MethodCall, PeerData, Result, SessionConfig, SessionEvent, SessionKey,
    SessionParams, SessionRecord, SessionStatus, SessionStore,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Whether a send reached the transport or waits for a key exchange to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

/// Point-in-time view of a session, refreshed after every actor step.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub bridge: String,
    pub client_id: String,
    pub peer: Option<PeerData>,
    pub status: SessionStatus,
    pub rotating: bool,
    pub approved_accounts: Option<Vec<String>>,
    pub chain_id: Option<u64>,
    pub queued: usize,
    pub pending_requests: usize,
}

enum Command {
    Init {
        reply: Reply<()>,
    },
    Approve {
        accounts: Vec<String>,
        chain_id: u64,
        reply: Reply<()>,
    },
    Update {
        accounts: Vec<String>,
        chain_id: u64,
        reply: Reply<()>,
    },
    Reject {
        message: Option<String>,
        reply: Reply<()>,
    },
    Send {
        call: MethodCall,
        callback: Option<ResponseSender>,
        reply: Reply<SendOutcome>,
    },
}

enum Timeout {
    KeyExchange(u64),
    Request(u64),
    Reconnect,
}

enum Pending {
    KeyExchange,
    Request(ResponseSender),
}

/// Handle to a running session actor.
#[derive(Clone)]
pub struct Session {
    id: String,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    info: watch::Receiver<SessionInfo>,
}

impl Session {
    /// Loads the stored state for `config`'s topic, or starts a fresh session,
    /// and spawns its actor on the current runtime.
    ///
    /// `client_id` pins the wallet-side peer id. It must match the stored one
    /// when the session already exists.
    pub async fn spawn(
        config: SessionConfig,
        client_id: Option<String>,
        store: Arc<dyn SessionStore>,
        transports: &dyn TransportBuilder,
        settings: &BridgeConfig,
    ) -> Result<Self> {
        let id = config.handshake_topic.clone();
        let record = match store.load(&id).await? {
            Some(mut record) => {
                if let Some(client_id) = &client_id {
                    if *client_id != record.client.id {
                        return Err(Error::ProtocolState(format!(
                            "session {} belongs to client {}",
                            id, record.client.id
                        )));
                    }
                }
                // The acknowledgement of an interrupted exchange can no longer be matched.
                if record.next_key.take().is_some() {
                    warn!(session = %id, "dropping key exchange interrupted by restart");
                }
                record
            }
            None => SessionRecord::new(
                config,
                PeerData {
                    id: client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    meta: Some(settings.client_meta.clone()),
                },
            ),
        };

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = transports.build(&record.config.bridge, transport_tx);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            record,
            store,
            transport,
            transport_events: transport_rx,
            commands: command_rx,
            timeouts: timeout_rx,
            timeout_tx,
            events: events.clone(),
            info: None,
            pending: HashMap::new(),
            queue: OutboundQueue::new(),
            exchange_id: None,
            subscribed: false,
            closed: false,
            reconnect_attempts: 0,
            reconnect_armed: false,
            settings: settings.clone(),
        };
        let (info_tx, info_rx) = watch::channel(actor.snapshot());
        let actor = SessionActor {
            info: Some(info_tx),
            ..actor
        };
        tokio::spawn(actor.run());

        Ok(Self {
            id,
            commands: command_tx,
            events,
            info: info_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.info.borrow().status == SessionStatus::Closed
    }

    /// Connects the transport and subscribes to the handshake topic. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        self.call(|reply| Command::Init { reply }).await
    }

    /// Answers the pending session request. Does nothing when no request was received.
    pub async fn approve(&self, accounts: Vec<String>, chain_id: u64) -> Result<()> {
        self.call(|reply| Command::Approve {
            accounts,
            chain_id,
            reply,
        })
        .await
    }

    pub async fn update(&self, accounts: Vec<String>, chain_id: u64) -> Result<()> {
        self.call(|reply| Command::Update {
            accounts,
            chain_id,
            reply,
        })
        .await
    }

    /// Declines the session and tears it down. Calling it on a closed session is a no-op.
    pub async fn reject(&self, message: Option<String>) -> Result<()> {
        match self.call(|reply| Command::Reject { message, reply }).await {
            Err(Error::SessionClosed) => Ok(()),
            other => other,
        }
    }

    pub async fn kill(&self) -> Result<()> {
        self.reject(None).await
    }

    pub async fn approve_request(&self, id: u64, result: Value) -> Result<SendOutcome> {
        self.send(MethodCall::result(id, result)).await
    }

    pub async fn reject_request(&self, id: u64, code: i64, message: impl Into<String>) -> Result<SendOutcome> {
        self.send(MethodCall::error(id, code, message)).await
    }

    /// Sends a call to the peer, queueing it while a key exchange is pending.
    pub async fn send(&self, call: MethodCall) -> Result<SendOutcome> {
        self.call(|reply| Command::Send {
            call,
            callback: None,
            reply,
        })
        .await
    }

    /// Sends a call and waits for the peer's response.
    pub async fn request(&self, call: MethodCall) -> Result<MethodCall> {
        let (tx, rx) = oneshot::channel();
        self.call(|reply| Command::Send {
            call,
            callback: Some(tx),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }
}

struct SessionActor {
    record: SessionRecord,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    timeouts: mpsc::UnboundedReceiver<Timeout>,
    timeout_tx: mpsc::UnboundedSender<Timeout>,
    events: broadcast::Sender<SessionEvent>,
    info: Option<watch::Sender<SessionInfo>>,
    pending: HashMap<u64, Pending>,
    queue: OutboundQueue,
    /// Call id of our outstanding `wc_exchangeKey`.
    exchange_id: Option<u64>,
    subscribed: bool,
    closed: bool,
    /// Failed reconnects since the connection was last up.
    reconnect_attempts: u32,
    reconnect_armed: bool,
    settings: BridgeConfig,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event).await,
                Some(timeout) = self.timeouts.recv() => self.handle_timeout(timeout).await,
            }
            self.publish_info();
            if self.closed {
                return;
            }
        }

        // Every handle is gone: disconnect but keep the stored state.
        debug!(session = %self.id(), "session handles dropped, disconnecting");
        self.transport.close().await;
        self.fail_waiters(|| Error::SessionClosed);
    }

    fn id(&self) -> &str {
        self.record.id()
    }

    fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id().to_string(),
            bridge: self.record.config.bridge.clone(),
            client_id: self.record.client.id.clone(),
            peer: self.record.peer.clone(),
            status: if self.closed {
                SessionStatus::Closed
            } else {
                self.record.status()
            },
            rotating: self.record.is_rotating(),
            approved_accounts: self.record.approved_accounts.clone(),
            chain_id: self.record.chain_id,
            queued: self.queue.len(),
            pending_requests: self
                .pending
                .values()
                .filter(|p| matches!(p, Pending::Request(_)))
                .count(),
        }
    }

    fn publish_info(&self) {
        if let Some(info) = &self.info {
            info.send_replace(self.snapshot());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        // Snapshots are refreshed before replying so callers observe their own effects.
        match command {
            Command::Init { reply } => {
                let result = self.init().await;
                self.publish_info();
                let _ = reply.send(result);
            }
            Command::Approve {
                accounts,
                chain_id,
                reply,
            } => {
                let result = self.approve(accounts, chain_id).await;
                self.publish_info();
                let _ = reply.send(result);
            }
            Command::Update {
                accounts,
                chain_id,
                reply,
            } => {
                let result = self.update(accounts, chain_id).await;
                self.publish_info();
                let _ = reply.send(result);
            }
            Command::Reject { message, reply } => {
                let result = self.reject(message).await;
                self.publish_info();
                let _ = reply.send(result);
            }
            Command::Send {
                call,
                callback,
                reply,
            } => {
                let result = match self.peer_topic() {
                    Ok(topic) => self.send(call, topic, false, callback).await,
                    Err(e) => Err(e),
                };
                self.publish_info();
                let _ = reply.send(result);
            }
        }
    }

    async fn init(&mut self) -> Result<()> {
        let connected = self.transport.connect().await?;
        if connected || !self.subscribed {
            self.transport
                .send(Message::subscribe(self.id().to_string()))
                .await?;
            self.subscribed = true;
            debug!(session = %self.id(), "subscribed to handshake topic");
        }
        Ok(())
    }

    async fn approve(&mut self, accounts: Vec<String>, chain_id: u64) -> Result<()> {
        let Some(handshake_id) = self.record.handshake_id else {
            warn!(session = %self.id(), "approve without a session request, ignoring");
            return Ok(());
        };
        let topic = self.peer_topic()?;

        self.record.approved_accounts = Some(accounts.clone());
        self.record.chain_id = Some(chain_id);
        self.persist().await?;

        // The result also names the wallet so the dApp knows where to reach it.
        let result = match session_params_json(&SessionParams::approved(accounts, chain_id)) {
            Value::Object(fields) => peer_json(&self.record.client, fields),
            other => other,
        };
        self.send(MethodCall::result(handshake_id, result), topic, false, None)
            .await?;

        info!(session = %self.id(), "session approved");
        let _ = self.events.send(SessionEvent::Approved);
        Ok(())
    }

    async fn update(&mut self, accounts: Vec<String>, chain_id: u64) -> Result<()> {
        if self.record.approved_accounts.is_none() {
            return Err(Error::ProtocolState(
                "cannot update a session that was not approved".to_string(),
            ));
        }
        let topic = self.peer_topic()?;

        self.record.approved_accounts = Some(accounts.clone());
        self.record.chain_id = Some(chain_id);
        self.persist().await?;

        let call = MethodCall::SessionUpdate {
            id: next_call_id(),
            params: SessionParams::approved(accounts, chain_id),
        };
        self.send(call, topic, false, None).await?;
        Ok(())
    }

    async fn reject(&mut self, message: Option<String>) -> Result<()> {
        let params = SessionParams::rejected(message);
        let farewell = match (self.record.handshake_id, &self.record.approved_accounts) {
            (Some(id), None) => Some(MethodCall::result(id, session_params_json(&params))),
            (_, Some(_)) => Some(MethodCall::SessionUpdate {
                id: next_call_id(),
                params,
            }),
            (None, None) => None,
        };

        if let (Some(call), Ok(topic)) = (farewell, self.peer_topic()) {
            // Bypasses the rotation queue: the session ends right after this.
            if let Err(e) = self.send(call, topic, true, None).await {
                warn!(session = %self.id(), error = %e, "could not notify peer of session end");
            }
        }

        self.teardown(None).await
    }

    async fn teardown(&mut self, reason: Option<String>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Watchers reacting to the close must already see it.
        self.publish_info();

        let removed = self.store.remove(self.id()).await;
        self.transport.close().await;
        self.fail_waiters(|| Error::SessionClosed);

        info!(session = %self.id(), reason = ?reason, "session closed");
        let _ = self.events.send(SessionEvent::Closed { reason });
        removed
    }

    fn fail_waiters(&mut self, error: impl Fn() -> Error) {
        let dropped = self.queue.fail_all(&error);
        if dropped > 0 {
            debug!(session = %self.id(), dropped, "failed queued messages");
        }
        for (_, pending) in self.pending.drain() {
            if let Pending::Request(callback) = pending {
                let _ = callback.send(Err(error()));
            }
        }
        self.exchange_id = None;
    }

    fn peer_topic(&self) -> Result<String> {
        self.record
            .peer
            .as_ref()
            .map(|peer| peer.id.clone())
            .ok_or_else(|| Error::ProtocolState("peer is not known yet".to_string()))
    }

    async fn persist(&self) -> Result<()> {
        self.store.store(self.id(), &self.record).await
    }

    /// Queues the call while a key exchange is pending unless `force` is set,
    /// otherwise encrypts it under the current key and hands it to the transport.
    async fn send(
        &mut self,
        call: MethodCall,
        topic: String,
        force: bool,
        callback: Option<ResponseSender>,
    ) -> Result<SendOutcome> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let entry = QueuedMethod {
            topic,
            call,
            callback,
        };
        if !force && self.record.is_rotating() {
            debug!(session = %self.id(), id = entry.call.id(), "queueing message during key exchange");
            self.queue.push(entry);
            return Ok(SendOutcome::Queued);
        }
        match self.deliver(entry).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err((e, _)) => Err(e),
        }
    }

    /// Hands an entry to the transport. On failure the entry comes back untouched.
    async fn deliver(&mut self, entry: QueuedMethod) -> std::result::Result<(), (Error, QueuedMethod)> {
        let payload = match codec::prepare(&entry.call, &self.record.current_key) {
            Ok(payload) => payload,
            Err(e) => return Err((e, entry)),
        };
        if let Err(e) = self
            .transport
            .send(Message::publish(entry.topic.clone(), payload))
            .await
        {
            return Err((e, entry));
        }

        if let Some(callback) = entry.callback {
            let id = entry.call.id();
            self.pending.insert(id, Pending::Request(callback));
            self.arm(self.settings.request_timeout(), Timeout::Request(id));
        }
        Ok(())
    }

    async fn drain_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut delivered = 0usize;
        while let Some(entry) = self.queue.pop() {
            match self.deliver(entry).await {
                Ok(()) => delivered += 1,
                Err((e, entry)) if e.is_transient() => {
                    warn!(session = %self.id(), error = %e, remaining = self.queue.len() + 1, "queue drain interrupted");
                    self.queue.requeue(entry);
                    break;
                }
                Err((e, entry)) => {
                    warn!(session = %self.id(), id = entry.call.id(), error = %e, "dropping undeliverable message");
                    entry.fail(e);
                }
            }
        }
        debug!(session = %self.id(), delivered, "drained outbound queue");
    }

    async fn start_key_exchange(&mut self) -> Result<()> {
        let topic = self.peer_topic()?;
        let next_key = SessionKey::generate();
        let id = next_call_id();

        self.record.next_key = Some(next_key.clone());
        self.persist().await?;

        let call = MethodCall::ExchangeKey {
            id,
            next_key,
            peer: self.record.client.clone(),
        };
        if let Err(e) = self.send(call, topic, true, None).await {
            self.record.next_key = None;
            self.persist().await?;
            return Err(e);
        }

        self.pending.insert(id, Pending::KeyExchange);
        self.exchange_id = Some(id);
        self.arm(self.settings.rotation_timeout(), Timeout::KeyExchange(id));
        debug!(session = %self.id(), "key exchange started");
        Ok(())
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_armed {
            return;
        }
        let delay = self.settings.reconnect_delay(self.reconnect_attempts);
        debug!(session = %self.id(), attempt = self.reconnect_attempts + 1, ?delay, "scheduling reconnect");
        self.reconnect_armed = true;
        self.arm(delay, Timeout::Reconnect);
    }

    async fn reconnect(&mut self) {
        self.reconnect_armed = false;
        if self.closed || self.transport.is_connected() {
            self.reconnect_attempts = 0;
            return;
        }
        match self.init().await {
            Ok(()) => {
                info!(session = %self.id(), attempts = self.reconnect_attempts + 1, "reconnected to bridge");
                self.reconnect_attempts = 0;
            }
            Err(e) => {
                warn!(session = %self.id(), error = %e, "reconnect failed");
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                self.schedule_reconnect();
            }
        }
    }

    fn arm(&self, after: Duration, timeout: Timeout) {
        let tx = self.timeout_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timeout);
        });
    }

    async fn handle_timeout(&mut self, timeout: Timeout) {
        match timeout {
            Timeout::KeyExchange(id) => {
                if self.exchange_id != Some(id) {
                    return;
                }
                warn!(session = %self.id(), "key exchange timed out, keeping current key");
                self.pending.remove(&id);
                self.exchange_id = None;
                self.record.next_key = None;
                if let Err(e) = self.persist().await {
                    warn!(session = %self.id(), error = %e, "failed to store session");
                }
                self.queue
                    .fail_all(|| Error::Timeout("key exchange was not acknowledged".to_string()));
            }
            Timeout::Request(id) => {
                if let Some(Pending::Request(callback)) = self.pending.remove(&id) {
                    debug!(session = %self.id(), id, "request timed out");
                    let _ = callback.send(Err(Error::Timeout(format!("no response to request {}", id))));
                }
            }
            Timeout::Reconnect => self.reconnect().await,
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(TransportStatus::Connected) => {
                let topic = self.record.client.id.clone();
                if let Err(e) = self.transport.send(Message::subscribe(topic)).await {
                    warn!(session = %self.id(), error = %e, "failed to subscribe to client topic");
                }
                if !self.record.is_rotating() {
                    self.drain_queue().await;
                }
            }
            TransportEvent::Status(TransportStatus::Disconnected) => {
                debug!(session = %self.id(), "transport disconnected");
                self.subscribed = false;
                if !self.closed {
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Message(message) if message.kind == MessageType::Pub => {
                self.handle_message(message).await;
            }
            TransportEvent::Message(_) => {}
        }
    }

    async fn handle_message(&mut self, message: Message) {
        let call = match codec::parse(&message.payload, &self.record.current_key) {
            Ok(call) => call,
            Err(e) => {
                self.answer_error(&e).await;
                return;
            }
        };
        if let Err(e) = self.dispatch(call).await {
            warn!(session = %self.id(), error = %e, "failed to handle inbound message");
        }
    }

    /// Answers the peer for errors that carry a request id; everything else is only logged.
    async fn answer_error(&mut self, error: &Error) {
        let (Some(id), Ok(topic)) = (error.request_id(), self.peer_topic()) else {
            warn!(session = %self.id(), error = %error, "dropping undecodable message");
            return;
        };
        debug!(session = %self.id(), id, error = %error, "answering request with error");
        let response = MethodCall::error(id, error.rpc_code(), error.to_string());
        if let Err(e) = self.send(response, topic, false, None).await {
            warn!(session = %self.id(), error = %e, "failed to send error response");
        }
    }

    async fn dispatch(&mut self, call: MethodCall) -> Result<()> {
        match &call {
            MethodCall::SessionRequest { id, peer } => {
                self.record.handshake_id = Some(*id);
                self.record.peer = Some(peer.clone());
                // Persists the handshake together with the pending key.
                self.start_key_exchange().await?;
            }
            MethodCall::SessionUpdate { params, .. } => {
                if !params.approved {
                    return self.teardown(params.message.clone()).await;
                }
            }
            MethodCall::ExchangeKey { id, next_key, peer } => {
                self.record.peer = Some(peer.clone());
                let topic = self.peer_topic()?;
                // Acknowledged under the key the peer used to send this.
                self.send(MethodCall::result(*id, Value::Bool(true)), topic, true, None)
                    .await?;
                self.promote(Some(next_key.clone())).await?;
            }
            MethodCall::SendTransaction { .. } | MethodCall::SignMessage { .. } => {
                if let Some(account) = call.signing_account() {
                    let approved = self
                        .record
                        .approved_accounts
                        .as_deref()
                        .is_some_and(|accounts| contains_account(accounts, account));
                    if !approved {
                        let error = Error::InvalidAccount {
                            id: call.id(),
                            account: account.to_string(),
                        };
                        self.answer_error(&error).await;
                        return Ok(());
                    }
                }
            }
            MethodCall::Custom { .. } => {}
            MethodCall::Response { id, result, .. } => match self.pending.remove(id) {
                Some(Pending::KeyExchange) => {
                    self.exchange_id = None;
                    if matches!(result, Some(Value::Bool(true))) {
                        let next_key = self.record.next_key.take();
                        self.promote(next_key).await?;
                    } else {
                        warn!(session = %self.id(), "peer declined key exchange");
                        self.record.next_key = None;
                        self.persist().await?;
                        self.drain_queue().await;
                    }
                    // Acknowledgements of our own exchange stay internal.
                    return Ok(());
                }
                Some(Pending::Request(callback)) => {
                    let _ = callback.send(Ok(call.clone()));
                }
                None => {
                    debug!(session = %self.id(), id, "ignoring response without a pending request");
                    return Ok(());
                }
            },
        }

        let _ = self.events.send(SessionEvent::MethodCall(call));
        Ok(())
    }

    /// Makes `key` the current key, ends any pending exchange and drains the queue.
    async fn promote(&mut self, key: Option<SessionKey>) -> Result<()> {
        if let Some(key) = key {
            self.record.current_key = key;
        }
        self.record.next_key = None;
        if let Some(id) = self.exchange_id.take() {
            self.pending.remove(&id);
        }
        self.persist().await?;
        info!(session = %self.id(), "session key rotated");
        self.drain_queue().await;
        Ok(())
    }
}
