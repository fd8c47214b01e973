use crate::{
    BridgeConfig, Error, KvSessionStore, MethodCall, PeerData, Result, Session, SessionConfig, SessionEvent,
    SessionRecord, SessionStatus, SessionStore, StorageAdapter, TransportBuilder,
    TRANSACTION_REJECTED_CODE,
};
use crate::storage::JsonStorage;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const CONTEXT_KEY_PREFIX: &str = "wc-context/";

/// Summary of a session for listing and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub dapp_name: Option<String>,
    pub dapp_description: Option<String>,
    pub dapp_url: Option<String>,
    #[serde(default)]
    pub dapp_icons: Vec<String>,
    /// Loaded in the registry and not closed.
    pub active: bool,
    pub status: SessionStatus,
    pub approved_accounts: Option<Vec<String>>,
    /// Account bound to the session when it was created.
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    SessionsChanged,
    SessionApproved {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
        reason: Option<String>,
    },
    /// A signing or custom request, already indexed for `approve_request` / `reject_request`.
    Request {
        session_id: String,
        call: MethodCall,
    },
}

/// Outcomes reported by the wallet for requests it received through the registry.
#[async_trait]
pub trait TransactionEvents: Send + Sync {
    async fn on_transaction_submitted(&self, reference_id: u64, chain_hash: &str) -> Result<()>;
    async fn on_transaction_rejected(&self, reference_id: u64) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionContext {
    #[serde(default)]
    account: Option<String>,
}

/// A spawned session and the spawn it came from. A topic can be paired again
/// after a close, so cleanup only applies to the spawn that closed.
#[derive(Clone)]
struct LiveSession {
    session: Session,
    generation: u64,
}

/// Live sessions plus the index from request id to owning session.
///
/// Sessions are loaded lazily from the store. Every loaded session gets a
/// watcher task that approves its handshake with the bound account, indexes
/// incoming requests and cleans up once the session closes.
#[derive(Clone)]
pub struct BridgeRegistry {
    store: Arc<dyn SessionStore>,
    storage: Arc<dyn StorageAdapter>,
    transports: Arc<dyn TransportBuilder>,
    settings: Arc<BridgeConfig>,
    sessions: Arc<Mutex<HashMap<String, LiveSession>>>,
    requests: Arc<Mutex<HashMap<u64, String>>>,
    loading: Arc<tokio::sync::Mutex<()>>,
    generations: Arc<AtomicU64>,
    events: broadcast::Sender<RegistryEvent>,
}

impl BridgeRegistry {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        transports: Arc<dyn TransportBuilder>,
        settings: BridgeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            store: Arc::new(KvSessionStore::new(storage.clone())),
            storage,
            transports,
            settings: Arc::new(settings),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(HashMap::new())),
            loading: Arc::new(tokio::sync::Mutex::new(())),
            generations: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &BridgeConfig {
        &self.settings
    }

    /// Pairs with the dApp behind `uri`. `account` is offered when the dApp's
    /// session request arrives; without one the request is rejected.
    pub async fn create_session(&self, uri: &str, account: Option<String>) -> Result<String> {
        let config = SessionConfig::from_uri(uri)?;
        let id = config.handshake_topic.clone();

        let session = {
            let _guard = self.loading.lock().await;
            // A closed spawn of this topic is cleaned up before the new context lands.
            self.forget(&id, None);
            self.store_context(&id, &SessionContext { account })?;
            match self.live(&id) {
                Some(session) => session,
                None => match self.start(config, None).await {
                    Ok(session) => session,
                    Err(e) => {
                        self.remove_context(&id);
                        return Err(e);
                    }
                },
            }
        };
        session.init().await?;

        info!(session = %id, "session created");
        self.emit(RegistryEvent::SessionsChanged);
        Ok(id)
    }

    pub async fn activate_session(&self, id: &str) -> Result<()> {
        self.session_handle(id).await?.init().await
    }

    /// Loads and connects every stored session. Returns how many came up.
    ///
    /// Contexts of pairings that never got as far as a stored session are
    /// dropped on the way.
    pub async fn activate_all(&self) -> Result<usize> {
        let records = self.store.list().await?;
        self.drop_orphaned_contexts(&records)?;

        let mut activated = 0;
        for record in records {
            match self.activate_session(record.id()).await {
                Ok(()) => activated += 1,
                Err(e) => warn!(session = %record.id(), error = %e, "failed to activate session"),
            }
        }
        if activated > 0 {
            self.emit(RegistryEvent::SessionsChanged);
        }
        Ok(activated)
    }

    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = self.session_handle(id).await?;
        // Connect first so the peer hears about the close.
        if let Err(e) = session.init().await {
            warn!(session = %id, error = %e, "closing session without reaching the bridge");
        }
        session.kill().await?;
        self.forget(id, None);
        Ok(())
    }

    pub async fn session(&self, id: &str) -> Result<SessionMeta> {
        if let Some(session) = self.live(id) {
            let info = session.info();
            return Ok(self.meta(id, info.peer.as_ref(), info.status, info.approved_accounts, true));
        }
        let record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
        Ok(self.record_meta(&record, false))
    }

    /// Stored and live sessions, optionally only those bound to or approved for `account`.
    pub async fn sessions(&self, account: Option<&str>) -> Result<Vec<SessionMeta>> {
        let mut metas = BTreeMap::new();
        for record in self.store.list().await? {
            metas.insert(record.id().to_string(), self.record_meta(&record, false));
        }
        let live: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        for session in live {
            let info = session.info();
            if info.status == SessionStatus::Closed {
                continue;
            }
            let meta = self.meta(
                &info.id,
                info.peer.as_ref(),
                info.status,
                info.approved_accounts.clone(),
                true,
            );
            metas.insert(info.id, meta);
        }

        Ok(metas
            .into_values()
            .filter(|meta| account.map_or(true, |account| meta_has_account(meta, account)))
            .collect())
    }

    pub async fn approve_request(&self, request_id: u64, result: Value) -> Result<()> {
        let session = self.request_owner(request_id).await?;
        session.approve_request(request_id, result).await?;
        self.requests.lock().remove(&request_id);
        Ok(())
    }

    pub async fn reject_request(&self, request_id: u64, code: i64, message: &str) -> Result<()> {
        let session = self.request_owner(request_id).await?;
        session.reject_request(request_id, code, message).await?;
        self.requests.lock().remove(&request_id);
        Ok(())
    }

    /// Session ids with requests still waiting for an answer, keyed by request id.
    pub fn pending_requests(&self) -> HashMap<u64, String> {
        self.requests.lock().clone()
    }

    async fn request_owner(&self, request_id: u64) -> Result<Session> {
        let session_id = self
            .requests
            .lock()
            .get(&request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("request {}", request_id)))?;
        self.session_handle(&session_id).await
    }

    fn live(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .get(id)
            .filter(|entry| !entry.session.is_closed())
            .map(|entry| entry.session.clone())
    }

    async fn session_handle(&self, id: &str) -> Result<Session> {
        if let Some(session) = self.live(id) {
            return Ok(session);
        }
        let _guard = self.loading.lock().await;
        if let Some(session) = self.live(id) {
            return Ok(session);
        }
        let record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
        let client_id = record.client.id.clone();
        self.start(record.config, Some(client_id)).await
    }

    /// Spawns a session and its watcher. Callers hold the `loading` lock.
    async fn start(&self, config: SessionConfig, client_id: Option<String>) -> Result<Session> {
        let id = config.handshake_topic.clone();
        let session = Session::spawn(
            config,
            client_id,
            self.store.clone(),
            self.transports.as_ref(),
            &self.settings,
        )
        .await?;

        let events = session.subscribe();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = self.sessions.lock().insert(
            id.clone(),
            LiveSession {
                session: session.clone(),
                generation,
            },
        );
        if replaced.is_some() {
            self.requests.lock().retain(|_, session_id| *session_id != id);
        }
        tokio::spawn(self.clone().watch(id, generation, events));
        Ok(session)
    }

    async fn watch(self, id: String, generation: u64, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.on_session_event(&id, generation, event).await {
                        warn!(session = %id, error = %e, "failed to handle session event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %id, skipped, "session events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(session = %id, "session watcher stopped");
    }

    async fn on_session_event(&self, id: &str, generation: u64, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::MethodCall(MethodCall::SessionRequest { peer, .. }) => {
                let Some(session) = self.live(id) else {
                    return Ok(());
                };
                let context = self.load_context(id)?;
                match context.account {
                    Some(account) => {
                        debug!(session = %id, peer = %peer.id, "approving session request");
                        session.approve(vec![account], self.settings.chain_id).await?;
                    }
                    None => {
                        info!(session = %id, "no account bound, rejecting session request");
                        session.reject(Some("No account selected".to_string())).await?;
                    }
                }
            }
            SessionEvent::MethodCall(
                call @ (MethodCall::SendTransaction { .. }
                | MethodCall::SignMessage { .. }
                | MethodCall::Custom { .. }),
            ) => {
                self.requests.lock().insert(call.id(), id.to_string());
                self.emit(RegistryEvent::Request {
                    session_id: id.to_string(),
                    call,
                });
            }
            SessionEvent::MethodCall(_) => {}
            SessionEvent::Approved => {
                self.emit(RegistryEvent::SessionApproved {
                    session_id: id.to_string(),
                });
                self.emit(RegistryEvent::SessionsChanged);
            }
            SessionEvent::Closed { reason } => {
                self.forget(id, Some(generation));
                self.emit(RegistryEvent::SessionClosed {
                    session_id: id.to_string(),
                    reason,
                });
                self.emit(RegistryEvent::SessionsChanged);
            }
        }
        Ok(())
    }

    /// Drops every trace of a closed session: its entry, its indexed requests
    /// and its context. Only whoever removes the entry cleans up, and with
    /// `generation` set only that spawn's entry is removed.
    fn forget(&self, id: &str, generation: Option<u64>) {
        {
            let mut sessions = self.sessions.lock();
            match sessions.get(id) {
                Some(entry)
                    if entry.session.is_closed()
                        && generation.map_or(true, |g| g == entry.generation) =>
                {
                    sessions.remove(id);
                }
                _ => return,
            }
        }
        self.requests.lock().retain(|_, session_id| session_id != id);
        self.remove_context(id);
        debug!(session = %id, "session removed from registry");
    }

    fn drop_orphaned_contexts(&self, records: &[SessionRecord]) -> Result<()> {
        for key in self.storage.list(CONTEXT_KEY_PREFIX)? {
            let Some(id) = key.strip_prefix(CONTEXT_KEY_PREFIX) else {
                continue;
            };
            let stored = records.iter().any(|record| record.id() == id);
            if !stored && !self.sessions.lock().contains_key(id) {
                debug!(session = %id, "dropping context of an unfinished pairing");
                self.remove_context(id);
            }
        }
        Ok(())
    }

    fn remove_context(&self, id: &str) {
        if let Err(e) = self.storage.del(&context_key(id)) {
            warn!(session = %id, error = %e, "failed to remove session context");
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn load_context(&self, id: &str) -> Result<SessionContext> {
        Ok(self
            .storage
            .get_json(&context_key(id))?
            .unwrap_or_default())
    }

    fn store_context(&self, id: &str, context: &SessionContext) -> Result<()> {
        self.storage.put_json(&context_key(id), context)
    }

    fn record_meta(&self, record: &SessionRecord, active: bool) -> SessionMeta {
        self.meta(
            record.id(),
            record.peer.as_ref(),
            record.status(),
            record.approved_accounts.clone(),
            active,
        )
    }

    fn meta(
        &self,
        id: &str,
        peer: Option<&PeerData>,
        status: SessionStatus,
        approved_accounts: Option<Vec<String>>,
        active: bool,
    ) -> SessionMeta {
        let meta = peer.and_then(|p| p.meta.as_ref());
        let account = self.load_context(id).ok().and_then(|c| c.account);
        SessionMeta {
            id: id.to_string(),
            dapp_name: meta.and_then(|m| m.name.clone()),
            dapp_description: meta.and_then(|m| m.description.clone()),
            dapp_url: meta.and_then(|m| m.url.clone()),
            dapp_icons: meta.and_then(|m| m.icons.clone()).unwrap_or_default(),
            active,
            status,
            approved_accounts,
            account,
        }
    }
}

#[async_trait]
impl TransactionEvents for BridgeRegistry {
    async fn on_transaction_submitted(&self, reference_id: u64, chain_hash: &str) -> Result<()> {
        self.approve_request(reference_id, Value::String(chain_hash.to_string()))
            .await
    }

    async fn on_transaction_rejected(&self, reference_id: u64) -> Result<()> {
        self.reject_request(reference_id, TRANSACTION_REJECTED_CODE, "Transaction rejected")
            .await
    }
}

fn context_key(id: &str) -> String {
    format!("{}{}", CONTEXT_KEY_PREFIX, id)
}

fn meta_has_account(meta: &SessionMeta, account: &str) -> bool {
    meta.account
        .as_deref()
        .is_some_and(|bound| crate::utils::same_account(bound, account))
        || meta
            .approved_accounts
            .as_deref()
            .is_some_and(|accounts| crate::utils::contains_account(accounts, account))
}
