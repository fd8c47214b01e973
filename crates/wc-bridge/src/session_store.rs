use crate::storage::JsonStorage;
use crate::{Error, PeerData, Result, SessionConfig, SessionKey, SessionStatus, StorageAdapter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Durable state of one paired session, keyed by its handshake topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub config: SessionConfig,
    /// Our own identity as announced to the peer.
    pub client: PeerData,
    pub peer: Option<PeerData>,
    pub handshake_id: Option<u64>,
    pub current_key: SessionKey,
    /// Present only while a key exchange waits for acknowledgement.
    pub next_key: Option<SessionKey>,
    pub approved_accounts: Option<Vec<String>>,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl SessionRecord {
    pub fn new(config: SessionConfig, client: PeerData) -> Self {
        let current_key = config.key.clone();
        Self {
            config,
            client,
            peer: None,
            handshake_id: None,
            current_key,
            next_key: None,
            approved_accounts: None,
            chain_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.handshake_topic
    }

    pub fn status(&self) -> SessionStatus {
        if self.approved_accounts.is_some() {
            SessionStatus::Active
        } else if self.handshake_id.is_some() {
            SessionStatus::AwaitingApproval
        } else {
            SessionStatus::Fresh
        }
    }

    pub fn is_rotating(&self) -> bool {
        self.next_key.is_some()
    }
}

/// Persistence contract consumed by sessions and the registry.
///
/// `store` always replaces the full record. A missing record means the session
/// was never paired or has been terminated.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>>;
    async fn store(&self, id: &str, record: &SessionRecord) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<SessionRecord>>;
}

const SESSION_KEY_PREFIX: &str = "wc-session/";

/// [`SessionStore`] over any [`StorageAdapter`], one JSON document per session.
pub struct KvSessionStore {
    storage: Arc<dyn StorageAdapter>,
    writes: Mutex<()>,
}

impl KvSessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            writes: Mutex::new(()),
        }
    }

    fn key(id: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, id)
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.storage.get_json(&Self::key(id))
    }

    async fn store(&self, id: &str, record: &SessionRecord) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.storage.put_json(&Self::key(id), record)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.storage.del(&Self::key(id))
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut out = Vec::new();
        for key in self.storage.list(SESSION_KEY_PREFIX)? {
            match self.storage.get_json::<SessionRecord>(&key) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(Error::Json(e)) => {
                    warn!(key = %key, error = %e, "skipping unreadable session record")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
