//! Wallet side of the WalletConnect v1 bridge protocol.
//!
//! A dApp shows a `wc:` pairing URI; the wallet parses it into a
//! [`SessionConfig`], joins the handshake topic on the relay and answers the
//! dApp's session request. All traffic is JSON-RPC inside AES-256-CBC envelopes
//! authenticated with HMAC-SHA256. Keys are rotated right after the handshake.
//!
//! [`Session`] drives one pairing; [`BridgeRegistry`] owns every session of the
//! wallet and routes answers to the session a request came from.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file_storage;
pub mod queue;
pub mod registry;
pub mod session;
pub mod session_store;
pub mod storage;
pub mod transport;
pub mod types;
pub mod uri;
pub mod utils;

pub use config::BridgeConfig;
pub use crypto::EncryptedPayload;
pub use error::{
    Error, Result, INVALID_ACCOUNT_CODE, INVALID_REQUEST_CODE, TRANSACTION_REJECTED_CODE,
    UNKNOWN_METHOD_CODE,
};
pub use file_storage::FileStorageAdapter;
pub use registry::{BridgeRegistry, RegistryEvent, SessionMeta, TransactionEvents};
pub use session::{SendOutcome, Session, SessionInfo};
pub use session_store::{KvSessionStore, SessionRecord, SessionStore};
pub use storage::{InMemoryStorage, JsonStorage, StorageAdapter};
pub use transport::{
    Message, MessageType, Transport, TransportBuilder, TransportEvent, TransportStatus,
};
pub use types::*;
pub use uri::SessionConfig;
