use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const SESSION_REQUEST_METHOD: &str = "wc_sessionRequest";
pub const SESSION_UPDATE_METHOD: &str = "wc_sessionUpdate";
pub const EXCHANGE_KEY_METHOD: &str = "wc_exchangeKey";
pub const SEND_TRANSACTION_METHOD: &str = "eth_sendTransaction";
pub const SIGN_MESSAGE_METHOD: &str = "eth_sign";

/// Prefix of the methods reserved by the bridge protocol itself.
pub const PROTOCOL_METHOD_PREFIX: &str = "wc_";

pub const KEY_LENGTH: usize = 32;

/// Symmetric AES-256 key shared with the peer.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)?;
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::InvalidKey(format!("expected {} bytes, got {}", KEY_LENGTH, v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

// Never print key material.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl Serialize for SessionKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SessionKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Descriptive metadata a peer announces about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icons: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
}

impl PeerMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PeerMeta>,
}

/// Parameters of a session approval, rejection or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub approved: bool,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SessionParams {
    pub fn approved(accounts: Vec<String>, chain_id: u64) -> Self {
        Self {
            approved: true,
            chain_id: Some(chain_id),
            accounts: Some(accounts),
            message: None,
        }
    }

    pub fn rejected(message: Option<String>) -> Self {
        Self {
            approved: false,
            chain_id: None,
            accounts: None,
            message,
        }
    }
}

/// Fields of an `eth_sendTransaction` request, kept as the hex strings the dApp sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: String,
    pub to: String,
    pub nonce: String,
    pub gas_price: String,
    pub gas_limit: String,
    pub value: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodCall {
    SessionRequest {
        id: u64,
        peer: PeerData,
    },
    SessionUpdate {
        id: u64,
        params: SessionParams,
    },
    ExchangeKey {
        id: u64,
        next_key: SessionKey,
        peer: PeerData,
    },
    SendTransaction {
        id: u64,
        transaction: TransactionRequest,
    },
    SignMessage {
        id: u64,
        address: String,
        message: String,
    },
    Custom {
        id: u64,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<RpcError>,
    },
}

impl MethodCall {
    pub fn id(&self) -> u64 {
        match self {
            MethodCall::SessionRequest { id, .. }
            | MethodCall::SessionUpdate { id, .. }
            | MethodCall::ExchangeKey { id, .. }
            | MethodCall::SendTransaction { id, .. }
            | MethodCall::SignMessage { id, .. }
            | MethodCall::Custom { id, .. }
            | MethodCall::Response { id, .. } => *id,
        }
    }

    /// JSON-RPC method name, `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match self {
            MethodCall::SessionRequest { .. } => Some(SESSION_REQUEST_METHOD),
            MethodCall::SessionUpdate { .. } => Some(SESSION_UPDATE_METHOD),
            MethodCall::ExchangeKey { .. } => Some(EXCHANGE_KEY_METHOD),
            MethodCall::SendTransaction { .. } => Some(SEND_TRANSACTION_METHOD),
            MethodCall::SignMessage { .. } => Some(SIGN_MESSAGE_METHOD),
            MethodCall::Custom { method, .. } => Some(method),
            MethodCall::Response { .. } => None,
        }
    }

    /// Account a signing request acts on; it must be one of the approved accounts.
    pub fn signing_account(&self) -> Option<&str> {
        match self {
            MethodCall::SendTransaction { transaction, .. } => Some(&transaction.from),
            MethodCall::SignMessage { address, .. } => Some(address),
            _ => None,
        }
    }

    pub fn result(id: u64, result: Value) -> Self {
        MethodCall::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        MethodCall::Response {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Lifecycle of a paired session as seen by the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Fresh,
    AwaitingApproval,
    Active,
    Closed,
}

/// Notifications fanned out to every subscriber of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Approved,
    Closed { reason: Option<String> },
    MethodCall(MethodCall),
}
