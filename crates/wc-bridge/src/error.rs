use thiserror::Error;

/// JSON-RPC error code sent back when a request could not be decoded.
pub const INVALID_REQUEST_CODE: i64 = 23;
/// JSON-RPC error code for signing requests naming a non-approved account.
pub const INVALID_ACCOUNT_CODE: i64 = 3141;
/// JSON-RPC error code for methods this bridge does not understand.
pub const UNKNOWN_METHOD_CODE: i64 = 4242;
/// JSON-RPC error code used when the wallet rejected a transaction.
pub const TRANSACTION_REJECTED_CODE: i64 = 4567;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Integrity check failed")]
    Integrity,

    #[error("Invalid payload: {reason}")]
    InvalidPayload { id: Option<u64>, reason: String },

    #[error("Unsupported method: {method}")]
    UnsupportedMethod { id: u64, method: String },

    #[error("Invalid account request: {account}")]
    InvalidAccount { id: u64, account: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol state error: {0}")]
    ProtocolState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid pairing uri: {0}")]
    InvalidUri(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session closed")]
    SessionClosed,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl Error {
    pub(crate) fn invalid_payload(id: Option<u64>, reason: impl Into<String>) -> Self {
        Error::InvalidPayload {
            id,
            reason: reason.into(),
        }
    }

    /// The JSON-RPC id this error can be answered under, if one was recovered.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Error::InvalidPayload { id, .. } => *id,
            Error::UnsupportedMethod { id, .. } | Error::InvalidAccount { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Error code used when answering the peer with this error.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::UnsupportedMethod { .. } => UNKNOWN_METHOD_CODE,
            Error::InvalidAccount { .. } => INVALID_ACCOUNT_CODE,
            _ => INVALID_REQUEST_CODE,
        }
    }

    /// Transport failures are transient; callers may retry once reconnected.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
