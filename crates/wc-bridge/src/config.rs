use crate::PeerMeta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wallet-side settings shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Metadata announced to dApps when approving a session.
    #[serde(default = "default_client_meta")]
    pub client_meta: PeerMeta,

    /// Chain id reported on automatic approvals.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// How long a key exchange may stay unacknowledged.
    #[serde(default = "default_rotation_timeout_ms")]
    pub rotation_timeout_ms: u64,

    /// How long an outbound request waits for the peer's response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// First delay before reconnecting a dropped bridge connection. Doubles
    /// on every failed attempt up to `max_reconnect_delay_ms`.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_client_meta() -> PeerMeta {
    PeerMeta {
        name: Some("wc-bridge".to_string()),
        description: Some("WalletConnect wallet bridge".to_string()),
        ..Default::default()
    }
}

fn default_chain_id() -> u64 {
    1
}

fn default_rotation_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    64
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_meta: default_client_meta(),
            chain_id: default_chain_id(),
            rotation_timeout_ms: default_rotation_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl BridgeConfig {
    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.reconnect_delay_ms);
        let cap = Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms));
        base.saturating_mul(1u32 << attempt.min(16)).min(cap)
    }
}
