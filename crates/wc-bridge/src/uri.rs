use crate::{Error, Result, SessionKey};
use serde::{Deserialize, Serialize};

pub const WC_PROTOCOL: &str = "wc";
pub const WC_VERSION: u32 = 1;

/// Immutable pairing parameters taken from a `wc:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub handshake_topic: String,
    pub bridge: String,
    pub key: SessionKey,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_protocol() -> String {
    WC_PROTOCOL.to_string()
}

fn default_version() -> u32 {
    WC_VERSION
}

impl SessionConfig {
    pub fn new(handshake_topic: impl Into<String>, bridge: impl Into<String>, key: SessionKey) -> Self {
        Self {
            handshake_topic: handshake_topic.into(),
            bridge: bridge.into(),
            key,
            protocol: default_protocol(),
            version: default_version(),
        }
    }

    /// Parses `wc:{topic}@{version}?bridge={url-encoded bridge}&key={hex key}`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (protocol, rest) = uri
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri("missing protocol".to_string()))?;
        if protocol != WC_PROTOCOL {
            return Err(Error::InvalidUri(format!("unexpected protocol {}", protocol)));
        }

        let (topic, rest) = rest
            .split_once('@')
            .ok_or_else(|| Error::InvalidUri("missing version".to_string()))?;
        if topic.is_empty() {
            return Err(Error::InvalidUri("empty handshake topic".to_string()));
        }

        let (version, query) = rest
            .split_once('?')
            .ok_or_else(|| Error::InvalidUri("missing query".to_string()))?;
        let version: u32 = version
            .parse()
            .map_err(|_| Error::InvalidUri(format!("invalid version {}", version)))?;

        let mut bridge = None;
        let mut key = None;
        for pair in query.split('&') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(value).map_err(|e| Error::InvalidUri(e.to_string()))?;
            match name {
                "bridge" => bridge = Some(value.into_owned()),
                "key" => key = Some(value.into_owned()),
                _ => {}
            }
        }

        let bridge = bridge
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::InvalidUri("missing bridge".to_string()))?;
        let key = key.ok_or_else(|| Error::InvalidUri("missing key".to_string()))?;
        let key = SessionKey::from_hex(&key).map_err(|e| Error::InvalidUri(e.to_string()))?;

        Ok(Self {
            handshake_topic: topic.to_string(),
            bridge,
            key,
            protocol: protocol.to_string(),
            version,
        })
    }

    pub fn to_uri(&self) -> String {
        format!(
            "{}:{}@{}?bridge={}&key={}",
            self.protocol,
            self.handshake_topic,
            self.version,
            urlencoding::encode(&self.bridge),
            self.key.to_hex()
        )
    }
}
