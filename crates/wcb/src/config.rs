use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wc_bridge::BridgeConfig;

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Account approved for new pairings when `--account` is not given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let mut config: Config = serde_json::from_str(&content)
                .context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&self.path, content)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_account(&mut self, account: &str) -> Result<()> {
        let account = account.trim();
        if !is_address(account) {
            anyhow::bail!("Invalid account address: {}", account);
        }
        self.account = Some(account.to_string());
        self.save()
    }

    /// `explicit` when given, the stored default otherwise.
    pub fn account_or(&self, explicit: Option<String>) -> Option<String> {
        explicit.or_else(|| self.account.clone())
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_address(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ACCOUNT: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn test_config_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert!(config.account.is_none());
        assert_eq!(config.bridge, BridgeConfig::default());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.set_account(ACCOUNT).unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.account.as_deref(), Some(ACCOUNT));
    }

    #[test]
    fn test_config_partial_bridge_section() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{ "bridge": { "chainId": 5 } }"#,
        )
        .unwrap();

        let config = Config::load(temp.path()).unwrap();
        assert_eq!(config.bridge.chain_id, 5);
        assert_eq!(
            config.bridge.rotation_timeout_ms,
            BridgeConfig::default().rotation_timeout_ms
        );
    }

    #[test]
    fn test_set_account_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        assert!(config.set_account("not-an-address").is_err());
        assert!(config.account.is_none());
        assert!(!temp.path().join("config.json").exists());
    }

    #[test]
    fn test_account_or_prefers_explicit() {
        let config = Config {
            account: Some(ACCOUNT.to_string()),
            ..Default::default()
        };
        assert_eq!(config.account_or(Some("0x1".to_string())).as_deref(), Some("0x1"));
        assert_eq!(config.account_or(None).as_deref(), Some(ACCOUNT));
    }
}
