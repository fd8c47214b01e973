use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use wc_bridge::BridgeConfig;

use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EffectiveConfig<'a> {
    data_dir: &'a Path,
    account: Option<&'a str>,
    bridge: &'a BridgeConfig,
}

pub async fn show(config: &Config, data_dir: &Path, output: &Output) -> Result<()> {
    output.success(
        "config",
        EffectiveConfig {
            data_dir,
            account: config.account.as_deref(),
            bridge: &config.bridge,
        },
    );
    Ok(())
}

pub async fn set_account(account: &str, config: &mut Config, output: &Output) -> Result<()> {
    config.set_account(account)?;
    output.done("set-account", &format!("Default account set to {}", account.trim()));
    Ok(())
}
