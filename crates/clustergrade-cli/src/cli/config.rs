//! `clustergrade config show`.

use clustergrade_core::hub::HubOptions;
use clustergrade_types::config::UpgradeConfig;
use console::style;

use crate::state::AppState;

pub async fn show(state: &AppState, key: Option<&str>) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), HubOptions::default())?;

    match key {
        Some(key) => println!("{}", hub.config_value(key).await?),
        None => {
            let config = hub.config().await?;
            for line in config_lines(&config)? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// `key - value` for every key `config show` understands.
fn config_lines(config: &UpgradeConfig) -> anyhow::Result<Vec<String>> {
    UpgradeConfig::KEYS
        .iter()
        .map(|key| Ok(format!("{} - {}", style(key).bold(), config.get(key)?)))
        .collect()
}

