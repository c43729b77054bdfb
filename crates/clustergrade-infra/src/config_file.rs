//! Loader for `initialize --file` TOML files.

use std::path::Path;

use clustergrade_types::config::{InitializeFile, InitializeRequest, UpgradeId};
use clustergrade_types::error::ConfigError;

/// Read and parse an initialize file.
///
/// Unlike optional settings files, a missing or malformed file is an error:
/// the operator named it explicitly.
pub async fn load_initialize_file(path: &Path) -> Result<InitializeFile, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::File(format!("reading {}: {e}", path.display())))?;

    let file = toml::from_str::<InitializeFile>(&content)
        .map_err(|e| ConfigError::File(format!("parsing {}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), "loaded initialize file");
    Ok(file)
}

/// Load `path` and turn it into a validated request for upgrade `id`.
pub async fn initialize_request_from_file(
    path: &Path,
    id: UpgradeId,
) -> Result<InitializeRequest, ConfigError> {
    InitializeRequest::from_file(id, load_initialize_file(path).await?)
}
