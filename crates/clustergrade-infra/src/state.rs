//! JSON files in the hub's state directory.
//!
//! Implements `StatusStore` and `ConfigStore` from `clustergrade-core`:
//! `status.json` holds the substep statuses of every step stamped with the
//! upgrade id that wrote them, `config.json` holds the [`UpgradeConfig`].
//! Every write goes to a temporary file in the same directory that is then
//! renamed over the old file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use clustergrade_core::workflow::{ConfigStore, StatusStore};
use clustergrade_types::config::{UpgradeConfig, UpgradeId};
use clustergrade_types::error::StoreError;
use clustergrade_types::step::{Step, Substep, SubstepStatus, SubstepStatuses};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::paths;

/// On-disk shape of `status.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StatusFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upgrade_id: Option<UpgradeId>,
    #[serde(default)]
    steps: BTreeMap<Step, SubstepStatuses>,
}

/// File-backed status and config store.
pub struct JsonStateStore {
    dir: PathBuf,
    /// Id stamped on writes. When unset, the id of the saved config is used.
    upgrade_id: Option<UpgradeId>,
    /// Serializes read-modify-write cycles on `status.json`.
    lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            upgrade_id: None,
            lock: Mutex::new(()),
        }
    }

    /// Pin the upgrade id, for `initialize` runs that have not saved a
    /// config yet.
    pub fn with_upgrade_id(mut self, id: UpgradeId) -> Self {
        self.upgrade_id = Some(id);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn current_id(&self) -> Result<Option<UpgradeId>, StoreError> {
        if let Some(id) = self.upgrade_id {
            return Ok(Some(id));
        }
        Ok(self.load().await?.map(|config| config.id))
    }

    /// The status file, or an empty one when it is missing or belongs to
    /// another upgrade.
    async fn read_status(&self, current: Option<UpgradeId>) -> Result<StatusFile, StoreError> {
        let path = paths::status_path(&self.dir);
        let Some(text) = read_optional(&path).await? else {
            return Ok(StatusFile::default());
        };
        let file: StatusFile = serde_json::from_str(&text)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;

        match (file.upgrade_id, current) {
            (Some(found), Some(current)) if found != current => {
                tracing::info!(
                    found = %found,
                    current = %current,
                    "ignoring statuses recorded by another upgrade"
                );
                Ok(StatusFile::default())
            }
            _ => Ok(file),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Read(format!("{}: {err}", path.display()))),
    }
}

/// Replace `path` with `bytes` via a synced temporary file and a rename.
async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Write(format!("{}: {e}", path.display())))?;

    result.map_err(|e| StoreError::Write(format!("{}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Store implementations
// ---------------------------------------------------------------------------

impl StatusStore for JsonStateStore {
    async fn read(&self, step: Step) -> Result<SubstepStatuses, StoreError> {
        let current = self.current_id().await?;
        let mut file = self.read_status(current).await?;
        Ok(file.steps.remove(&step).unwrap_or_default())
    }

    async fn write(
        &self,
        step: Step,
        substep: Substep,
        status: SubstepStatus,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let current = self.current_id().await?;
        let mut file = self.read_status(current).await?;
        file.upgrade_id = current;
        file.steps.entry(step).or_default().set(substep, status);

        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| StoreError::Write(format!("serializing statuses: {e}")))?;
        write_atomic(&paths::status_path(&self.dir), json).await?;
        tracing::debug!(step = %step, substep = %substep, status = %status, "recorded status");
        Ok(())
    }
}

impl ConfigStore for JsonStateStore {
    async fn load(&self) -> Result<Option<UpgradeConfig>, StoreError> {
        let path = paths::config_path(&self.dir);
        let Some(text) = read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }

    async fn save(&self, config: &UpgradeConfig) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| StoreError::Write(format!("serializing config: {e}")))?;
        write_atomic(&paths::config_path(&self.dir), json).await
    }
}
