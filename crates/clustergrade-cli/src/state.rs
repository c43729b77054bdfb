//! Wires the hub's ports to the infrastructure adapters.
//!
//! `UpgradeHub` is generic over its store, launcher, catalog, pool factory
//! and agent connector; [`Hub`] pins them to the concrete infra types.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clustergrade_core::hub::{HubOptions, HubPaths, UpgradeHub};
use clustergrade_core::process::UpgradeToolRunner;
use clustergrade_core::workflow::{AutoConfirm, ConfigStore, ConfirmationGate};
use clustergrade_infra::agent_http::HttpAgentConnector;
use clustergrade_infra::paths::{resolve_data_migration_dir, resolve_log_dir, resolve_state_dir};
use clustergrade_infra::postgres::{PgCatalogReader, PgPoolFactory};
use clustergrade_infra::process::TokioProcessLauncher;
use clustergrade_infra::state::JsonStateStore;
use clustergrade_types::config::UpgradeId;

use crate::gate::DialoguerGate;

pub type Hub = UpgradeHub<
    JsonStateStore,
    TokioProcessLauncher,
    PgCatalogReader,
    PgPoolFactory,
    HttpAgentConnector,
>;

/// Process-wide settings shared by every command.
#[derive(Debug, Clone)]
pub struct AppState {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub data_migration_dir: PathBuf,
    pub verbose: u8,
    pub non_interactive: bool,
}

impl AppState {
    pub fn resolve(verbose: u8, non_interactive: bool) -> Self {
        Self {
            state_dir: resolve_state_dir(),
            log_dir: resolve_log_dir(),
            data_migration_dir: resolve_data_migration_dir(),
            verbose,
            non_interactive,
        }
    }

    pub fn gate(&self) -> Arc<dyn ConfirmationGate> {
        if self.non_interactive {
            Arc::new(AutoConfirm)
        } else {
            Arc::new(DialoguerGate)
        }
    }

    pub fn store(&self) -> JsonStateStore {
        JsonStateStore::new(&self.state_dir)
    }

    /// Id for an `initialize` run: the saved upgrade's when re-running,
    /// otherwise a new one.
    pub async fn initialize_id(&self) -> anyhow::Result<UpgradeId> {
        let existing = self.store().load().await.context("reading saved configuration")?;
        Ok(existing.map(|config| config.id).unwrap_or_default())
    }

    pub fn hub(&self, store: JsonStateStore, options: HubOptions) -> anyhow::Result<Hub> {
        let connector = HttpAgentConnector::from_env().context("building the agent client")?;
        let paths = HubPaths {
            state_dir: self.state_dir.clone(),
            log_dir: self.log_dir.clone(),
            data_migration_dir: Some(self.data_migration_dir.clone()),
        };
        Ok(UpgradeHub::new(
            store,
            UpgradeToolRunner::new(TokioProcessLauncher::new(), &self.log_dir),
            PgCatalogReader::new(),
            PgPoolFactory::new(),
            connector,
            self.gate(),
            paths,
        )
        .with_options(options))
    }
}
