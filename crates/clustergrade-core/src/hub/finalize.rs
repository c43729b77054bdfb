//! The `finalize` step: add mirrors and standby to the upgraded cluster,
//! move it onto the source's ports and directories, and clean up.

use std::path::Path;

use anyhow::Context;
use clustergrade_types::cluster::Cluster;
use clustergrade_types::config::{Mode, UpgradeConfig};
use clustergrade_types::step::{Step, Substep};

use super::{UpgradeHub, ops, target};
use crate::agent::{AgentConnector, execute_rpc};
use crate::catalog::{ClusterCatalogReader, READY_POLL_INTERVAL, READY_TIMEOUT, wait_for_segments};
use crate::process::ProcessLauncher;
use crate::statement::PoolFactory;
use crate::workflow::{Admission, Completion, ConfigStore, Flow, OutStreams, StatusStore};

/// File in the state directory handed to `gpaddmirrors`.
pub const GPADDMIRRORS_CONFIG: &str = "gpaddmirrors_config";

impl<S, L, C, P, A> UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    /// Run the finalize step.
    pub async fn finalize(&self) -> anyhow::Result<Completion> {
        let mut config = self.config().await?;
        config.require_intermediate()?;

        let mut run = match self.begin(Step::Finalize).await? {
            Admission::Proceed(run) => run,
            Admission::Declined => return Ok(Completion::Quit),
        };
        let archive_dir = ops::log_archive_dir(&self.paths.log_dir, &config);
        let archive_dir = archive_dir.as_path();

        let current = &config;
        run.run_conditionally(Substep::UpgradeMirrors, current.source.has_mirrors(), |streams| {
            self.upgrade_mirrors(current, streams)
        })
        .await;

        run.run_conditionally(Substep::UpgradeStandby, current.source.has_standby(), |streams| {
            self.upgrade_standby(current, streams)
        })
        .await;

        run.run(Substep::WaitForClusterToBeReadyAfterAddingMirrorsAndStandby, |_| async move {
            let intermediate = current.require_intermediate()?;
            self.wait_until_ready(intermediate).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        let slot = &mut config;
        run.run(Substep::UpdateTargetCatalog, |streams| async move {
            self.update_target_catalog(slot, streams).await
        })
        .await;

        let current = &config;
        run.run(Substep::UpdateDataDirectories, |_| {
            self.update_data_directories(current)
        })
        .await;

        run.run(Substep::UpdateTargetConfFiles, |_| {
            self.update_target_conf_files(current)
        })
        .await;

        run.run(Substep::StartTargetCluster, |streams| async move {
            let target = current.target.as_ref().context("target cluster was not recorded")?;
            self.tools.start(target, &streams).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::WaitForClusterToBeReadyAfterUpdatingCatalog, |_| async move {
            let target = current.target.as_ref().context("target cluster was not recorded")?;
            self.wait_until_ready(target).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::ArchiveLogDirectories, |_| {
            self.archive_log_dirs(current, archive_dir)
        })
        .await;

        run.run(Substep::DeleteSegmentStatedirs, |_| {
            self.delete_segment_statedirs(current)
        })
        .await;

        let failed = run.has_failed();
        run.always_run(Substep::ExecuteFinalizeDataMigrationScripts, |_| async move {
            match (&current.target, failed) {
                (Some(target), false) => self.run_phase_scripts(current, "finalize", target).await,
                _ => {
                    tracing::info!("finalize did not reach the target cluster, not applying scripts");
                    Ok(Flow::Skip)
                }
            }
        })
        .await;

        run.disable_store();
        run.run(Substep::DeleteCoordinatorStatedir, |_| async move {
            ops::delete_dir_if_exists(&self.paths.state_dir).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        Ok(run.complete(finalize_summary(current, archive_dir))?)
    }

    async fn upgrade_mirrors(&self, config: &UpgradeConfig, streams: OutStreams) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        match config.mode {
            Mode::Link => self.copy_link_mode_mirrors(config, intermediate, &streams).await?,
            Mode::Copy => self.add_mirrors(config, intermediate, &streams).await?,
        }
        Ok(Flow::Continue)
    }

    /// In link mode the primaries share files with the source, so mirrors
    /// are created by copying the upgraded primaries while the cluster is
    /// down.
    async fn copy_link_mode_mirrors(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
        streams: &OutStreams,
    ) -> anyhow::Result<()> {
        let source = &config.source;
        self.tools.stop(intermediate, streams).await?;

        let agents = self.agents(config).await?;
        execute_rpc(agents, |conn| {
            ops::rsync_mirror_data_dirs_request(&conn.hostname, source, intermediate)
        })
        .await
        .context("copying primary data directories to mirrors")?;
        execute_rpc(agents, |conn| {
            ops::rsync_mirror_tablespaces_request(&conn.hostname, source, intermediate)
        })
        .await
        .context("copying primary tablespaces to mirrors")?;
        execute_rpc(agents, |conn| {
            ops::rename_mirror_tablespaces_request(&conn.hostname, source, intermediate)
        })
        .await
        .context("renaming mirror tablespaces")?;

        self.tools.start(intermediate, streams).await
    }

    async fn add_mirrors(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
        streams: &OutStreams,
    ) -> anyhow::Result<()> {
        let file = self.paths.state_dir.join(GPADDMIRRORS_CONFIG);
        tokio::fs::write(&file, target::gpaddmirrors_config(intermediate))
            .await
            .with_context(|| format!("writing {}", file.display()))?;

        let file = file.display().to_string();
        let mut args = vec!["-a", "-i", file.as_str()];
        if config.use_hba_hostnames {
            args.push("--hba-hostnames");
        }
        self.tools
            .launcher()
            .run(self.tools.greenplum_command(intermediate, "gpaddmirrors", &args), streams)
            .await
            .context("adding mirrors to the target cluster")?;
        Ok(())
    }

    async fn upgrade_standby(&self, config: &UpgradeConfig, streams: OutStreams) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        let Some(standby) = intermediate.standby() else {
            return Ok(Flow::Skip);
        };

        let port = standby.port.to_string();
        let dir = standby.data_dir.display().to_string();
        let mut args = vec!["-a", "-s", standby.hostname.as_str(), "-P", port.as_str(), "-S", dir.as_str()];
        if config.use_hba_hostnames {
            args.push("--hba-hostnames");
        }
        self.tools
            .launcher()
            .run(self.tools.greenplum_command(intermediate, "gpinitstandby", &args), &streams)
            .await
            .context("adding standby to the target cluster")?;
        Ok(Flow::Continue)
    }

    /// Point the catalog at the source's ports and data directories, then
    /// record the resulting target cluster.
    async fn update_target_catalog(
        &self,
        config: &mut UpgradeConfig,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        let target = target::target_cluster(&config.source, intermediate)?;

        self.tools.stop(intermediate, &streams).await?;
        self.tools.start_coordinator_only(intermediate, &streams).await?;
        self.catalog
            .update_segment_configuration(
                intermediate.coordinator_port(),
                intermediate.version().major,
                &target,
            )
            .await?;
        self.tools.stop_coordinator_only(intermediate, &streams).await?;

        tracing::info!(port = target.coordinator_port(), "updated target catalog");
        config.target = Some(target);
        self.save_config(config).await?;
        Ok(Flow::Continue)
    }

    /// Archive each source data directory as `<dir>_old` and move the
    /// intermediate one into its place, on the coordinator and through the
    /// agents.
    async fn update_data_directories(&self, config: &UpgradeConfig) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        swap_data_dir(
            config.source.coordinator_data_dir(),
            intermediate.coordinator_data_dir(),
        )
        .await
        .context("swapping coordinator data directory")?;

        let agents = self.agents(config).await?;
        execute_rpc(agents, |conn| {
            ops::rename_data_dirs_request(&conn.hostname, &config.source, intermediate)
        })
        .await
        .context("swapping segment data directories")?;
        Ok(Flow::Continue)
    }

    /// The moved data directories still carry the intermediate ports in
    /// `postgresql.conf` and the replication config; rewrite them to the
    /// target's, on the coordinator here and on the segment hosts through
    /// the agents.
    async fn update_target_conf_files(&self, config: &UpgradeConfig) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        let target = config.target.as_ref().context("target cluster was not recorded")?;

        ops::update_conf_files(&ops::conf_file_edits(target.coordinator(), intermediate, target))
            .await
            .context("updating coordinator configuration files")?;

        let agents = self.agents(config).await?;
        execute_rpc(agents, |conn| {
            ops::update_conf_files_request(&conn.hostname, intermediate, target)
        })
        .await
        .context("updating segment configuration files")?;
        Ok(Flow::Continue)
    }

    async fn wait_until_ready(&self, cluster: &Cluster) -> anyhow::Result<()> {
        wait_for_segments(
            &self.catalog,
            cluster.coordinator_port(),
            cluster.version().major,
            READY_TIMEOUT,
            READY_POLL_INTERVAL,
        )
        .await
        .with_context(|| format!("waiting for the {} cluster", cluster.destination()))
    }
}

/// `source` -> `source_old`, then `intermediate` -> `source`. A swap that
/// already happened is left alone.
async fn swap_data_dir(source: &Path, intermediate: &Path) -> anyhow::Result<()> {
    let archived = ops::with_old_suffix(source);
    let intermediate_exists = tokio::fs::try_exists(intermediate).await.unwrap_or(false);
    let archived_exists = tokio::fs::try_exists(&archived).await.unwrap_or(false);
    if !intermediate_exists && archived_exists {
        tracing::debug!(dir = %source.display(), "data directory already swapped");
        return Ok(());
    }

    ops::rename_dir(source, &archived).await?;
    ops::rename_dir(intermediate, source).await
}

fn finalize_summary(config: &UpgradeConfig, archive_dir: &Path) -> String {
    let connect = config
        .target
        .as_ref()
        .map(|target| {
            format!(
                "The target cluster is now upgraded to Greenplum {} and is ready to be used.

source {}
export MASTER_DATA_DIRECTORY={}
export PGPORT={}",
                target.version(),
                target.gphome().join("greenplum_path.sh").display(),
                target.coordinator_data_dir().display(),
                target.coordinator_port(),
            )
        })
        .unwrap_or_default();

    format!(
        "Finalize completed successfully.

{connect}

The source cluster is not running. Its data directories were kept with the
\"{}\" suffix; remove them once the upgrade is verified.

Logs were archived to {}.",
        ops::OLD_SUFFIX,
        archive_dir.display(),
    )
}
