//! The `execute` step: stop the source, upgrade the coordinator and
//! primaries into the intermediate cluster, and start it.

use anyhow::Context;
use clustergrade_types::agent::{RsyncOptions, UpgradeAction};
use clustergrade_types::cluster::Cluster;
use clustergrade_types::config::UpgradeConfig;
use clustergrade_types::step::{Step, Substep};
use futures_util::future::join_all;

use super::{NextActionError, UpgradeHub, ops, tool_timestamp};
use crate::agent::{AgentConnector, FanOutError, HostFailure};
use crate::catalog::ClusterCatalogReader;
use crate::process::ProcessLauncher;
use crate::process::tools::OLD_TABLESPACES_FILE;
use crate::statement::{PoolFactory, PoolOptions, Statement, execute_statements};
use crate::workflow::{Admission, Completion, ConfigStore, Flow, OutStreams, StatusStore};

impl<S, L, C, P, A> UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    /// Run the execute step.
    pub async fn execute(&self) -> anyhow::Result<Completion> {
        let config = self.config().await?;
        let intermediate = config.require_intermediate()?;

        let mut run = match self.begin(Step::Execute).await? {
            Admission::Proceed(run) => run,
            Admission::Declined => return Ok(Completion::Quit),
        };
        let timestamp = tool_timestamp();
        let timestamp = timestamp.as_str();
        let config = &config;

        run.run(Substep::CheckActiveConnections, |streams| {
            self.check_active_connections(&config.source, streams)
        })
        .await;

        run.run(Substep::ShutdownSourceCluster, |streams| async move {
            self.tools.stop(&config.source, &streams).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::UpgradeCoordinator, |streams| async move {
            self.upgrade_coordinator(config, intermediate, UpgradeAction::Upgrade, timestamp, &streams)
                .await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::CopyCoordinator, |streams| {
            self.copy_coordinator(config, intermediate, streams)
        })
        .await;

        run.run(Substep::UpgradePrimaries, |_| async move {
            self.upgrade_primaries(config, intermediate, UpgradeAction::Upgrade, timestamp)
                .await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::StartTargetCluster, |streams| async move {
            self.tools.start(intermediate, &streams).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run_conditionally(
            Substep::ReindexInvalidIndexes,
            intermediate.version().major == 6,
            |_| self.reindex_invalid_indexes(config, intermediate),
        )
        .await;

        run.run_conditionally(
            Substep::RebuildTsvectorTables,
            intermediate.version().major == 6,
            |_| self.rebuild_tsvector_tables(config, intermediate),
        )
        .await;

        Ok(run.complete(execute_summary(intermediate))?)
    }

    /// Refuse to stop a source cluster that still has client sessions.
    async fn check_active_connections(
        &self,
        source: &Cluster,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        if !self.tools.is_coordinator_running(source, &streams).await? {
            tracing::info!("source cluster is not running, no connections to check");
            return Ok(Flow::Continue);
        }

        let active = self
            .catalog
            .active_connections(source.coordinator_port(), source.version().major)
            .await?;
        if active.is_empty() {
            return Ok(Flow::Continue);
        }

        let listing = active
            .iter()
            .map(|conn| format!("  {conn}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(NextActionError {
            error: anyhow::anyhow!(
                "found {} active connections to the source cluster:\n{listing}",
                active.len()
            ),
            next_action: "Close all client connections to the source cluster and re-run \
                          \"clustergrade execute\"."
                .to_string(),
        }
        .into())
    }

    /// Send the upgraded coordinator and the tablespace listing to every
    /// primary host's backup directory. The segments' upgrade tool runs
    /// against this copy.
    async fn copy_coordinator(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        let tablespaces_file = config
            .backup_dir(config.source.coordinator_hostname())
            .join(OLD_TABLESPACES_FILE);
        let hosts = intermediate.primary_hostnames();

        let copies = hosts.iter().map(|host| {
            let backup_dir = config.backup_dir(host);
            let coordinator = ops::coordinator_rsync(
                intermediate.coordinator_data_dir(),
                &backup_dir.join(ops::POST_UPGRADE_BACKUP),
                host,
            );
            let listing = RsyncOptions {
                sources: vec![tablespaces_file.clone()],
                destination: backup_dir,
                destination_host: host.clone(),
                options: vec!["--archive".to_string()],
                excluded_files: Vec::new(),
            };
            let streams = &streams;
            async move {
                self.tools.rsync(&coordinator, streams).await?;
                self.tools.rsync(&listing, streams).await?;
                anyhow::Ok(())
            }
        });

        let failures: Vec<HostFailure> = join_all(copies)
            .await
            .into_iter()
            .zip(&hosts)
            .filter_map(|(result, host)| {
                result.err().map(|e| HostFailure {
                    host: host.clone(),
                    message: format!("{e:#}"),
                })
            })
            .collect();

        if let Some(err) = FanOutError::from_failures(failures) {
            return Err(err).context("copying coordinator to primary hosts");
        }
        tracing::info!(hosts = hosts.len(), "copied upgraded coordinator");
        Ok(Flow::Continue)
    }

    /// Rebuild the indexes the upgrade left invalid, database by database.
    async fn reindex_invalid_indexes(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
    ) -> anyhow::Result<Flow> {
        let port = intermediate.coordinator_port();
        let major = intermediate.version().major;

        for database in self.catalog.databases(port, major).await? {
            let commands = self
                .catalog
                .invalid_index_commands(port, major, &database)
                .await?;
            if commands.is_empty() {
                continue;
            }

            tracing::info!(database = %database, indexes = commands.len(), "reindexing invalid indexes");
            let options = PoolOptions::new(port, major)
                .database(&database)
                .jobs(Self::jobs(config));
            let statements = commands.into_iter().map(Statement::Command).collect();
            execute_statements(&self.pools, &options, statements, Some(&self.bus))
                .await
                .with_context(|| format!("reindexing database {database:?}"))?;
        }
        Ok(Flow::Continue)
    }

    /// tsvector's on-disk format changed in 6; rewrite every tsvector column
    /// through text so its values are stored in the new layout.
    async fn rebuild_tsvector_tables(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
    ) -> anyhow::Result<Flow> {
        let port = intermediate.coordinator_port();
        let major = intermediate.version().major;

        for database in self.catalog.databases(port, major).await? {
            let commands = self.catalog.tsvector_commands(port, major, &database).await?;
            if commands.is_empty() {
                continue;
            }

            tracing::info!(database = %database, columns = commands.len(), "rebuilding tsvector tables");
            let options = PoolOptions::new(port, major)
                .database(&database)
                .jobs(Self::jobs(config));
            let statements = commands.into_iter().map(Statement::Command).collect();
            execute_statements(&self.pools, &options, statements, Some(&self.bus))
                .await
                .with_context(|| format!("rebuilding tsvector tables in database {database:?}"))?;
        }
        Ok(Flow::Continue)
    }
}

fn execute_summary(intermediate: &Cluster) -> String {
    format!(
        "Execute completed successfully.

The target cluster is now running. You may now run queries against the
target database and perform any other validation desired prior to
finalizing your upgrade.

source {}
export MASTER_DATA_DIRECTORY={}
export PGPORT={}

WARNING: If any queries modify the target database before \"clustergrade
finalize\", it will be inconsistent with the source database.

To finish the upgrade, run \"clustergrade finalize\".
To return the cluster to its original state, run \"clustergrade revert\".",
        intermediate.gphome().join("greenplum_path.sh").display(),
        intermediate.coordinator_data_dir().display(),
        intermediate.coordinator_port(),
    )
}
