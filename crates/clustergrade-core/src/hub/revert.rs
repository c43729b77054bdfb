//! The `revert` step: tear down the target cluster and bring the source
//! back. Refused once finalize has started.

use std::path::Path;

use clustergrade_types::cluster::Cluster;
use clustergrade_types::step::{Step, Substep};

use super::{UpgradeHub, ops};
use crate::agent::AgentConnector;
use crate::catalog::ClusterCatalogReader;
use crate::process::ProcessLauncher;
use crate::statement::PoolFactory;
use crate::workflow::{Admission, Completion, ConfigStore, Flow, StatusStore};

impl<S, L, C, P, A> UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    /// Run the revert step. On success the state directory is removed so a
    /// new upgrade can be initialized.
    pub async fn revert(&self) -> anyhow::Result<Completion> {
        let config = self.config().await?;
        if !self.store.read(Step::Finalize).await?.is_empty() {
            anyhow::bail!("cannot revert: finalize has already started");
        }

        let mut run = match self.begin(Step::Revert).await? {
            Admission::Proceed(run) => run,
            Admission::Declined => return Ok(Completion::Quit),
        };
        let archive_dir = ops::log_archive_dir(&self.paths.log_dir, &config);
        let archive_dir = archive_dir.as_path();
        let config = &config;
        let intermediate = config.intermediate.as_ref();

        run.run(Substep::ShutdownTargetCluster, |streams| async move {
            let Some(intermediate) = intermediate else {
                return Ok(Flow::Skip);
            };
            self.tools.stop(intermediate, &streams).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::DeleteTargetDataDirectories, |_| async move {
            let Some(intermediate) = intermediate else {
                return Ok(Flow::Skip);
            };
            self.delete_target_data_dirs(config, intermediate).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::DeleteTargetTablespaces, |_| async move {
            let Some(intermediate) = intermediate else {
                return Ok(Flow::Skip);
            };
            self.delete_target_tablespaces(config, intermediate).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        run.run(Substep::StartSourceCluster, |streams| async move {
            self.tools.start(&config.source, &streams).await?;
            anyhow::Ok(Flow::Continue)
        })
        .await;

        let failed = run.has_failed();
        run.always_run(Substep::ExecuteRevertDataMigrationScripts, |_| async move {
            if failed {
                tracing::info!("source cluster was not restored, not applying scripts");
                return Ok(Flow::Skip);
            }
            self.run_phase_scripts(config, "revert", &config.source).await
        })
        .await;

        run.run(Substep::ArchiveLogDirectories, |_| {
            self.archive_log_dirs(config, archive_dir)
        })
        .await;

        run.run(Substep::DeleteSegmentStatedirs, |_| {
            self.delete_segment_statedirs(config)
        })
        .await;

        let completion = run.complete(revert_summary(&config.source, archive_dir))?;
        if matches!(completion, Completion::Finished(_)) {
            ops::delete_dir_if_exists(&self.paths.state_dir).await?;
        }
        Ok(completion)
    }
}

fn revert_summary(source: &Cluster, archive_dir: &Path) -> String {
    format!(
        "Revert completed successfully.

The source cluster is now running version {}.
source {}
export MASTER_DATA_DIRECTORY={}
export PGPORT={}

Logs were archived to {}.

To restart the upgrade, run \"clustergrade initialize\" again.",
        source.version(),
        source.gphome().join("greenplum_path.sh").display(),
        source.coordinator_data_dir().display(),
        source.coordinator_port(),
        archive_dir.display(),
    )
}
