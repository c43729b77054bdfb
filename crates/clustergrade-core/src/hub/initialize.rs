//! The `initialize` step: capture the source, create the target cluster on
//! temporary ports and directories, and run the upgrade tool's checks.

use anyhow::Context;
use clustergrade_types::agent::UpgradeAction;
use clustergrade_types::cluster::Destination;
use clustergrade_types::config::{InitializeRequest, UpgradeConfig, parse_parent_backup_dirs};
use clustergrade_types::disk::{DF_ARGS, check_free_ratio, parse_df};
use clustergrade_types::step::{Step, Substep, SubstepStatus};
use clustergrade_types::version::validate_upgrade_path;

use super::{NextActionError, UpgradeHub, combine, ops, require, require_mut, target, tool_timestamp};
use crate::agent::{AgentConnector, execute_rpc};
use crate::catalog::{ClusterCatalogReader, load_cluster};
use crate::process::tools::OLD_TABLESPACES_FILE;
use crate::process::{CommandSpec, ProcessLauncher};
use crate::statement::PoolFactory;
use crate::workflow::{Admission, Completion, ConfigStore, Flow, OutStreams, StatusStore};

/// File in the state directory handed to `gpinitsystem`.
pub const GPINITSYSTEM_CONFIG: &str = "gpinitsystem_config";

impl<S, L, C, P, A> UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    /// Run the initialize step.
    pub async fn initialize(&self, request: &InitializeRequest) -> anyhow::Result<Completion> {
        let mut run = match self.begin(Step::Initialize).await? {
            Admission::Proceed(run) => run,
            Admission::Declined => return Ok(Completion::Quit),
        };

        let mut config = self.load_config().await?;
        let timestamp = tool_timestamp();

        run.run_conditionally(Substep::VerifyVersions, !request.skip_version_check, |_| {
            self.verify_versions(request)
        })
        .await;

        let slot = &mut config;
        run.run(Substep::SavingSourceClusterConfig, |_| async move {
            self.save_source_config(request, slot).await
        })
        .await;

        let current = &config;
        run.run_conditionally(Substep::CheckDiskSpace, request.disk_free_ratio > 0.0, |_| async move {
            self.check_disk_space(require(current)?).await
        })
        .await;

        run.always_run(Substep::ExecuteInitializeDataMigrationScripts, |_| async move {
            self.confirm_initialize_scripts()
        })
        .await;

        let slot = &mut config;
        run.run(Substep::GenerateTargetConfig, |_| async move {
            self.generate_target_config(slot).await
        })
        .await;

        let current = &config;
        let previous = run.status(Substep::InitTargetCluster);
        run.run(Substep::InitTargetCluster, |streams| async move {
            self.init_target_cluster(require(current)?, previous, streams)
                .await
        })
        .await;

        run.run(Substep::ShutdownTargetCluster, |streams| async move {
            let config = require(current)?;
            self.tools
                .stop(config.require_intermediate()?, &streams)
                .await
                .map(|()| Flow::Continue)
        })
        .await;

        run.run(Substep::BackupTargetCoordinator, |streams| async move {
            self.backup_target_coordinator(require(current)?, streams)
                .await
        })
        .await;

        let timestamp = timestamp.as_str();
        run.run(Substep::CheckUpgrade, |streams| async move {
            self.check_upgrade(require(current)?, timestamp, streams)
                .await
        })
        .await;

        Ok(run.complete(INITIALIZE_SUMMARY)?)
    }

    async fn verify_versions(&self, request: &InitializeRequest) -> anyhow::Result<Flow> {
        let source = self
            .tools
            .version(&request.source_gphome)
            .await
            .context("getting source cluster version")?;
        let target = self
            .tools
            .version(&request.target_gphome)
            .await
            .context("getting target cluster version")?;

        validate_upgrade_path(&source, &target)?;
        tracing::info!(%source, %target, "upgrade path supported");
        Ok(Flow::Continue)
    }

    async fn save_source_config(
        &self,
        request: &InitializeRequest,
        slot: &mut Option<UpgradeConfig>,
    ) -> anyhow::Result<Flow> {
        let version = self
            .tools
            .version(&request.source_gphome)
            .await
            .context("getting source cluster version")?;
        let catalog_version = self.tools.catalog_version(&request.source_gphome).await?;
        let source = load_cluster(
            &self.catalog,
            Destination::Source,
            &request.source_gphome,
            version,
            request.source_port,
        )
        .await?
        .with_catalog_version(catalog_version);

        let parent_backup_dirs = parse_parent_backup_dirs(request.parent_backup_dirs.as_deref(), &source)?;
        let config = UpgradeConfig {
            id: request.id,
            created_at: chrono::Utc::now(),
            source,
            intermediate: None,
            target: None,
            target_gphome: request.target_gphome.clone(),
            mode: request.mode,
            disk_free_ratio: request.disk_free_ratio,
            hub_port: request.hub_port,
            agent_port: request.agent_port,
            temp_ports: request.temp_ports.clone(),
            use_hba_hostnames: request.use_hba_hostnames,
            jobs: request.jobs,
            dynamic_library_path: request.dynamic_library_path.clone(),
            parent_backup_dirs,
        };

        let backup_dir = config.backup_dir(config.source.coordinator_hostname());
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;
        tokio::fs::write(
            backup_dir.join(OLD_TABLESPACES_FILE),
            ops::tablespaces_file_contents(&config.source),
        )
        .await
        .context("writing source tablespaces file")?;

        self.save_config(&config).await?;
        *slot = Some(config);
        Ok(Flow::Continue)
    }

    /// Every filesystem holding a source data directory must keep
    /// `disk_free_ratio` of its space free. The coordinator is checked here,
    /// the other hosts by their agents.
    async fn check_disk_space(&self, config: &UpgradeConfig) -> anyhow::Result<Flow> {
        let ratio = config.disk_free_ratio;
        let coordinator = config.source.coordinator();

        let local = async {
            let output = self
                .tools
                .launcher()
                .output(
                    CommandSpec::new("df")
                        .args(DF_ARGS)
                        .arg(coordinator.data_dir.display().to_string()),
                )
                .await?;
            check_free_ratio(&coordinator.hostname, &parse_df(&output)?, ratio)?;
            anyhow::Ok(())
        };
        let remote = async {
            let agents = self.agents(config).await?;
            execute_rpc(agents, |conn| {
                ops::check_disk_space_request(&conn.hostname, &config.source, ratio)
            })
            .await?;
            anyhow::Ok(())
        };
        let (local, remote) = tokio::join!(local, remote);

        combine([local, remote]).map_err(|error| NextActionError {
            error,
            next_action: format!(
                "Free disk space on the hosts listed above, or re-run initialize with a lower --disk-free-ratio (currently {ratio}); 0 disables the check."
            ),
        })?;
        tracing::info!(ratio, "disk space check passed");
        Ok(Flow::Continue)
    }

    fn confirm_initialize_scripts(&self) -> anyhow::Result<Flow> {
        if !self.gate.is_interactive() {
            return Ok(Flow::Skip);
        }

        let location = self
            .paths
            .data_migration_dir
            .as_ref()
            .map(|root| format!(" from {}", root.join("initialize").display()))
            .unwrap_or_default();
        let question = format!(
            "Have the \"initialize\" data migration scripts{location} been applied to the source cluster? Continue with initialize?"
        );

        if self.gate.ask(&question)? {
            Ok(Flow::Continue)
        } else {
            tracing::info!("operator stopped initialize to apply data migration scripts");
            Ok(Flow::Abort)
        }
    }

    async fn generate_target_config(&self, slot: &mut Option<UpgradeConfig>) -> anyhow::Result<Flow> {
        let config = require_mut(slot)?;
        let version = self
            .tools
            .version(&config.target_gphome)
            .await
            .context("getting target cluster version")?;
        let catalog_version = self.tools.catalog_version(&config.target_gphome).await?;

        let intermediate = target::intermediate_cluster(
            &config.source,
            &config.target_gphome,
            version,
            &catalog_version,
            &config.id,
            &config.temp_ports,
        )?;
        config.intermediate = Some(intermediate);
        self.save_config(config).await?;
        Ok(Flow::Continue)
    }

    /// Create the intermediate cluster. A run that previously started or
    /// failed here may have left a partial cluster behind, so its data
    /// directories are removed first.
    async fn init_target_cluster(
        &self,
        config: &UpgradeConfig,
        previous: Option<SubstepStatus>,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;

        if matches!(previous, Some(SubstepStatus::Running | SubstepStatus::Failed)) {
            tracing::info!(previous = ?previous, "removing target cluster left by an earlier attempt");
            self.delete_target_data_dirs(config, intermediate)
                .await
                .context("deleting target cluster data directories")?;
        }

        let file = self.paths.state_dir.join(GPINITSYSTEM_CONFIG);
        tokio::fs::write(&file, target::gpinitsystem_config(intermediate, config.use_hba_hostnames))
            .await
            .with_context(|| format!("writing {}", file.display()))?;

        self.tools
            .init_system(intermediate.gphome(), &file, &streams)
            .await
            .context("creating target cluster")?;
        Ok(Flow::Continue)
    }

    async fn backup_target_coordinator(
        &self,
        config: &UpgradeConfig,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;
        let backup_dir = config.backup_dir(config.source.coordinator_hostname());
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;

        let destination = backup_dir.join(ops::PRE_UPGRADE_BACKUP);
        self.tools
            .rsync(
                &ops::coordinator_rsync(intermediate.coordinator_data_dir(), &destination, ""),
                &streams,
            )
            .await?;
        Ok(Flow::Continue)
    }

    async fn check_upgrade(
        &self,
        config: &UpgradeConfig,
        timestamp: &str,
        streams: OutStreams,
    ) -> anyhow::Result<Flow> {
        let intermediate = config.require_intermediate()?;

        let (coordinator, primaries) = tokio::join!(
            self.upgrade_coordinator(config, intermediate, UpgradeAction::Check, timestamp, &streams),
            self.upgrade_primaries(config, intermediate, UpgradeAction::Check, timestamp),
        );

        combine([coordinator, primaries]).map_err(|error| NextActionError {
            error,
            next_action: self.check_next_action(config, timestamp),
        })?;
        Ok(Flow::Continue)
    }

    fn check_next_action(&self, config: &UpgradeConfig, timestamp: &str) -> String {
        let source = &config.source;
        let mut text = format!(
            "Consult the pg_upgrade check output files located: {}\n\
             Refer to the clustergrade documentation for details on the pg_upgrade check error.\n\n\
             If you haven't already, apply the \"initialize\" data migration scripts with\n\
             \"clustergrade apply --gphome {} --port {} --input-dir <scripts dir> --phase initialize\"",
            self.tools.runs_dir(timestamp).display(),
            source.gphome().display(),
            source.coordinator_port(),
        );

        if let Some(intermediate) = &config.intermediate {
            text.push_str(&format!(
                "\n\nTo connect to the intermediate target cluster:\n\
                 source {}\n\
                 MASTER_DATA_DIRECTORY={}\n\
                 PGPORT={}",
                intermediate.gphome().join("greenplum_path.sh").display(),
                intermediate.coordinator_data_dir().display(),
                intermediate.coordinator_port(),
            ));
        }
        text
    }
}

const INITIALIZE_SUMMARY: &str = "Initialize completed successfully.

To proceed with the upgrade, run \"clustergrade execute\"
followed by \"clustergrade finalize\".

To return the cluster to its original state, run \"clustergrade revert\".";
