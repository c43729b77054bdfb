//! Upgrade steps and the hub that runs them.
//!
//! [`UpgradeHub`] owns every port the steps need and exposes one method per
//! step: [`initialize`](initialize), [`execute`](execute),
//! [`finalize`](finalize) and [`revert`](revert). Each method registers its
//! substeps on a [`StepRun`] in a fixed order.
//!
//! - [`target`]: intermediate/target topology generation and utility config files
//! - [`ops`]: per-host agent requests and local directory operations
//! - [`scripts`]: data migration script application

pub mod execute;
pub mod finalize;
pub mod initialize;
pub mod ops;
pub mod revert;
pub mod scripts;
pub mod target;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clustergrade_types::agent::{AgentRequest, UpgradeAction};
use clustergrade_types::cluster::Cluster;
use clustergrade_types::config::UpgradeConfig;
use clustergrade_types::error::{ConfigError, ConnectError};
use clustergrade_types::step::{Step, SubstepStatuses};
use tokio::sync::OnceCell;

use crate::agent::{AgentConnection, AgentConnector, execute_rpc};
use crate::catalog::ClusterCatalogReader;
use crate::event::bus::EventBus;
use crate::process::{ProcessLauncher, UpgradeToolRunner};
use crate::statement::PoolFactory;
use crate::workflow::{
    Admission, ConfigStore, ConfirmationGate, Flow, OutStreams, StatusStore, StepError, StepRun,
};

/// Filesystem locations used by the hub.
#[derive(Debug, Clone)]
pub struct HubPaths {
    /// Holds `status.json`, `config.json` and generated utility config files.
    pub state_dir: PathBuf,
    /// Log directory archived at the end of finalize and revert.
    pub log_dir: PathBuf,
    /// Root of the data migration scripts, one subdirectory per step.
    pub data_migration_dir: Option<PathBuf>,
}

/// Knobs passed through to the upgrade tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubOptions {
    pub pg_upgrade_verbose: bool,
    pub skip_pg_upgrade_checks: bool,
}

/// An error with a remediation to print after it.
#[derive(Debug, thiserror::Error)]
#[error("{error:#}")]
pub struct NextActionError {
    pub error: anyhow::Error,
    pub next_action: String,
}

/// Runs the upgrade steps.
///
/// Generic over every port so tests can substitute in-memory mocks, the same
/// way the production binary wires in the infrastructure adapters.
pub struct UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    store: S,
    tools: UpgradeToolRunner<L>,
    catalog: C,
    pools: P,
    connector: A,
    agents: OnceCell<Vec<AgentConnection>>,
    gate: Arc<dyn ConfirmationGate>,
    bus: EventBus,
    paths: HubPaths,
    options: HubOptions,
}

impl<S, L, C, P, A> UpgradeHub<S, L, C, P, A>
where
    S: StatusStore + ConfigStore,
    L: ProcessLauncher,
    C: ClusterCatalogReader,
    P: PoolFactory,
    A: AgentConnector,
{
    pub fn new(
        store: S,
        tools: UpgradeToolRunner<L>,
        catalog: C,
        pools: P,
        connector: A,
        gate: Arc<dyn ConfirmationGate>,
        paths: HubPaths,
    ) -> Self {
        Self {
            store,
            tools,
            catalog,
            pools,
            connector,
            agents: OnceCell::new(),
            gate,
            bus: EventBus::default(),
            paths,
            options: HubOptions::default(),
        }
    }

    pub fn with_options(mut self, options: HubOptions) -> Self {
        self.options = options;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn paths(&self) -> &HubPaths {
        &self.paths
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }

    // -----------------------------------------------------------------------
    // Queries used by the CLI
    // -----------------------------------------------------------------------

    /// The persisted configuration.
    pub async fn config(&self) -> anyhow::Result<UpgradeConfig> {
        self.store
            .load()
            .await?
            .ok_or_else(|| ConfigError::NotInitialized.into())
    }

    /// Value of one `config show` key.
    pub async fn config_value(&self, name: &str) -> anyhow::Result<String> {
        Ok(self.config().await?.get(name)?)
    }

    /// Recorded statuses of every step, in step order.
    pub async fn statuses(&self) -> anyhow::Result<Vec<(Step, SubstepStatuses)>> {
        let mut all = Vec::new();
        for step in Step::ALL {
            all.push((step, self.store.read(step).await?));
        }
        Ok(all)
    }

    /// Ask every agent to exit.
    pub async fn stop_agents(&self) -> anyhow::Result<()> {
        let config = self.config().await?;
        let agents = self.agents(&config).await?;
        execute_rpc(agents, |_| Some(AgentRequest::StopAgent)).await?;
        tracing::info!(hosts = agents.len(), "stopped agents");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared plumbing for the step modules
    // -----------------------------------------------------------------------

    /// Connect to the agents of `config`'s source cluster once per process.
    async fn agents(&self, config: &UpgradeConfig) -> Result<&[AgentConnection], ConnectError> {
        let hosts = config.source.agent_hostnames();
        let port = config.agent_port;
        self.agents
            .get_or_try_init(|| self.connector.connect(&hosts, port))
            .await
            .map(Vec::as_slice)
    }

    async fn begin(&self, step: Step) -> Result<Admission<&S>, StepError> {
        StepRun::begin(step, &self.store, self.bus.clone(), self.gate.as_ref(), false).await
    }

    async fn load_config(&self) -> anyhow::Result<Option<UpgradeConfig>> {
        Ok(self.store.load().await?)
    }

    async fn save_config(&self, config: &UpgradeConfig) -> anyhow::Result<()> {
        self.store.save(config).await?;
        Ok(())
    }

    fn jobs(config: &UpgradeConfig) -> usize {
        config.jobs.max(1) as usize
    }

    /// Reset the intermediate coordinator from its pre-upgrade backup, then
    /// run the upgrade tool on it.
    async fn upgrade_coordinator(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
        action: UpgradeAction,
        timestamp: &str,
        streams: &OutStreams,
    ) -> anyhow::Result<()> {
        let backup = config
            .backup_dir(config.source.coordinator_hostname())
            .join(ops::PRE_UPGRADE_BACKUP);
        self.tools
            .rsync(
                &ops::coordinator_rsync(&backup, intermediate.coordinator_data_dir(), ""),
                streams,
            )
            .await?;

        let opts = ops::coordinator_upgrade_options(config, intermediate, action, self.options, timestamp);
        self.tools
            .run_upgrade_tool(&opts, streams)
            .await
            .with_context(|| format!("{} coordinator", action.as_str()))
    }

    /// Run the upgrade tool on every primary through the agents.
    async fn upgrade_primaries(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
        action: UpgradeAction,
        timestamp: &str,
    ) -> anyhow::Result<()> {
        let agents = self.agents(config).await?;
        execute_rpc(agents, |conn| {
            ops::upgrade_primaries_request(
                &conn.hostname,
                config,
                intermediate,
                action,
                self.options,
                timestamp,
            )
        })
        .await
        .with_context(|| format!("{} primary segments", action.as_str()))
    }

    /// Delete the coordinator and primary data directories of `intermediate`.
    async fn delete_target_data_dirs(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
    ) -> anyhow::Result<()> {
        let coordinator = ops::delete_data_dir(intermediate.coordinator_data_dir());
        let primaries = async {
            let agents = self.agents(config).await?;
            execute_rpc(agents, |conn| {
                ops::delete_primary_data_dirs_request(&conn.hostname, intermediate)
            })
            .await?;
            anyhow::Ok(())
        };
        let (coordinator, primaries) = tokio::join!(coordinator, primaries);
        combine([coordinator, primaries])
    }

    /// Delete the tablespace directories the target created on the
    /// coordinator and primaries.
    async fn delete_target_tablespaces(
        &self,
        config: &UpgradeConfig,
        intermediate: &Cluster,
    ) -> anyhow::Result<()> {
        let coordinator = async {
            let dirs = ops::target_tablespace_dirs(
                intermediate.coordinator(),
                &config.source,
                intermediate.version().major,
                intermediate.catalog_version(),
            );
            for dir in dirs {
                ops::delete_dir_if_exists(&dir).await?;
            }
            anyhow::Ok(())
        };
        let primaries = async {
            let agents = self.agents(config).await?;
            execute_rpc(agents, |conn| {
                ops::delete_target_tablespaces_request(&conn.hostname, &config.source, intermediate)
            })
            .await?;
            anyhow::Ok(())
        };
        let (coordinator, primaries) = tokio::join!(coordinator, primaries);
        combine([coordinator, primaries])
    }

    /// Move the hub's log directory and every agent's to `archive_dir`.
    async fn archive_log_dirs(&self, config: &UpgradeConfig, archive_dir: &Path) -> anyhow::Result<Flow> {
        if tokio::fs::try_exists(&self.paths.log_dir).await.unwrap_or(false) {
            ops::rename_dir(&self.paths.log_dir, archive_dir).await?;
        }

        let agents = self.agents(config).await?;
        let coordinator_host = config.source.coordinator_hostname();
        execute_rpc(agents, |conn| {
            (conn.hostname != coordinator_host).then(|| AgentRequest::ArchiveLogDirectories {
                archive_dir: archive_dir.to_path_buf(),
            })
        })
        .await?;

        tracing::info!(archive_dir = %archive_dir.display(), "archived log directories");
        Ok(Flow::Continue)
    }

    /// Remove the agents' state directories. The coordinator host's own is
    /// handled separately.
    async fn delete_segment_statedirs(&self, config: &UpgradeConfig) -> anyhow::Result<Flow> {
        let agents = self.agents(config).await?;
        let coordinator_host = config.source.coordinator_hostname();
        execute_rpc(agents, |conn| {
            (conn.hostname != coordinator_host).then_some(AgentRequest::DeleteStateDirectory)
        })
        .await?;
        Ok(Flow::Continue)
    }

    /// Apply the scripts of one phase to `cluster`, asking first when
    /// someone can answer.
    async fn run_phase_scripts(
        &self,
        config: &UpgradeConfig,
        phase: &str,
        cluster: &Cluster,
    ) -> anyhow::Result<Flow> {
        let Some(root) = &self.paths.data_migration_dir else {
            return Ok(Flow::Skip);
        };
        let dir = scripts::phase_dir(root, phase);
        if scripts::script_files(&dir).await?.is_empty() {
            return Ok(Flow::Skip);
        }

        if self.gate.is_interactive() {
            let question = format!("Apply the {phase} data migration scripts in {}?", dir.display());
            if !self.gate.ask(&question)? {
                return Ok(Flow::Skip);
            }
        }

        let applied = scripts::apply_data_migration_scripts(
            &self.pools,
            &dir,
            cluster.coordinator_port(),
            cluster.version().major,
            Self::jobs(config),
            Some(&self.bus),
        )
        .await?;
        tracing::info!(phase, applied, "applied data migration scripts");
        Ok(Flow::Continue)
    }
}

/// Ok if every result is Ok, else one error carrying all messages.
fn combine<const N: usize>(results: [anyhow::Result<()>; N]) -> anyhow::Result<()> {
    let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(anyhow::anyhow!(
            "{}",
            errors
                .iter()
                .map(|e| format!("{e:#}"))
                .collect::<Vec<_>>()
                .join("; ")
        )),
    }
}

/// The configuration a substep needs, or an error if an earlier run never
/// produced it.
fn require(config: &Option<UpgradeConfig>) -> anyhow::Result<&UpgradeConfig> {
    config.as_ref().ok_or_else(|| ConfigError::NotInitialized.into())
}

fn require_mut(config: &mut Option<UpgradeConfig>) -> anyhow::Result<&mut UpgradeConfig> {
    config.as_mut().ok_or_else(|| ConfigError::NotInitialized.into())
}

/// Timestamp naming the upgrade tool's output directories for one run.
fn tool_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;

    use clustergrade_types::cluster::{Cluster, Destination, Role, SegConfig};
    use clustergrade_types::config::{
        DEFAULT_AGENT_PORT, DEFAULT_HUB_PORT, InitializeRequest, Mode, UpgradeId,
    };

    use super::*;
    use crate::agent::fanout::tests::MockAgent;
    use crate::catalog::tests::MockCatalog;
    use crate::process::tests::MockLauncher;
    use crate::statement::runner::tests::MockFactory;
    use crate::workflow::AutoConfirm;
    use crate::workflow::engine::tests::MemoryStore;

    pub type TestHub = UpgradeHub<MemoryStore, MockLauncher, MockCatalog, MockFactory, MockConnector>;

    /// Hands out mock agents that record into one shared log.
    #[derive(Clone, Default)]
    pub struct MockConnector {
        pub received: Arc<Mutex<Vec<(String, AgentRequest)>>>,
        pub failing: Arc<Mutex<Vec<String>>>,
    }

    impl MockConnector {
        pub fn requests(&self) -> Vec<(String, AgentRequest)> {
            self.received.lock().unwrap().clone()
        }

        pub fn ops(&self) -> Vec<String> {
            self.requests()
                .iter()
                .map(|(host, req)| format!("{host}:{}", req.op()))
                .collect()
        }
    }

    impl AgentConnector for MockConnector {
        async fn connect(&self, hosts: &[String], _port: u16) -> Result<Vec<AgentConnection>, ConnectError> {
            let failing = self.failing.lock().unwrap().clone();
            Ok(hosts
                .iter()
                .map(|host| {
                    let agent = MockAgent {
                        host: host.clone(),
                        received: self.received.clone(),
                        fail_with: failing
                            .contains(host)
                            .then(|| format!("agent failure on {host}")),
                        panic: false,
                    };
                    AgentConnection::new(host.clone(), agent)
                })
                .collect())
        }
    }

    pub fn seg(dbid: i32, content_id: i32, role: Role, host: &str, port: u16, dir: &Path) -> SegConfig {
        SegConfig {
            dbid,
            content_id,
            role,
            hostname: host.to_string(),
            port,
            data_dir: dir.to_path_buf(),
        }
    }

    /// Coordinator in a temp dir, primaries on sdw1/sdw2, mirrors crossed,
    /// standby on scdw.
    pub fn source_segments(root: &Path) -> Vec<SegConfig> {
        vec![
            seg(1, -1, Role::Primary, "cdw", 5432, &root.join("qddir/gpseg-1")),
            seg(2, 0, Role::Primary, "sdw1", 6000, Path::new("/data/primary/gpseg0")),
            seg(3, 1, Role::Primary, "sdw2", 6001, Path::new("/data/primary/gpseg1")),
            seg(4, 0, Role::Mirror, "sdw2", 7000, Path::new("/data/mirror/gpseg0")),
            seg(5, 1, Role::Mirror, "sdw1", 7001, Path::new("/data/mirror/gpseg1")),
            seg(6, -1, Role::Mirror, "scdw", 5432, Path::new("/data/standby/gpseg-1")),
        ]
    }

    /// Everything a hub test needs, with handles to inspect the mocks.
    pub struct Fixture {
        pub root: tempfile::TempDir,
        pub store: MemoryStore,
        pub launcher: MockLauncher,
        pub connector: MockConnector,
        pub hub: TestHub,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_catalog(|_| {})
        }

        pub fn with_catalog(customize: impl FnOnce(&mut MockCatalog)) -> Self {
            let root = tempfile::tempdir().unwrap();
            let store = MemoryStore::default();
            let launcher = MockLauncher::default();
            launcher.respond(
                "gpdb6/bin/postgres --gp-version",
                "postgres (Greenplum Database) 6.26.1 build commit:abc",
            );
            launcher.respond(
                "gpdb7/bin/postgres --gp-version",
                "postgres (Greenplum Database) 7.1.0 build commit:def",
            );
            launcher.respond("--catalog-version", "Catalog version number: 302307241");
            launcher.respond(
                "df -P -k",
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 104857600 20971520 83886080 20% /\n",
            );

            let mut catalog = MockCatalog {
                segments: source_segments(root.path()),
                databases: vec!["postgres".into()],
                ..Default::default()
            };
            customize(&mut catalog);

            let connector = MockConnector::default();
            let paths = HubPaths {
                state_dir: root.path().join("state"),
                log_dir: root.path().join("logs/clustergrade"),
                data_migration_dir: None,
            };
            std::fs::create_dir_all(&paths.state_dir).unwrap();

            let hub = UpgradeHub::new(
                store.clone(),
                UpgradeToolRunner::new(launcher.clone(), root.path().join("logs/clustergrade")),
                catalog,
                MockFactory::default(),
                connector.clone(),
                Arc::new(AutoConfirm),
                paths,
            );

            Self {
                root,
                store,
                launcher,
                connector,
                hub,
            }
        }

        pub fn request(&self) -> InitializeRequest {
            InitializeRequest {
                id: UpgradeId::new(),
                source_gphome: "/usr/local/gpdb6".into(),
                target_gphome: "/usr/local/gpdb7".into(),
                source_port: 5432,
                mode: Mode::Copy,
                disk_free_ratio: 0.6,
                jobs: 4,
                use_hba_hostnames: false,
                dynamic_library_path: "$libdir".into(),
                temp_ports: (50432..50450).collect(),
                hub_port: DEFAULT_HUB_PORT,
                agent_port: DEFAULT_AGENT_PORT,
                parent_backup_dirs: None,
                skip_version_check: false,
            }
        }

        /// A saved configuration as `initialize` leaves it.
        pub fn initialized_config(&self) -> UpgradeConfig {
            let source = Cluster::new(
                Destination::Source,
                source_segments(self.root.path()),
                "/usr/local/gpdb6",
                semver::Version::new(6, 26, 1),
            )
            .unwrap();
            let id = UpgradeId::new();
            let intermediate = target::intermediate_cluster(
                &source,
                Path::new("/usr/local/gpdb7"),
                semver::Version::new(7, 1, 0),
                "302307241",
                &id,
                &(50432..50450).collect::<Vec<_>>(),
            )
            .unwrap();

            let mut parent_backup_dirs = BTreeMap::new();
            for host in source.hosts() {
                parent_backup_dirs.insert(host, self.root.path().join("backup"));
            }

            UpgradeConfig {
                id,
                created_at: chrono::Utc::now(),
                source,
                intermediate: Some(intermediate),
                target: None,
                target_gphome: "/usr/local/gpdb7".into(),
                mode: Mode::Copy,
                disk_free_ratio: 0.6,
                hub_port: DEFAULT_HUB_PORT,
                agent_port: DEFAULT_AGENT_PORT,
                temp_ports: (50432..50450).collect(),
                use_hba_hostnames: false,
                jobs: 4,
                dynamic_library_path: "$libdir".into(),
                parent_backup_dirs,
            }
        }

        pub fn save(&self, config: &UpgradeConfig) {
            *self.store.config.lock().unwrap() = Some(config.clone());
        }
    }

    #[tokio::test]
    async fn config_value_requires_initialize() {
        let fx = Fixture::new();
        let err = fx.hub.config_value("id").await.unwrap_err();
        assert_eq!(err.to_string(), "upgrade has not been initialized");

        let config = fx.initialized_config();
        fx.save(&config);
        assert_eq!(fx.hub.config_value("target-port").await.unwrap(), "50432");
    }

    #[tokio::test]
    async fn stop_agents_reaches_every_agent_host() {
        let fx = Fixture::new();
        fx.save(&fx.initialized_config());

        fx.hub.stop_agents().await.unwrap();

        let mut ops = fx.connector.ops();
        ops.sort();
        assert_eq!(
            ops,
            vec!["scdw:stop_agent", "sdw1:stop_agent", "sdw2:stop_agent"]
        );
    }

    #[tokio::test]
    async fn statuses_cover_every_step() {
        let fx = Fixture::new();
        let all = fx.hub.statuses().await.unwrap();
        assert_eq!(
            all.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            Step::ALL.to_vec()
        );
        assert!(all.iter().all(|(_, s)| s.is_empty()));
    }
}
