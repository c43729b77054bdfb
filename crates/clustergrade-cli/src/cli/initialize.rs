//! `clustergrade initialize`: flags or a TOML file into an
//! [`InitializeRequest`].

use std::path::PathBuf;

use clap::Args;
use clustergrade_infra::config_file::load_initialize_file;
use clustergrade_types::config::{InitializeFile, InitializeRequest, UpgradeId};

#[derive(Args, Debug, Clone, Default)]
pub struct InitializeArgs {
    /// Read every setting from this TOML file instead of flags.
    #[arg(long, conflicts_with_all = [
        "source_gphome", "target_gphome", "source_master_port", "mode",
        "disk_free_ratio", "use_hba_hostnames", "dynamic_library_path",
        "temp_port_range", "hub_port", "agent_port", "parent_backup_dirs",
        "skip_version_check",
    ])]
    pub file: Option<PathBuf>,

    /// Installation directory of the running cluster.
    #[arg(long, required_unless_present = "file")]
    pub source_gphome: Option<PathBuf>,

    /// Installation directory of the new release.
    #[arg(long, required_unless_present = "file")]
    pub target_gphome: Option<PathBuf>,

    /// Coordinator port of the running cluster.
    #[arg(long, required_unless_present = "file")]
    pub source_master_port: Option<u16>,

    /// `copy` duplicates data files, `link` hard-links them.
    #[arg(long)]
    pub mode: Option<String>,

    /// Fraction of disk that must be free on every host (default 0.6 for
    /// copy, 0.2 for link). 0 disables the check.
    #[arg(long)]
    pub disk_free_ratio: Option<f64>,

    /// Use hostnames rather than addresses in pg_hba.conf.
    #[arg(long)]
    pub use_hba_hostnames: bool,

    #[arg(long)]
    pub dynamic_library_path: Option<String>,

    /// Ports for the target cluster while both clusters exist, e.g.
    /// `50432-65535` or `6020,6021,7000-7010`.
    #[arg(long)]
    pub temp_port_range: Option<String>,

    #[arg(long)]
    pub hub_port: Option<u16>,

    #[arg(long)]
    pub agent_port: Option<u16>,

    /// One directory for every host, or `host:dir,host:dir`.
    #[arg(long)]
    pub parent_backup_dirs: Option<String>,

    #[arg(long, hide = true)]
    pub skip_version_check: bool,
}

impl InitializeArgs {
    /// The flags as an initialize file, so both paths share one set of
    /// defaults and validation.
    fn as_file(&self, jobs: Option<u32>) -> InitializeFile {
        InitializeFile {
            source_gphome: self.source_gphome.clone(),
            target_gphome: self.target_gphome.clone(),
            source_master_port: self.source_master_port,
            mode: self.mode.clone(),
            disk_free_ratio: self.disk_free_ratio,
            jobs,
            use_hba_hostnames: Some(self.use_hba_hostnames),
            dynamic_library_path: self.dynamic_library_path.clone(),
            temp_port_range: self.temp_port_range.clone(),
            hub_port: self.hub_port,
            agent_port: self.agent_port,
            parent_backup_dirs: self.parent_backup_dirs.clone(),
            skip_version_check: Some(self.skip_version_check),
        }
    }

    /// Build the request for upgrade `id`. `jobs` is the global `--jobs`
    /// flag, which a file run may not combine with.
    pub async fn into_request(
        self,
        id: UpgradeId,
        jobs: Option<u32>,
    ) -> anyhow::Result<InitializeRequest> {
        let file = match &self.file {
            Some(path) => {
                if jobs.is_some() {
                    anyhow::bail!(
                        "--file cannot be combined with other flags; set jobs in {}",
                        path.display()
                    );
                }
                load_initialize_file(path).await?
            }
            None => self.as_file(jobs),
        };
        Ok(InitializeRequest::from_file(id, file)?)
    }
}
