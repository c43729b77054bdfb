//! Database utilities invoked through a [`ProcessLauncher`].
//!
//! Wraps cluster start/stop, the binary upgrade tool, rsync and version
//! queries. Commands that need the installation environment run under
//! `bash -c "source <gphome>/greenplum_path.sh && ..."`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clustergrade_types::agent::{PgOptions, RsyncOptions, UpgradeAction, UpgradeToolMode};
use clustergrade_types::cluster::{Cluster, Role};
use clustergrade_types::config::Mode;
use clustergrade_types::version::parse_gp_version_output;

use super::{CommandSpec, LaunchError, ProcessLauncher, shell_quote};
use crate::workflow::OutStreams;

/// Name of the file listing source tablespaces, kept in each backup dir.
pub const OLD_TABLESPACES_FILE: &str = "old_tablespaces.txt";

/// Runs database utilities for the hub.
pub struct UpgradeToolRunner<L: ProcessLauncher> {
    launcher: L,
    log_dir: PathBuf,
}

impl<L: ProcessLauncher> UpgradeToolRunner<L> {
    /// `log_dir` receives the upgrade tool's working directories.
    pub fn new(launcher: L, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            log_dir: log_dir.into(),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    // -----------------------------------------------------------------------
    // Cluster lifecycle
    // -----------------------------------------------------------------------

    /// `bash -c` command running `<gphome>/bin/<utility>` with the cluster's
    /// environment.
    pub fn greenplum_command(&self, cluster: &Cluster, utility: &str, args: &[&str]) -> CommandSpec {
        let gphome = cluster.gphome();
        let mut script = format!(
            "source {} && {}",
            shell_quote(&gphome.join("greenplum_path.sh").display().to_string()),
            shell_quote(&gphome.join("bin").join(utility).display().to_string())
        );
        for arg in args {
            script.push(' ');
            script.push_str(&shell_quote(arg));
        }

        CommandSpec::new("bash")
            .arg("-c")
            .arg(script)
            .env(
                "MASTER_DATA_DIRECTORY",
                cluster.coordinator_data_dir().display().to_string(),
            )
            .env("PGPORT", cluster.coordinator_port().to_string())
    }

    /// True if the coordinator's postmaster process is alive.
    pub async fn is_coordinator_running(
        &self,
        cluster: &Cluster,
        streams: &OutStreams,
    ) -> Result<bool, LaunchError> {
        let pid_file = cluster.coordinator_data_dir().join("postmaster.pid");
        let exists = tokio::fs::try_exists(&pid_file).await.unwrap_or(false);
        if !exists {
            return Ok(false);
        }

        let command = CommandSpec::new("pgrep")
            .arg("-F")
            .arg(pid_file.display().to_string());
        match self.launcher.run(command, streams).await {
            Ok(()) => Ok(true),
            // pgrep exits 1 when no process matched.
            Err(e) if e.exit_code() == Some(1) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn start(&self, cluster: &Cluster, streams: &OutStreams) -> anyhow::Result<()> {
        let running = self
            .is_coordinator_running(cluster, streams)
            .await
            .context("checking if coordinator is running")?;
        if running {
            return Ok(());
        }

        let dir = cluster.coordinator_data_dir().display().to_string();
        self.launcher
            .run(self.greenplum_command(cluster, "gpstart", &["-a", "-d", &dir]), streams)
            .await
            .with_context(|| format!("starting {} cluster", cluster.destination()))
    }

    pub async fn start_coordinator_only(
        &self,
        cluster: &Cluster,
        streams: &OutStreams,
    ) -> anyhow::Result<()> {
        let dir = cluster.coordinator_data_dir().display().to_string();
        self.launcher
            .run(
                self.greenplum_command(cluster, "gpstart", &["-a", "-m", "-d", &dir]),
                streams,
            )
            .await
            .with_context(|| format!("starting {} cluster in coordinator only mode", cluster.destination()))
    }

    pub async fn stop(&self, cluster: &Cluster, streams: &OutStreams) -> anyhow::Result<()> {
        self.stop_with(cluster, streams, &["-a"]).await
    }

    pub async fn stop_coordinator_only(
        &self,
        cluster: &Cluster,
        streams: &OutStreams,
    ) -> anyhow::Result<()> {
        self.stop_with(cluster, streams, &["-a", "-m"]).await
    }

    async fn stop_with(
        &self,
        cluster: &Cluster,
        streams: &OutStreams,
        flags: &[&str],
    ) -> anyhow::Result<()> {
        let running = self
            .is_coordinator_running(cluster, streams)
            .await
            .context("checking if coordinator is running")?;
        if !running {
            return Ok(());
        }

        let dir = cluster.coordinator_data_dir().display().to_string();
        let mut args = flags.to_vec();
        args.extend(["-d", dir.as_str()]);
        self.launcher
            .run(self.greenplum_command(cluster, "gpstop", &args), streams)
            .await
            .with_context(|| format!("stopping {} cluster", cluster.destination()))
    }

    /// Create a cluster from a `gpinitsystem` configuration file.
    pub async fn init_system(
        &self,
        gphome: &Path,
        config_file: &Path,
        streams: &OutStreams,
    ) -> Result<(), LaunchError> {
        let script = format!(
            "source {} && {} -a -I {}",
            shell_quote(&gphome.join("greenplum_path.sh").display().to_string()),
            shell_quote(&gphome.join("bin").join("gpinitsystem").display().to_string()),
            shell_quote(&config_file.display().to_string()),
        );
        let result = self
            .launcher
            .run(CommandSpec::new("bash").arg("-c").arg(script), streams)
            .await;
        match result {
            // gpinitsystem exits 1 on success with warnings.
            Err(e) if e.exit_code() == Some(1) => Ok(()),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Version queries
    // -----------------------------------------------------------------------

    /// Version of the installation at `gphome`, from `postgres --gp-version`.
    pub async fn version(&self, gphome: &Path) -> anyhow::Result<semver::Version> {
        let postgres = gphome.join("bin").join("postgres");
        let raw = self
            .launcher
            .output(
                CommandSpec::new(postgres.display().to_string())
                    .arg("--gp-version")
                    .clear_env(),
            )
            .await?;
        Ok(parse_gp_version_output(&raw)?)
    }

    /// Catalog version number of the installation at `gphome`.
    pub async fn catalog_version(&self, gphome: &Path) -> anyhow::Result<String> {
        let postgres = gphome.join("bin").join("postgres");
        let raw = self
            .launcher
            .output(
                CommandSpec::new(postgres.display().to_string())
                    .arg("--catalog-version")
                    .clear_env(),
            )
            .await?;

        raw.split_whitespace()
            .last()
            .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .with_context(|| format!("unexpected catalog version output {raw:?}"))
    }

    // -----------------------------------------------------------------------
    // Upgrade tool
    // -----------------------------------------------------------------------

    /// Working directory for one upgrade tool invocation.
    pub fn upgrade_tool_dir(&self, opts: &PgOptions) -> PathBuf {
        let role = match opts.role {
            Role::Primary => "p",
            Role::Mirror => "m",
        };
        self.runs_dir(&opts.timestamp)
            .join(format!("{role}{}", opts.content_id))
    }

    /// Parent of every upgrade tool directory created with `timestamp`.
    pub fn runs_dir(&self, timestamp: &str) -> PathBuf {
        self.log_dir.join(format!("pg_upgrade_{timestamp}"))
    }

    /// Command line for the upgrade tool.
    pub fn upgrade_tool_command(&self, opts: &PgOptions) -> CommandSpec {
        let mut cmd = CommandSpec::new(opts.new_bin_dir.join("pg_upgrade").display().to_string())
            .args(["--retain", "--progress"])
            .args(["--old-bindir".to_string(), opts.old_bin_dir.display().to_string()])
            .args(["--new-bindir".to_string(), opts.new_bin_dir.display().to_string()])
            .args(["--old-datadir".to_string(), opts.old_data_dir.display().to_string()])
            .args(["--new-datadir".to_string(), opts.new_data_dir.display().to_string()])
            .args(["--old-port".to_string(), opts.old_port.to_string()])
            .args(["--new-port".to_string(), opts.new_port.to_string()])
            .args([
                "--mode",
                match opts.tool_mode {
                    UpgradeToolMode::Dispatcher => "dispatcher",
                    UpgradeToolMode::Segment => "segment",
                },
            ])
            .args(["--jobs".to_string(), opts.jobs.to_string()]);

        if opts.verbose {
            cmd = cmd.arg("--verbose");
        }
        if opts.action == UpgradeAction::Check {
            cmd = cmd.args(["--check", "--continue-check-on-fatal"]);
        }
        if opts.skip_checks {
            cmd = cmd.arg("--skip-checks");
        }
        if opts.mode == Mode::Link {
            cmd = cmd.arg("--link");
        }
        if !opts.old_options.is_empty() {
            cmd = cmd.args(["--old-options".to_string(), opts.old_options.clone()]);
        }
        if opts.action == UpgradeAction::Upgrade {
            cmd = cmd.args([
                "--old-tablespaces-file".to_string(),
                opts.backup_dir.join(OLD_TABLESPACES_FILE).display().to_string(),
            ]);
        }

        cmd.args(["--old-gp-dbid".to_string(), opts.old_dbid.to_string()])
            .args(["--new-gp-dbid".to_string(), opts.new_dbid.to_string()])
            .current_dir(self.upgrade_tool_dir(opts))
    }

    /// Run the upgrade tool for one segment.
    pub async fn run_upgrade_tool(&self, opts: &PgOptions, streams: &OutStreams) -> anyhow::Result<()> {
        let dir = self.upgrade_tool_dir(opts);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating upgrade tool directory {}", dir.display()))?;

        self.launcher
            .run(self.upgrade_tool_command(opts), streams)
            .await
            .with_context(|| format!("{} segment with content id {}", opts.action.as_str(), opts.content_id))
    }

    // -----------------------------------------------------------------------
    // rsync
    // -----------------------------------------------------------------------

    pub fn rsync_command(options: &RsyncOptions) -> CommandSpec {
        let mut cmd = CommandSpec::new("rsync").args(options.options.iter().cloned());
        for excluded in &options.excluded_files {
            cmd = cmd.arg(format!("--exclude={excluded}"));
        }
        cmd = cmd.args(options.sources.iter().map(|s| s.display().to_string()));

        let destination = options.destination.display().to_string();
        if options.destination_host.is_empty() {
            cmd.arg(destination)
        } else {
            cmd.arg(format!("{}:{destination}", options.destination_host))
        }
    }

    pub async fn rsync(&self, options: &RsyncOptions, streams: &OutStreams) -> anyhow::Result<()> {
        self.launcher
            .run(Self::rsync_command(options), streams)
            .await
            .with_context(|| {
                format!(
                    "rsync {:?} to {:?}",
                    options.sources,
                    options.destination.display().to_string()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clustergrade_types::cluster::{Destination, SegConfig};

    use super::*;
    use crate::process::tests::MockLauncher;

    fn cluster(data_dir: &Path) -> Cluster {
        Cluster::new(
            Destination::Source,
            vec![SegConfig {
                dbid: 1,
                content_id: -1,
                role: Role::Primary,
                hostname: "cdw".into(),
                port: 5432,
                data_dir: data_dir.to_path_buf(),
            }],
            "/usr/local/gpdb6",
            semver::Version::new(6, 20, 0),
        )
        .unwrap()
    }

    fn opts(action: UpgradeAction, mode: Mode) -> PgOptions {
        PgOptions {
            action,
            tool_mode: UpgradeToolMode::Dispatcher,
            mode,
            role: Role::Primary,
            content_id: -1,
            jobs: 4,
            verbose: true,
            skip_checks: false,
            backup_dir: "/data/.clustergrade".into(),
            old_options: "-x 2".into(),
            target_version: semver::Version::new(7, 1, 0),
            old_bin_dir: "/usr/local/old/bin".into(),
            old_data_dir: "/old/data".into(),
            old_port: 1234,
            old_dbid: 88,
            new_bin_dir: "/usr/local/new/bin".into(),
            new_data_dir: "/new/data".into(),
            new_port: 7890,
            new_dbid: 99,
            tablespaces: Default::default(),
            timestamp: "20250101T000000".into(),
        }
    }

    #[test]
    fn check_command_arguments() {
        let runner = UpgradeToolRunner::new(MockLauncher::default(), "/logs");
        let cmd = runner.upgrade_tool_command(&opts(UpgradeAction::Check, Mode::Link));
        assert_eq!(cmd.program, "/usr/local/new/bin/pg_upgrade");
        assert_eq!(
            cmd.args,
            vec![
                "--retain", "--progress",
                "--old-bindir", "/usr/local/old/bin",
                "--new-bindir", "/usr/local/new/bin",
                "--old-datadir", "/old/data",
                "--new-datadir", "/new/data",
                "--old-port", "1234",
                "--new-port", "7890",
                "--mode", "dispatcher",
                "--jobs", "4",
                "--verbose",
                "--check", "--continue-check-on-fatal",
                "--link",
                "--old-options", "-x 2",
                "--old-gp-dbid", "88",
                "--new-gp-dbid", "99",
            ]
        );
        assert_eq!(
            cmd.current_dir,
            Some(PathBuf::from("/logs/pg_upgrade_20250101T000000/p-1"))
        );
    }

    #[test]
    fn upgrade_command_passes_tablespaces_file() {
        let runner = UpgradeToolRunner::new(MockLauncher::default(), "/logs");
        let cmd = runner.upgrade_tool_command(&opts(UpgradeAction::Upgrade, Mode::Copy));
        assert!(!cmd.args.contains(&"--check".to_string()));
        assert!(!cmd.args.contains(&"--link".to_string()));
        let pos = cmd
            .args
            .iter()
            .position(|a| a == "--old-tablespaces-file")
            .unwrap();
        assert_eq!(cmd.args[pos + 1], "/data/.clustergrade/old_tablespaces.txt");
    }

    #[test]
    fn greenplum_command_sources_environment() {
        let runner = UpgradeToolRunner::new(MockLauncher::default(), "/logs");
        let cmd = runner.greenplum_command(&cluster(Path::new("/data/qddir/seg-1")), "gpstop", &["-a"]);
        assert_eq!(cmd.program, "bash");
        assert_eq!(
            cmd.args[1],
            "source /usr/local/gpdb6/greenplum_path.sh && /usr/local/gpdb6/bin/gpstop -a"
        );
        assert!(cmd.env.contains(&("PGPORT".to_string(), "5432".to_string())));
    }

    #[tokio::test]
    async fn stop_is_a_noop_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::default();
        let runner = UpgradeToolRunner::new(launcher.clone(), "/logs");

        runner.stop(&cluster(dir.path()), &OutStreams::discard()).await.unwrap();
        assert!(launcher.rendered().is_empty());
    }

    #[tokio::test]
    async fn stop_runs_gpstop_when_running() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), "123\n").unwrap();
        let launcher = MockLauncher::default();
        let runner = UpgradeToolRunner::new(launcher.clone(), "/logs");

        runner.stop(&cluster(dir.path()), &OutStreams::discard()).await.unwrap();

        let rendered = launcher.rendered();
        assert_eq!(rendered.len(), 2);
        assert!(rendered[0].starts_with("pgrep -F"));
        assert!(rendered[1].contains("gpstop -a -d"));
    }

    #[tokio::test]
    async fn pgrep_exit_one_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), "123\n").unwrap();
        let launcher = MockLauncher::default();
        launcher.fail_when("pgrep", 1);
        let runner = UpgradeToolRunner::new(launcher.clone(), "/logs");

        let running = runner
            .is_coordinator_running(&cluster(dir.path()), &OutStreams::discard())
            .await
            .unwrap();
        assert!(!running);
    }

    #[tokio::test]
    async fn version_parses_gp_version_output() {
        let launcher = MockLauncher::default();
        *launcher.output.lock().unwrap() = "postgres (Greenplum Database) 6.26.1 build commit:x".into();
        let runner = UpgradeToolRunner::new(launcher, "/logs");

        let version = runner.version(Path::new("/usr/local/gpdb6")).await.unwrap();
        assert_eq!(version, semver::Version::new(6, 26, 1));
    }

    #[tokio::test]
    async fn catalog_version_is_last_token() {
        let launcher = MockLauncher::default();
        *launcher.output.lock().unwrap() = "Catalog version number:               301908232\n".into();
        let runner = UpgradeToolRunner::new(launcher.clone(), "/logs");

        let version = runner.catalog_version(Path::new("/usr/local/gpdb6")).await.unwrap();
        assert_eq!(version, "301908232");

        *launcher.output.lock().unwrap() = "garbage".into();
        assert!(runner.catalog_version(Path::new("/usr/local/gpdb6")).await.is_err());
    }

    #[test]
    fn rsync_command_targets_remote_host() {
        let cmd = UpgradeToolRunner::<MockLauncher>::rsync_command(&RsyncOptions {
            sources: vec!["/data/primary/seg0/".into()],
            destination: "/data/mirror".into(),
            destination_host: "sdw2".into(),
            options: vec!["--archive".into(), "--delete".into()],
            excluded_files: vec!["pg_log/*".into()],
        });
        assert_eq!(
            cmd.to_string(),
            "rsync --archive --delete '--exclude=pg_log/*' /data/primary/seg0/ sdw2:/data/mirror"
        );
    }
}
