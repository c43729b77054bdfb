//! CLI command definitions for the `clustergrade` binary.
//!
//! Uses clap derive macros. Each step of the upgrade is a top-level verb
//! (`clustergrade initialize`, `clustergrade execute`, ...), run in order.

pub mod apply;
pub mod config;
pub mod initialize;
pub mod render;
pub mod status;
pub mod step;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use initialize::InitializeArgs;

/// Upgrade a Greenplum cluster in place to a new major version.
#[derive(Parser)]
#[command(name = "clustergrade", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed output (-v echoes substep output, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Never prompt; proceed as if every question was answered yes.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Concurrent jobs used by the upgrade tool and statement runner.
    #[arg(long, global = true)]
    pub jobs: Option<u32>,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check both installations and create the target cluster.
    Initialize(InitializeArgs),

    /// Upgrade the coordinator and primaries and start the target cluster.
    Execute {
        /// Pass --verbose to the upgrade tool.
        #[arg(long)]
        pg_upgrade_verbose: bool,

        /// Skip the upgrade tool's consistency checks.
        #[arg(long)]
        skip_pg_upgrade_checks: bool,
    },

    /// Upgrade mirrors and standby and move the target cluster into place.
    Finalize,

    /// Remove the target cluster and restart the source cluster.
    Revert,

    /// Apply a directory of data migration scripts to a running cluster.
    Apply {
        /// Installation of the cluster the scripts run against.
        #[arg(long)]
        gphome: PathBuf,

        /// Coordinator port of that cluster.
        #[arg(long)]
        port: u16,

        /// Root directory of the generated scripts.
        #[arg(long)]
        input_dir: PathBuf,

        /// Which phase's scripts to apply.
        #[arg(long, value_parser = ["initialize", "finalize", "revert"])]
        phase: String,
    },

    /// Show the recorded status of every step.
    Status {
        /// Print the statuses as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect the upgrade configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Stop the agents on every host.
    KillServices,

    /// Print version information.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print configuration values.
    Show {
        /// Print only this key (id, source-gphome, target-gphome,
        /// target-datadir, target-port).
        #[arg(long)]
        key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from(["clustergrade", "execute", "-vv", "--non-interactive"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert!(matches!(cli.command, Commands::Execute { pg_upgrade_verbose: false, .. }));
    }

    #[test]
    fn apply_requires_a_known_phase() {
        let ok = Cli::try_parse_from([
            "clustergrade",
            "apply",
            "--gphome",
            "/usr/local/gpdb6",
            "--port",
            "5432",
            "--input-dir",
            "/home/gpadmin/scripts",
            "--phase",
            "finalize",
        ]);
        assert!(ok.is_ok());

        let bad = Cli::try_parse_from([
            "clustergrade",
            "apply",
            "--gphome",
            "/usr/local/gpdb6",
            "--port",
            "5432",
            "--input-dir",
            "/tmp",
            "--phase",
            "whenever",
        ]);
        assert!(bad.is_err());
    }

    #[test]
    fn config_show_takes_an_optional_key() {
        let cli = Cli::try_parse_from(["clustergrade", "config", "show", "--key", "target-port"])
            .unwrap();
        let Commands::Config {
            action: ConfigCommand::Show { key },
        } = cli.command
        else {
            panic!("expected config show");
        };
        assert_eq!(key.as_deref(), Some("target-port"));
    }
}
