//! Requests and replies exchanged with the per-host agent service.
//!
//! Each variant of [`AgentRequest`] is one agent operation. The hub builds a
//! request per host from the topology and sends it through the fan-out
//! executor.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::cluster::{Role, SegmentTablespaces};
use crate::config::Mode;

/// rsync flags used to bootstrap mirrors from their primaries.
pub const MIRROR_RSYNC_FLAGS: [&str; 5] = [
    "--archive",
    "--delete",
    "--hard-links",
    "--size-only",
    "--no-inc-recursive",
];

/// One rsync invocation performed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsyncOptions {
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    /// Empty for a local copy.
    #[serde(default)]
    pub destination_host: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub excluded_files: Vec<String>,
}

/// A directory rename performed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePair {
    pub source: PathBuf,
    pub destination: PathBuf,
}

static PORT_SETTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*port[ \t]*=[ \t]*)(\d+)").expect("static regex"));
static CONNINFO_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*primary_conninfo[ \t]*=.*?\bport[ \t]*=[ \t]*)(\d+)").expect("static regex")
});

/// Where a mirror or standby keeps `primary_conninfo`.
pub fn replication_conf_file(major: u64) -> &'static str {
    if major < 7 { "recovery.conf" } else { "postgresql.auto.conf" }
}

/// Which setting of a configuration file carries the port being rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfSetting {
    /// `port = N` in `postgresql.conf`.
    Port,
    /// `port=N` inside the `primary_conninfo` string.
    PrimaryConninfo,
}

/// Rewrite one port in one configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfFileEdit {
    pub path: PathBuf,
    pub setting: ConfSetting,
    pub old_port: u16,
    pub new_port: u16,
}

impl ConfFileEdit {
    /// `contents` with every occurrence of the old port in the setting
    /// replaced. Other ports and lines are untouched, so applying an edit
    /// twice is harmless.
    pub fn apply(&self, contents: &str) -> String {
        let pattern = match self.setting {
            ConfSetting::Port => &*PORT_SETTING,
            ConfSetting::PrimaryConninfo => &*CONNINFO_PORT,
        };
        pattern
            .replace_all(contents, |caps: &Captures| {
                if caps[2] == self.old_port.to_string() {
                    format!("{}{}", &caps[1], self.new_port)
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }
}

/// Whether the upgrade tool only checks compatibility or performs the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeAction {
    Check,
    Upgrade,
}

impl UpgradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeAction::Check => "check",
            UpgradeAction::Upgrade => "upgrade",
        }
    }
}

/// Upgrade tool mode: the coordinator runs as dispatcher, segments as segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeToolMode {
    Dispatcher,
    Segment,
}

/// Options for one invocation of the binary upgrade tool on one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgOptions {
    pub action: UpgradeAction,
    pub tool_mode: UpgradeToolMode,
    pub mode: Mode,
    pub role: Role,
    pub content_id: i32,
    pub jobs: u32,
    pub verbose: bool,
    pub skip_checks: bool,
    pub backup_dir: PathBuf,
    /// Extra `--old-options` passed to the source server.
    #[serde(default)]
    pub old_options: String,
    pub target_version: semver::Version,
    pub old_bin_dir: PathBuf,
    pub old_data_dir: PathBuf,
    pub old_port: u16,
    pub old_dbid: i32,
    pub new_bin_dir: PathBuf,
    pub new_data_dir: PathBuf,
    pub new_port: u16,
    pub new_dbid: i32,
    #[serde(default)]
    pub tablespaces: SegmentTablespaces,
    /// Shared timestamp naming the tool's output directory for this run.
    pub timestamp: String,
}

/// An operation sent to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    DeleteDataDirectories { data_dirs: Vec<PathBuf> },
    DeleteTablespaceDirectories { dirs: Vec<PathBuf> },
    RsyncDataDirectories { options: Vec<RsyncOptions> },
    RsyncTablespaceDirectories { options: Vec<RsyncOptions> },
    RenameTablespaces { pairs: Vec<RenamePair> },
    RenameDirectories { pairs: Vec<RenamePair> },
    UpgradePrimaries {
        action: UpgradeAction,
        opts: Vec<PgOptions>,
    },
    ArchiveLogDirectories { archive_dir: PathBuf },
    DeleteStateDirectory,
    StopAgent,
    UpdateConfFiles { edits: Vec<ConfFileEdit> },
    /// Fails when a filesystem holding one of `dirs` has less than
    /// `disk_free_ratio` of its space free.
    CheckDiskSpace {
        dirs: Vec<PathBuf>,
        disk_free_ratio: f64,
    },
}

impl AgentRequest {
    /// Operation name, also used as the HTTP path segment.
    pub fn op(&self) -> &'static str {
        match self {
            AgentRequest::DeleteDataDirectories { .. } => "delete_data_directories",
            AgentRequest::DeleteTablespaceDirectories { .. } => "delete_tablespace_directories",
            AgentRequest::RsyncDataDirectories { .. } => "rsync_data_directories",
            AgentRequest::RsyncTablespaceDirectories { .. } => "rsync_tablespace_directories",
            AgentRequest::RenameTablespaces { .. } => "rename_tablespaces",
            AgentRequest::RenameDirectories { .. } => "rename_directories",
            AgentRequest::UpgradePrimaries { .. } => "upgrade_primaries",
            AgentRequest::ArchiveLogDirectories { .. } => "archive_log_directories",
            AgentRequest::DeleteStateDirectory => "delete_state_directory",
            AgentRequest::StopAgent => "stop_agent",
            AgentRequest::UpdateConfFiles { .. } => "update_conf_files",
            AgentRequest::CheckDiskSpace { .. } => "check_disk_space",
        }
    }
}

/// Reply from an agent. Errors travel as `error` with a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Directory holding a segment's tablespace files for a given target version.
///
/// `<location>/<dbid>/GPDB_<major>_<catalog_version>`
pub fn tablespace_path(location: &Path, dbid: i32, major: u64, catalog_version: &str) -> PathBuf {
    location
        .join(dbid.to_string())
        .join(format!("GPDB_{major}_{catalog_version}"))
}
