//! Persisted upgrade configuration and the inputs that produce it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::ConfigError;

pub const DEFAULT_HUB_PORT: u16 = 7527;
pub const DEFAULT_AGENT_PORT: u16 = 6416;
pub const DEFAULT_JOBS: u32 = 4;
pub const DEFAULT_TEMP_PORT_RANGE: &str = "50432-65535";
pub const DEFAULT_DYNAMIC_LIBRARY_PATH: &str = "$dynamic_library_path";

/// Directory created under each host's parent backup directory.
pub const BACKUP_DIR_NAME: &str = ".clustergrade";

// ---------------------------------------------------------------------------
// UpgradeId
// ---------------------------------------------------------------------------

/// Identifier of one upgrade attempt, generated at the start of `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(Uuid);

impl UpgradeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Filesystem-safe token stamped into data directory and log names.
    ///
    /// Uses the trailing random bits of the UUIDv7 so ids generated within the
    /// same millisecond still differ.
    pub fn short(&self) -> String {
        let simple = self.0.simple().to_string();
        simple[simple.len() - 12..].to_string()
    }
}

impl Default for UpgradeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// How the upgrade tool moves data files into the target cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Copy,
    Link,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Copy => "copy",
            Mode::Link => "link",
        }
    }

    /// Fraction of disk that must be free when none is given explicitly.
    pub fn default_disk_free_ratio(&self) -> f64 {
        match self {
            Mode::Copy => 0.6,
            Mode::Link => 0.2,
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Mode::Copy),
            "link" => Ok(Mode::Link),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a port list such as `50432-65535` or `1,2,5-7`.
///
/// An empty string yields an empty list.
pub fn parse_ports(value: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    if value.trim().is_empty() {
        return Ok(ports);
    }

    for part in value.split(',') {
        let part = part.trim();
        let invalid = || ConfigError::InvalidPortRange(part.to_string());
        match part.split_once('-') {
            Some((low, high)) => {
                let low: u16 = low.trim().parse().map_err(|_| invalid())?;
                let high: u16 = high.trim().parse().map_err(|_| invalid())?;
                if low > high {
                    return Err(invalid());
                }
                ports.extend(low..=high);
            }
            None => ports.push(part.parse().map_err(|_| invalid())?),
        }
    }

    Ok(ports)
}

/// Validate an explicit disk free ratio, or fall back to the mode default.
pub fn resolve_disk_free_ratio(explicit: Option<f64>, mode: Mode) -> Result<f64, ConfigError> {
    let ratio = explicit.unwrap_or_else(|| mode.default_disk_free_ratio());
    if !(0.0..=1.0).contains(&ratio) {
        return Err(ConfigError::InvalidDiskFreeRatio(ratio));
    }
    Ok(ratio)
}

/// Resolve the parent backup directory of every host of `source`.
///
/// `value` is either a single directory used on every host, or a list of
/// `host:dir` pairs. Hosts without an entry default to the grandparent of
/// their first segment's data directory (`/data/primary/gpseg0` -> `/data`).
pub fn parse_parent_backup_dirs(
    value: Option<&str>,
    source: &Cluster,
) -> Result<BTreeMap<String, PathBuf>, ConfigError> {
    let mut dirs = BTreeMap::new();
    for host in source.hosts() {
        let first = source
            .select_segments(|seg| seg.hostname == host)
            .first()
            .map(|seg| seg.data_dir.clone())
            .unwrap_or_default();
        let parent = first
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        dirs.insert(host, parent);
    }

    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(dirs);
    };

    if !value.contains(':') {
        for dir in dirs.values_mut() {
            *dir = PathBuf::from(value);
        }
        return Ok(dirs);
    }

    for pair in value.split(',') {
        let invalid = || ConfigError::InvalidBackupDirs(pair.to_string());
        let (host, dir) = pair.trim().split_once(':').ok_or_else(invalid)?;
        let (host, dir) = (host.trim(), dir.trim());
        if host.is_empty() || dir.is_empty() || !Path::new(dir).is_absolute() {
            return Err(invalid());
        }
        match dirs.get_mut(host) {
            Some(entry) => *entry = PathBuf::from(dir),
            None => return Err(ConfigError::InvalidBackupDirs(format!("unknown host {host}"))),
        }
    }

    Ok(dirs)
}

// ---------------------------------------------------------------------------
// Initialize file
// ---------------------------------------------------------------------------

/// Contents of an `initialize --file` TOML file. Keys mirror the flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InitializeFile {
    pub source_gphome: Option<PathBuf>,
    pub target_gphome: Option<PathBuf>,
    pub source_master_port: Option<u16>,
    pub mode: Option<String>,
    pub disk_free_ratio: Option<f64>,
    pub jobs: Option<u32>,
    pub use_hba_hostnames: Option<bool>,
    pub dynamic_library_path: Option<String>,
    pub temp_port_range: Option<String>,
    pub hub_port: Option<u16>,
    pub agent_port: Option<u16>,
    pub parent_backup_dirs: Option<String>,
    pub skip_version_check: Option<bool>,
}

/// Validated inputs of `initialize`, from flags or an [`InitializeFile`].
#[derive(Debug, Clone, PartialEq)]
pub struct InitializeRequest {
    pub id: UpgradeId,
    pub source_gphome: PathBuf,
    pub target_gphome: PathBuf,
    pub source_port: u16,
    pub mode: Mode,
    pub disk_free_ratio: f64,
    pub jobs: u32,
    pub use_hba_hostnames: bool,
    pub dynamic_library_path: String,
    pub temp_ports: Vec<u16>,
    pub hub_port: u16,
    pub agent_port: u16,
    /// Raw `--parent-backup-dirs` value, resolved once the source topology
    /// is known.
    pub parent_backup_dirs: Option<String>,
    pub skip_version_check: bool,
}

impl InitializeRequest {
    /// Build a request from an initialize file, applying defaults.
    pub fn from_file(id: UpgradeId, file: InitializeFile) -> Result<Self, ConfigError> {
        let missing = |key: &str| ConfigError::File(format!("missing required key '{key}'"));

        let mode = match file.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => Mode::Copy,
        };

        Ok(Self {
            id,
            source_gphome: file.source_gphome.ok_or_else(|| missing("source-gphome"))?,
            target_gphome: file.target_gphome.ok_or_else(|| missing("target-gphome"))?,
            source_port: file
                .source_master_port
                .ok_or_else(|| missing("source-master-port"))?,
            mode,
            disk_free_ratio: resolve_disk_free_ratio(file.disk_free_ratio, mode)?,
            jobs: file.jobs.unwrap_or(DEFAULT_JOBS).max(1),
            use_hba_hostnames: file.use_hba_hostnames.unwrap_or(false),
            dynamic_library_path: file
                .dynamic_library_path
                .unwrap_or_else(|| DEFAULT_DYNAMIC_LIBRARY_PATH.to_string()),
            temp_ports: parse_ports(
                file.temp_port_range
                    .as_deref()
                    .unwrap_or(DEFAULT_TEMP_PORT_RANGE),
            )?,
            hub_port: file.hub_port.unwrap_or(DEFAULT_HUB_PORT),
            agent_port: file.agent_port.unwrap_or(DEFAULT_AGENT_PORT),
            parent_backup_dirs: file.parent_backup_dirs,
            skip_version_check: file.skip_version_check.unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// UpgradeConfig
// ---------------------------------------------------------------------------

/// Everything `initialize` decides, persisted as `config.json` in the state
/// directory and reloaded by every later step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    pub id: UpgradeId,
    pub created_at: DateTime<Utc>,
    pub source: Cluster,
    /// Target cluster while it runs on temporary ports and data directories.
    #[serde(default)]
    pub intermediate: Option<Cluster>,
    /// Target cluster after finalize has swapped it into place.
    #[serde(default)]
    pub target: Option<Cluster>,
    pub target_gphome: PathBuf,
    pub mode: Mode,
    pub disk_free_ratio: f64,
    pub hub_port: u16,
    pub agent_port: u16,
    pub temp_ports: Vec<u16>,
    pub use_hba_hostnames: bool,
    pub jobs: u32,
    pub dynamic_library_path: String,
    /// Host -> parent directory for the coordinator backup.
    #[serde(default)]
    pub parent_backup_dirs: BTreeMap<String, PathBuf>,
}

impl UpgradeConfig {
    /// Look up one of the keys exposed by `config show`.
    ///
    /// Values that are not known yet render as an empty string.
    pub fn get(&self, name: &str) -> Result<String, ConfigError> {
        let value = match name {
            "id" => self.id.to_string(),
            "source-gphome" => self.source.gphome().display().to_string(),
            "target-gphome" => match &self.intermediate {
                Some(intermediate) => intermediate.gphome().display().to_string(),
                None => self.target_gphome.display().to_string(),
            },
            "target-datadir" => self
                .intermediate
                .as_ref()
                .map(|c| c.coordinator_data_dir().display().to_string())
                .unwrap_or_default(),
            "target-port" => self
                .intermediate
                .as_ref()
                .map(|c| c.coordinator_port().to_string())
                .unwrap_or_default(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// All keys accepted by [`UpgradeConfig::get`], in display order.
    pub const KEYS: [&'static str; 5] = [
        "id",
        "source-gphome",
        "target-gphome",
        "target-datadir",
        "target-port",
    ];

    /// Backup directory on `host`: `<parent backup dir>/.clustergrade`.
    pub fn backup_dir(&self, host: &str) -> PathBuf {
        let parent = self
            .parent_backup_dirs
            .get(host)
            .cloned()
            .or_else(|| {
                self.source
                    .coordinator_data_dir()
                    .parent()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
            })
            .unwrap_or_else(|| PathBuf::from("/"));
        parent.join(BACKUP_DIR_NAME)
    }

    /// The intermediate cluster, or an error if `initialize` has not built it.
    pub fn require_intermediate(&self) -> Result<&Cluster, ConfigError> {
        self.intermediate.as_ref().ok_or(ConfigError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Destination, Role, SegConfig};

    fn coordinator(port: u16, dir: &str) -> SegConfig {
        SegConfig {
            dbid: 1,
            content_id: -1,
            role: Role::Primary,
            hostname: "cdw".into(),
            port,
            data_dir: dir.into(),
        }
    }

    fn config() -> UpgradeConfig {
        let source = Cluster::new(
            Destination::Source,
            vec![coordinator(5432, "/data/qddir/demoDataDir-1")],
            "/usr/local/gpdb6",
            semver::Version::new(6, 20, 0),
        )
        .unwrap();
        UpgradeConfig {
            id: UpgradeId::new(),
            created_at: Utc::now(),
            source,
            intermediate: None,
            target: None,
            target_gphome: "/usr/local/gpdb7".into(),
            mode: Mode::Copy,
            disk_free_ratio: 0.6,
            hub_port: DEFAULT_HUB_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            temp_ports: vec![50432, 50433],
            use_hba_hostnames: false,
            jobs: DEFAULT_JOBS,
            dynamic_library_path: DEFAULT_DYNAMIC_LIBRARY_PATH.into(),
            parent_backup_dirs: BTreeMap::new(),
        }
    }

    #[test]
    fn short_id_is_twelve_hex_chars() {
        let id = UpgradeId::new();
        let short = id.short();
        assert_eq!(short.len(), 12);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.to_string().ends_with(&short));
    }

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("COPY".parse::<Mode>().unwrap(), Mode::Copy);
        assert_eq!(" link ".parse::<Mode>().unwrap(), Mode::Link);
        assert!(matches!("move".parse::<Mode>(), Err(ConfigError::InvalidMode(_))));
    }

    #[test]
    fn parses_port_lists() {
        assert_eq!(parse_ports("").unwrap(), Vec::<u16>::new());
        assert_eq!(parse_ports("1,2,5-7").unwrap(), vec![1, 2, 5, 6, 7]);
        assert_eq!(parse_ports("50432-50434").unwrap(), vec![50432, 50433, 50434]);
        assert!(parse_ports("7-5").is_err());
        assert!(parse_ports("70000").is_err());
        assert!(parse_ports("a-b").is_err());
    }

    #[test]
    fn disk_free_ratio_defaults_by_mode() {
        assert_eq!(resolve_disk_free_ratio(None, Mode::Copy).unwrap(), 0.6);
        assert_eq!(resolve_disk_free_ratio(None, Mode::Link).unwrap(), 0.2);
        assert_eq!(resolve_disk_free_ratio(Some(0.3), Mode::Copy).unwrap(), 0.3);
        assert!(resolve_disk_free_ratio(Some(1.5), Mode::Link).is_err());
        assert!(resolve_disk_free_ratio(Some(-0.1), Mode::Link).is_err());
    }

    #[test]
    fn get_known_and_unknown_keys() {
        let mut cfg = config();
        assert_eq!(cfg.get("source-gphome").unwrap(), "/usr/local/gpdb6");
        assert_eq!(cfg.get("target-gphome").unwrap(), "/usr/local/gpdb7");
        assert_eq!(cfg.get("target-port").unwrap(), "");
        assert_eq!(cfg.get("id").unwrap(), cfg.id.to_string());
        assert!(matches!(cfg.get("nope"), Err(ConfigError::UnknownKey(_))));

        cfg.intermediate = Some(
            Cluster::new(
                Destination::Intermediate,
                vec![coordinator(50432, "/data/qddir/demoDataDir.abc.-1")],
                "/usr/local/gpdb7",
                semver::Version::new(7, 1, 0),
            )
            .unwrap(),
        );
        assert_eq!(cfg.get("target-port").unwrap(), "50432");
        assert_eq!(
            cfg.get("target-datadir").unwrap(),
            "/data/qddir/demoDataDir.abc.-1"
        );
    }

    #[test]
    fn config_survives_json() {
        let cfg = config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: UpgradeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cfg.id);
        assert_eq!(back.source, cfg.source);
        assert!(back.intermediate.is_none());
    }

    #[test]
    fn backup_dirs_default_per_host() {
        let source = Cluster::new(
            Destination::Source,
            vec![
                coordinator(5432, "/data/qddir/demoDataDir-1"),
                SegConfig {
                    dbid: 2,
                    content_id: 0,
                    role: Role::Primary,
                    hostname: "sdw1".into(),
                    port: 6000,
                    data_dir: "/data1/primary/demoDataDir0".into(),
                },
            ],
            "/usr/local/gpdb6",
            semver::Version::new(6, 20, 0),
        )
        .unwrap();

        let dirs = parse_parent_backup_dirs(None, &source).unwrap();
        assert_eq!(dirs["cdw"], PathBuf::from("/data"));
        assert_eq!(dirs["sdw1"], PathBuf::from("/data1"));

        let single = parse_parent_backup_dirs(Some("/backup"), &source).unwrap();
        assert!(single.values().all(|d| d == Path::new("/backup")));

        let pairs = parse_parent_backup_dirs(Some("sdw1:/bk1"), &source).unwrap();
        assert_eq!(pairs["sdw1"], PathBuf::from("/bk1"));
        assert_eq!(pairs["cdw"], PathBuf::from("/data"));

        assert!(parse_parent_backup_dirs(Some("sdw9:/bk"), &source).is_err());
        assert!(parse_parent_backup_dirs(Some("sdw1:relative"), &source).is_err());

        let mut cfg = config();
        cfg.parent_backup_dirs = pairs;
        assert_eq!(cfg.backup_dir("sdw1"), PathBuf::from("/bk1/.clustergrade"));
        assert_eq!(cfg.backup_dir("unknown"), PathBuf::from("/data/.clustergrade"));
    }

    #[test]
    fn request_from_file_applies_defaults() {
        let file = InitializeFile {
            source_gphome: Some("/usr/local/gpdb6".into()),
            target_gphome: Some("/usr/local/gpdb7".into()),
            source_master_port: Some(5432),
            mode: Some("link".into()),
            temp_port_range: Some("6020-6022".into()),
            ..Default::default()
        };
        let req = InitializeRequest::from_file(UpgradeId::new(), file).unwrap();
        assert_eq!(req.mode, Mode::Link);
        assert_eq!(req.disk_free_ratio, 0.2);
        assert_eq!(req.jobs, DEFAULT_JOBS);
        assert_eq!(req.temp_ports, vec![6020, 6021, 6022]);
        assert_eq!(req.agent_port, DEFAULT_AGENT_PORT);

        let err = InitializeRequest::from_file(UpgradeId::new(), InitializeFile::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration file error: missing required key 'source-gphome'"
        );
    }

    #[test]
    fn initialize_file_from_toml() {
        let file: InitializeFile = toml::from_str(
            r#"
            source-gphome = "/usr/local/gpdb6"
            target-gphome = "/usr/local/gpdb7"
            source-master-port = 5432
            mode = "link"
            temp-port-range = "6020-6040"
            "#,
        )
        .unwrap();
        assert_eq!(file.source_master_port, Some(5432));
        assert_eq!(file.mode.as_deref(), Some("link"));
        assert!(file.jobs.is_none());

        let unknown: Result<InitializeFile, _> = toml::from_str("bogus = 1");
        assert!(unknown.is_err());
    }
}
