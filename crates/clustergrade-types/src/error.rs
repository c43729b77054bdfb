use thiserror::Error;

/// Errors raised while building or decoding a cluster topology.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster has no coordinator (content id -1 in primaries)")]
    MissingCoordinator,

    #[error("duplicate dbid {0}")]
    DuplicateDbid(i32),

    #[error("duplicate {role} for content id {content_id}")]
    DuplicateContent { role: &'static str, content_id: i32 },

    #[error("mirror for content id {0} has no matching primary")]
    MirrorWithoutPrimary(i32),

    #[error("segment with dbid {dbid} is stored as {expected} but has role {actual}")]
    RoleMismatch {
        dbid: i32,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("segment with dbid {dbid} is keyed under content id {key} but has content id {content_id}")]
    KeyMismatch { dbid: i32, key: i32, content_id: i32 },

    #[error("unknown segment role '{0}'")]
    UnknownRole(String),

    #[error("path requires a coordinator content identifier: '{0}'")]
    MissingCoordinatorSuffix(String),

    #[error("path has no segment prefix: '{0}'")]
    MissingSegmentPrefix(String),

    #[error("encoding cluster: {0}")]
    Encode(String),

    #[error("decoding cluster: {0}")]
    Decode(String),
}

/// Errors from version detection and upgrade-path gating.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version {raw:?} is not of the form {expected:?}")]
    UnexpectedFormat { raw: String, expected: &'static str },

    #[error("parsing version {raw:?}: {reason}")]
    Parse { raw: String, reason: String },

    #[error("upgrading from {source_version} to {target} is not supported")]
    UnsupportedUpgrade {
        source_version: semver::Version,
        target: semver::Version,
    },
}

/// Errors from the persisted status store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading status file: {0}")]
    Read(String),

    #[error("writing status file: {0}")]
    Write(String),

    #[error("status file is corrupt: {0}")]
    Corrupt(String),
}

/// Errors from establishing agent connections.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out after {timeout_secs}s connecting to agent on {host}")]
    Timeout { host: String, timeout_secs: f64 },

    #[error("connecting to agent on {host}: {reason}")]
    Failed { host: String, reason: String },
}

impl ConnectError {
    /// Remediation printed after the error.
    pub fn next_action(&self) -> Option<String> {
        match self {
            ConnectError::Timeout { host, .. } => Some(format!(
                "Check that the agent service is running on {host} and listening on the agent port, restart it if needed, then re-run the command."
            )),
            ConnectError::Failed { .. } => None,
        }
    }
}

/// Errors from upgrade configuration parsing and lookup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("invalid mode '{0}': expected 'copy' or 'link'")]
    InvalidMode(String),

    #[error("invalid port range '{0}'")]
    InvalidPortRange(String),

    #[error("disk free ratio must be between 0.0 and 1.0, got {0}")]
    InvalidDiskFreeRatio(f64),

    #[error("invalid parent backup directories '{0}'")]
    InvalidBackupDirs(String),

    #[error("configuration file error: {0}")]
    File(String),

    #[error("upgrade has not been initialized")]
    NotInitialized,
}
