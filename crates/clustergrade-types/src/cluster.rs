//! Cluster topology types.
//!
//! A [`Cluster`] is an immutable snapshot of one cluster's shape: which
//! segment processes exist, where they live, and which version they run.
//! It is built once per run from a catalog query or decoded from persisted
//! configuration, and is read-only afterwards. The target topology produced
//! during an upgrade is a separate `Cluster` value.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Content id shared by the coordinator and its standby.
pub const COORDINATOR_CONTENT_ID: i32 = -1;

/// The coordinator always has dbid 1.
pub const COORDINATOR_DBID: i32 = 1;

// ---------------------------------------------------------------------------
// SegConfig
// ---------------------------------------------------------------------------

/// Whether a segment process currently acts as a primary or a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Mirror,
}

impl Role {
    /// Parse the single-letter role code stored in `gp_segment_configuration`.
    pub fn from_code(code: &str) -> Result<Self, ClusterError> {
        match code {
            "p" => Ok(Role::Primary),
            "m" => Ok(Role::Mirror),
            other => Err(ClusterError::UnknownRole(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Mirror => "mirror",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One segment process of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegConfig {
    /// Unique across the cluster.
    pub dbid: i32,
    /// Shared by a primary and its mirror. -1 for coordinator and standby.
    pub content_id: i32,
    pub role: Role,
    pub hostname: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl SegConfig {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID && self.role == Role::Mirror
    }

    pub fn is_primary(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT_ID && self.role == Role::Mirror
    }

    /// Human-readable label used in logs and error messages.
    pub fn label(&self) -> String {
        format!(
            "{} (dbid {}, content {}) on {}:{}",
            self.kind(),
            self.dbid,
            self.content_id,
            self.hostname,
            self.port
        )
    }

    fn kind(&self) -> &'static str {
        if self.is_coordinator() {
            "coordinator"
        } else if self.is_standby() {
            "standby"
        } else {
            self.role.as_str()
        }
    }
}

// ---------------------------------------------------------------------------
// ContentToSegConfig
// ---------------------------------------------------------------------------

/// Segments keyed by content id. Iteration is ordered by content id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentToSegConfig(BTreeMap<i32, SegConfig>);

impl ContentToSegConfig {
    pub fn get(&self, content_id: i32) -> Option<&SegConfig> {
        self.0.get(&content_id)
    }

    pub fn contains(&self, content_id: i32) -> bool {
        self.0.contains_key(&content_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegConfig> {
        self.0.values()
    }

    pub fn content_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.keys().copied()
    }

    pub fn excluding_coordinator(&self) -> ContentToSegConfig {
        self.excluding_coordinator_or_standby()
    }

    pub fn excluding_standby(&self) -> ContentToSegConfig {
        self.excluding_coordinator_or_standby()
    }

    fn excluding_coordinator_or_standby(&self) -> ContentToSegConfig {
        ContentToSegConfig(
            self.0
                .iter()
                .filter(|(content, _)| **content != COORDINATOR_CONTENT_ID)
                .map(|(content, seg)| (*content, seg.clone()))
                .collect(),
        )
    }

    fn insert(&mut self, seg: SegConfig) -> Option<SegConfig> {
        self.0.insert(seg.content_id, seg)
    }
}

impl FromIterator<SegConfig> for ContentToSegConfig {
    fn from_iter<I: IntoIterator<Item = SegConfig>>(iter: I) -> Self {
        ContentToSegConfig(iter.into_iter().map(|s| (s.content_id, s)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tablespaces
// ---------------------------------------------------------------------------

/// Location of one tablespace on one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub location: PathBuf,
    pub user_defined: bool,
}

/// Tablespace oid -> location for a single segment.
pub type SegmentTablespaces = BTreeMap<u32, TablespaceInfo>;

/// Segment dbid -> its tablespaces.
pub type Tablespaces = BTreeMap<i32, SegmentTablespaces>;

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// Which side of the upgrade a cluster belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Source,
    /// The target cluster while it still runs on temporary ports and paths.
    Intermediate,
    Target,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Destination::Source => "source",
            Destination::Intermediate => "intermediate",
            Destination::Target => "target",
        })
    }
}

/// Immutable snapshot of a cluster's shape.
///
/// Invariants, checked by [`Cluster::new`] and on deserialization:
/// - `primaries` holds exactly one coordinator (content id -1);
/// - `mirrors` holds a content id -1 entry iff a standby is configured;
/// - every mirror has a primary with the same content id;
/// - every segment's role matches the map it is stored in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClusterRecord")]
pub struct Cluster {
    destination: Destination,
    primaries: ContentToSegConfig,
    mirrors: ContentToSegConfig,
    tablespaces: Tablespaces,
    gphome: PathBuf,
    version: semver::Version,
    catalog_version: String,
}

/// Unvalidated wire shape of [`Cluster`].
#[derive(Deserialize)]
struct ClusterRecord {
    destination: Destination,
    primaries: ContentToSegConfig,
    mirrors: ContentToSegConfig,
    tablespaces: Tablespaces,
    gphome: PathBuf,
    version: semver::Version,
    catalog_version: String,
}

impl TryFrom<ClusterRecord> for Cluster {
    type Error = ClusterError;

    fn try_from(record: ClusterRecord) -> Result<Self, Self::Error> {
        let cluster = Cluster {
            destination: record.destination,
            primaries: record.primaries,
            mirrors: record.mirrors,
            tablespaces: record.tablespaces,
            gphome: record.gphome,
            version: record.version,
            catalog_version: record.catalog_version,
        };
        cluster.validate()?;
        Ok(cluster)
    }
}

impl Cluster {
    /// Build a cluster from a flat segment list, partitioning by role.
    pub fn new(
        destination: Destination,
        segments: Vec<SegConfig>,
        gphome: impl Into<PathBuf>,
        version: semver::Version,
    ) -> Result<Self, ClusterError> {
        let mut dbids = HashSet::new();
        let mut primaries = ContentToSegConfig::default();
        let mut mirrors = ContentToSegConfig::default();

        for seg in segments {
            if !dbids.insert(seg.dbid) {
                return Err(ClusterError::DuplicateDbid(seg.dbid));
            }

            let (map, role) = match seg.role {
                Role::Primary => (&mut primaries, "primary"),
                Role::Mirror => (&mut mirrors, "mirror"),
            };
            let content_id = seg.content_id;
            if map.insert(seg).is_some() {
                return Err(ClusterError::DuplicateContent { role, content_id });
            }
        }

        let cluster = Cluster {
            destination,
            primaries,
            mirrors,
            tablespaces: Tablespaces::new(),
            gphome: gphome.into(),
            version,
            catalog_version: String::new(),
        };
        cluster.validate()?;
        Ok(cluster)
    }

    pub fn with_tablespaces(mut self, tablespaces: Tablespaces) -> Self {
        self.tablespaces = tablespaces;
        self
    }

    pub fn with_catalog_version(mut self, catalog_version: impl Into<String>) -> Self {
        self.catalog_version = catalog_version.into();
        self
    }

    fn validate(&self) -> Result<(), ClusterError> {
        for (expected, map) in [(Role::Primary, &self.primaries), (Role::Mirror, &self.mirrors)] {
            for (key, seg) in &map.0 {
                if *key != seg.content_id {
                    return Err(ClusterError::KeyMismatch {
                        dbid: seg.dbid,
                        key: *key,
                        content_id: seg.content_id,
                    });
                }
                if seg.role != expected {
                    return Err(ClusterError::RoleMismatch {
                        dbid: seg.dbid,
                        expected: expected.as_str(),
                        actual: seg.role.as_str(),
                    });
                }
            }
        }

        if !self.primaries.contains(COORDINATOR_CONTENT_ID) {
            return Err(ClusterError::MissingCoordinator);
        }

        if let Some(orphan) = self
            .mirrors
            .content_ids()
            .find(|content| !self.primaries.contains(*content))
        {
            return Err(ClusterError::MirrorWithoutPrimary(orphan));
        }

        let mut dbids = HashSet::new();
        if let Some(dup) = self
            .primaries
            .iter()
            .chain(self.mirrors.iter())
            .find(|seg| !dbids.insert(seg.dbid))
        {
            return Err(ClusterError::DuplicateDbid(dup.dbid));
        }

        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn primaries(&self) -> &ContentToSegConfig {
        &self.primaries
    }

    pub fn mirrors(&self) -> &ContentToSegConfig {
        &self.mirrors
    }

    pub fn tablespaces(&self) -> &Tablespaces {
        &self.tablespaces
    }

    pub fn gphome(&self) -> &Path {
        &self.gphome
    }

    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    pub fn catalog_version(&self) -> &str {
        &self.catalog_version
    }

    pub fn coordinator(&self) -> &SegConfig {
        // Presence is checked by validate() and the maps are never mutated.
        &self.primaries.0[&COORDINATOR_CONTENT_ID]
    }

    pub fn coordinator_data_dir(&self) -> &Path {
        &self.coordinator().data_dir
    }

    pub fn coordinator_port(&self) -> u16 {
        self.coordinator().port
    }

    pub fn coordinator_hostname(&self) -> &str {
        &self.coordinator().hostname
    }

    pub fn standby(&self) -> Option<&SegConfig> {
        self.mirrors.get(COORDINATOR_CONTENT_ID)
    }

    pub fn has_standby(&self) -> bool {
        self.standby().is_some()
    }

    /// True if at least one mirror other than the standby exists.
    pub fn has_mirrors(&self) -> bool {
        self.mirrors.iter().any(|seg| !seg.is_standby())
    }

    /// True if every primary, the coordinator included, has a mirror.
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.primaries
            .content_ids()
            .all(|content| self.mirrors.contains(content))
    }

    /// Hosts running at least one non-coordinator primary, sorted.
    pub fn primary_hostnames(&self) -> Vec<String> {
        let hosts: BTreeSet<&str> = self
            .primaries
            .iter()
            .filter(|seg| seg.content_id >= 0)
            .map(|seg| seg.hostname.as_str())
            .collect();
        hosts.into_iter().map(str::to_string).collect()
    }

    /// Every host of the cluster including coordinator and standby, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let hosts: BTreeSet<&str> = self
            .primaries
            .iter()
            .chain(self.mirrors.iter())
            .map(|seg| seg.hostname.as_str())
            .collect();
        hosts.into_iter().map(str::to_string).collect()
    }

    /// Hosts that run an agent: every host with a segment other than the
    /// coordinator, standby included. Sorted.
    pub fn agent_hostnames(&self) -> Vec<String> {
        let hosts: BTreeSet<&str> = self
            .primaries
            .iter()
            .chain(self.mirrors.iter())
            .filter(|seg| !seg.is_coordinator())
            .map(|seg| seg.hostname.as_str())
            .collect();
        hosts.into_iter().map(str::to_string).collect()
    }

    /// All segments (primaries first, then mirrors) matching `selector`.
    pub fn select_segments<F>(&self, selector: F) -> Vec<&SegConfig>
    where
        F: Fn(&SegConfig) -> bool,
    {
        self.primaries
            .iter()
            .chain(self.mirrors.iter())
            .filter(|seg| selector(seg))
            .collect()
    }

    /// Primaries and mirrors with the coordinator and standby removed.
    pub fn excluding_coordinator_or_standby(&self) -> Vec<&SegConfig> {
        self.select_segments(|seg| seg.content_id != COORDINATOR_CONTENT_ID)
    }

    /// Tablespaces of one segment, or an empty map.
    pub fn segment_tablespaces(&self, dbid: i32) -> SegmentTablespaces {
        self.tablespaces.get(&dbid).cloned().unwrap_or_default()
    }

    // -- encoding -----------------------------------------------------------

    /// Compact binary encoding used when shipping a topology to agents.
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        bincode::serialize(self).map_err(|e| ClusterError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
        bincode::deserialize(bytes).map_err(|e| ClusterError::Decode(e.to_string()))
    }
}

/// Derive the segment prefix from a coordinator data directory.
///
/// `/data/coordinator/gpseg-1` yields `gpseg`.
pub fn coordinator_seg_prefix(data_dir: &Path) -> Result<String, ClusterError> {
    let display = data_dir.display().to_string();
    let base = data_dir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();

    let prefix = base
        .strip_suffix("-1")
        .ok_or_else(|| ClusterError::MissingCoordinatorSuffix(display.clone()))?;
    if prefix.is_empty() {
        return Err(ClusterError::MissingSegmentPrefix(display));
    }
    Ok(prefix.to_string())
}
