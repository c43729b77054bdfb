//! Upgrade steps, their substeps, and substep statuses.
//!
//! A [`Step`] is one operator-visible phase of the upgrade. Each step runs a
//! statically declared, ordered list of [`Substep`]s. The engine records a
//! [`SubstepStatus`] for every substep so an interrupted step can be resumed.

use std::fmt;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Initialize, Step::Execute, Step::Finalize, Step::Revert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Initialize => "initialize",
            Step::Execute => "execute",
            Step::Finalize => "finalize",
            Step::Revert => "revert",
        }
    }

    /// The substeps of this step in registration order.
    pub fn substeps(&self) -> &'static [Substep] {
        use Substep::*;
        match self {
            Step::Initialize => &[
                VerifyVersions,
                SavingSourceClusterConfig,
                CheckDiskSpace,
                ExecuteInitializeDataMigrationScripts,
                GenerateTargetConfig,
                InitTargetCluster,
                ShutdownTargetCluster,
                BackupTargetCoordinator,
                CheckUpgrade,
            ],
            Step::Execute => &[
                CheckActiveConnections,
                ShutdownSourceCluster,
                UpgradeCoordinator,
                CopyCoordinator,
                UpgradePrimaries,
                StartTargetCluster,
                ReindexInvalidIndexes,
                RebuildTsvectorTables,
            ],
            Step::Finalize => &[
                UpgradeMirrors,
                UpgradeStandby,
                WaitForClusterToBeReadyAfterAddingMirrorsAndStandby,
                UpdateTargetCatalog,
                UpdateDataDirectories,
                UpdateTargetConfFiles,
                StartTargetCluster,
                WaitForClusterToBeReadyAfterUpdatingCatalog,
                ArchiveLogDirectories,
                DeleteSegmentStatedirs,
                ExecuteFinalizeDataMigrationScripts,
                DeleteCoordinatorStatedir,
            ],
            Step::Revert => &[
                ShutdownTargetCluster,
                DeleteTargetDataDirectories,
                DeleteTargetTablespaces,
                StartSourceCluster,
                ExecuteRevertDataMigrationScripts,
                ArchiveLogDirectories,
                DeleteSegmentStatedirs,
            ],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Substep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substep {
    VerifyVersions,
    SavingSourceClusterConfig,
    CheckDiskSpace,
    ExecuteInitializeDataMigrationScripts,
    GenerateTargetConfig,
    InitTargetCluster,
    ShutdownTargetCluster,
    BackupTargetCoordinator,
    CheckUpgrade,
    CheckActiveConnections,
    ShutdownSourceCluster,
    UpgradeCoordinator,
    CopyCoordinator,
    UpgradePrimaries,
    StartTargetCluster,
    ReindexInvalidIndexes,
    RebuildTsvectorTables,
    UpgradeMirrors,
    UpgradeStandby,
    WaitForClusterToBeReadyAfterAddingMirrorsAndStandby,
    UpdateTargetCatalog,
    UpdateDataDirectories,
    UpdateTargetConfFiles,
    WaitForClusterToBeReadyAfterUpdatingCatalog,
    ArchiveLogDirectories,
    DeleteSegmentStatedirs,
    ExecuteFinalizeDataMigrationScripts,
    DeleteCoordinatorStatedir,
    DeleteTargetDataDirectories,
    DeleteTargetTablespaces,
    StartSourceCluster,
    ExecuteRevertDataMigrationScripts,
}

impl Substep {
    pub fn as_str(&self) -> &'static str {
        use Substep::*;
        match self {
            VerifyVersions => "verify_versions",
            SavingSourceClusterConfig => "saving_source_cluster_config",
            CheckDiskSpace => "check_disk_space",
            ExecuteInitializeDataMigrationScripts => "execute_initialize_data_migration_scripts",
            GenerateTargetConfig => "generate_target_config",
            InitTargetCluster => "init_target_cluster",
            ShutdownTargetCluster => "shutdown_target_cluster",
            BackupTargetCoordinator => "backup_target_coordinator",
            CheckUpgrade => "check_upgrade",
            CheckActiveConnections => "check_active_connections",
            ShutdownSourceCluster => "shutdown_source_cluster",
            UpgradeCoordinator => "upgrade_coordinator",
            CopyCoordinator => "copy_coordinator",
            UpgradePrimaries => "upgrade_primaries",
            StartTargetCluster => "start_target_cluster",
            ReindexInvalidIndexes => "reindex_invalid_indexes",
            RebuildTsvectorTables => "rebuild_tsvector_tables",
            UpgradeMirrors => "upgrade_mirrors",
            UpgradeStandby => "upgrade_standby",
            UpdateTargetCatalog => "update_target_catalog",
            UpdateDataDirectories => "update_data_directories",
            UpdateTargetConfFiles => "update_target_conf_files",
            WaitForClusterToBeReadyAfterAddingMirrorsAndStandby => {
                "wait_for_cluster_to_be_ready_after_adding_mirrors_and_standby"
            }
            WaitForClusterToBeReadyAfterUpdatingCatalog => {
                "wait_for_cluster_to_be_ready_after_updating_catalog"
            }
            ArchiveLogDirectories => "archive_log_directories",
            DeleteSegmentStatedirs => "delete_segment_statedirs",
            ExecuteFinalizeDataMigrationScripts => "execute_finalize_data_migration_scripts",
            DeleteCoordinatorStatedir => "delete_coordinator_statedir",
            DeleteTargetDataDirectories => "delete_target_data_directories",
            DeleteTargetTablespaces => "delete_target_tablespaces",
            StartSourceCluster => "start_source_cluster",
            ExecuteRevertDataMigrationScripts => "execute_revert_data_migration_scripts",
        }
    }

    /// Progress line shown to the operator while the substep runs.
    pub fn description(&self) -> &'static str {
        use Substep::*;
        match self {
            VerifyVersions => "Checking cluster versions",
            SavingSourceClusterConfig => "Saving source cluster configuration",
            CheckDiskSpace => "Checking disk space",
            ExecuteInitializeDataMigrationScripts => "Running initialize data migration scripts",
            GenerateTargetConfig => "Generating target cluster configuration",
            InitTargetCluster => "Creating target cluster",
            ShutdownTargetCluster => "Stopping target cluster",
            BackupTargetCoordinator => "Backing up target coordinator",
            CheckUpgrade => "Running pg_upgrade checks",
            CheckActiveConnections => "Checking active connections on source cluster",
            ShutdownSourceCluster => "Stopping source cluster",
            UpgradeCoordinator => "Upgrading coordinator",
            CopyCoordinator => "Copying coordinator catalog to primary segments",
            UpgradePrimaries => "Upgrading primary segments",
            StartTargetCluster => "Starting target cluster",
            ReindexInvalidIndexes => "Rebuilding invalid indexes",
            RebuildTsvectorTables => "Rebuilding tables with tsvector columns",
            UpgradeMirrors => "Upgrading mirror segments",
            UpgradeStandby => "Upgrading standby coordinator",
            UpdateTargetCatalog => "Updating target cluster catalog",
            UpdateDataDirectories => "Updating data directories",
            UpdateTargetConfFiles => "Updating target cluster configuration files",
            WaitForClusterToBeReadyAfterAddingMirrorsAndStandby => {
                "Waiting for cluster to be ready after adding mirrors and standby"
            }
            WaitForClusterToBeReadyAfterUpdatingCatalog => {
                "Waiting for cluster to be ready after updating catalog"
            }
            ArchiveLogDirectories => "Archiving log directories",
            DeleteSegmentStatedirs => "Deleting state directories on the segments",
            ExecuteFinalizeDataMigrationScripts => "Running finalize data migration scripts",
            DeleteCoordinatorStatedir => "Deleting state directory on the coordinator",
            DeleteTargetDataDirectories => "Deleting target cluster data directories",
            DeleteTargetTablespaces => "Deleting target tablespace directories",
            StartSourceCluster => "Starting source cluster",
            ExecuteRevertDataMigrationScripts => "Running revert data migration scripts",
        }
    }
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstepStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl SubstepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubstepStatus::Pending => "pending",
            SubstepStatus::Running => "running",
            SubstepStatus::Complete => "complete",
            SubstepStatus::Failed => "failed",
            SubstepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SubstepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded statuses of one step's substeps, in first-write order.
///
/// Serialized as a JSON object whose key order follows the order in which
/// substeps were first recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstepStatuses {
    entries: Vec<(Substep, SubstepStatus)>,
}

impl SubstepStatuses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, substep: Substep) -> Option<SubstepStatus> {
        self.entries
            .iter()
            .find(|(s, _)| *s == substep)
            .map(|(_, status)| *status)
    }

    /// Record a status, keeping the original position of an existing entry.
    pub fn set(&mut self, substep: Substep, status: SubstepStatus) {
        match self.entries.iter_mut().find(|(s, _)| *s == substep) {
            Some(entry) => entry.1 = status,
            None => self.entries.push((substep, status)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Substep, SubstepStatus)> + '_ {
        self.entries.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for SubstepStatuses {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (substep, status) in &self.entries {
            map.serialize_entry(substep, status)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SubstepStatuses {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = SubstepStatuses;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of substep name to status")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut statuses = SubstepStatuses::new();
                while let Some((substep, status)) = access.next_entry()? {
                    statuses.set(substep, status);
                }
                Ok(statuses)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
