//! Per-host agent requests and the hub's local directory operations.
//!
//! Every `*_request` function builds the request for one host from the
//! topology, returning `None` when the host has nothing to do. They are
//! passed to [`execute_rpc`](crate::agent::execute_rpc) as the per-host
//! builder.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clustergrade_types::agent::{
    AgentRequest, ConfFileEdit, ConfSetting, MIRROR_RSYNC_FLAGS, PgOptions, RenamePair,
    RsyncOptions, UpgradeAction, UpgradeToolMode, replication_conf_file, tablespace_path,
};
use clustergrade_types::cluster::{Cluster, Role, SegConfig, SegmentTablespaces};
use clustergrade_types::config::UpgradeConfig;

use super::HubOptions;

/// Appended to a source data directory once the target takes its place.
pub const OLD_SUFFIX: &str = "_old";

/// Subdirectory of the backup dir holding the freshly initialized target
/// coordinator, used to reset it before every upgrade tool run.
pub const PRE_UPGRADE_BACKUP: &str = "coordinator_pre_upgrade";

/// Subdirectory of each primary host's backup dir receiving the upgraded
/// coordinator.
pub const POST_UPGRADE_BACKUP: &str = "coordinator_post_upgrade";

const COORDINATOR_RSYNC_FLAGS: [&str; 2] = ["--archive", "--delete"];
const COORDINATOR_RSYNC_EXCLUDES: [&str; 1] = ["pg_log/*"];

pub fn with_old_suffix(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(OLD_SUFFIX);
    PathBuf::from(name)
}

/// rsync source path ending in `/` so the directory's contents are copied.
fn contents_of(dir: &Path) -> PathBuf {
    let mut path = dir.as_os_str().to_os_string();
    if !path.to_string_lossy().ends_with('/') {
        path.push("/");
    }
    PathBuf::from(path)
}

fn user_defined(tablespaces: &SegmentTablespaces) -> impl Iterator<Item = (&u32, &Path)> {
    tablespaces
        .iter()
        .filter(|(_, info)| info.user_defined)
        .map(|(oid, info)| (oid, info.location.as_path()))
}

// ---------------------------------------------------------------------------
// Upgrade tool options
// ---------------------------------------------------------------------------

/// Upgrade tool options for one segment pair.
#[allow(clippy::too_many_arguments)]
pub fn upgrade_options(
    config: &UpgradeConfig,
    intermediate: &Cluster,
    old: &SegConfig,
    new: &SegConfig,
    action: UpgradeAction,
    tool_mode: UpgradeToolMode,
    options: HubOptions,
    timestamp: &str,
) -> PgOptions {
    PgOptions {
        action,
        tool_mode,
        mode: config.mode,
        role: new.role,
        content_id: new.content_id,
        jobs: config.jobs,
        verbose: options.pg_upgrade_verbose,
        skip_checks: options.skip_pg_upgrade_checks,
        backup_dir: config.backup_dir(&new.hostname),
        old_options: String::new(),
        target_version: intermediate.version().clone(),
        old_bin_dir: config.source.gphome().join("bin"),
        old_data_dir: old.data_dir.clone(),
        old_port: old.port,
        old_dbid: old.dbid,
        new_bin_dir: intermediate.gphome().join("bin"),
        new_data_dir: new.data_dir.clone(),
        new_port: new.port,
        new_dbid: new.dbid,
        tablespaces: config.source.segment_tablespaces(new.dbid),
        timestamp: timestamp.to_string(),
    }
}

/// Upgrade tool options for the coordinator. Upgrading from major 5 with a
/// standby passes the standby's dbid so WAL can sync.
pub fn coordinator_upgrade_options(
    config: &UpgradeConfig,
    intermediate: &Cluster,
    action: UpgradeAction,
    options: HubOptions,
    timestamp: &str,
) -> PgOptions {
    let source = &config.source;
    let mut opts = upgrade_options(
        config,
        intermediate,
        source.coordinator(),
        intermediate.coordinator(),
        action,
        UpgradeToolMode::Dispatcher,
        options,
        timestamp,
    );
    if let (5, Some(standby)) = (source.version().major, source.standby()) {
        opts.old_options = format!("-x {}", standby.dbid);
    }
    opts
}

/// Upgrade or check every primary on `host`.
pub fn upgrade_primaries_request(
    host: &str,
    config: &UpgradeConfig,
    intermediate: &Cluster,
    action: UpgradeAction,
    options: HubOptions,
    timestamp: &str,
) -> Option<AgentRequest> {
    let opts: Vec<PgOptions> = intermediate
        .select_segments(|seg| seg.hostname == host && seg.is_primary())
        .into_iter()
        .filter_map(|new| {
            let old = config.source.primaries().get(new.content_id)?;
            Some(upgrade_options(
                config,
                intermediate,
                old,
                new,
                action,
                UpgradeToolMode::Segment,
                options,
                timestamp,
            ))
        })
        .collect();

    (!opts.is_empty()).then_some(AgentRequest::UpgradePrimaries { action, opts })
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

/// Delete the data directories of `cluster`'s primaries on `host`.
pub fn delete_primary_data_dirs_request(host: &str, cluster: &Cluster) -> Option<AgentRequest> {
    let data_dirs: Vec<PathBuf> = cluster
        .select_segments(|seg| seg.hostname == host && seg.is_primary())
        .into_iter()
        .map(|seg| seg.data_dir.clone())
        .collect();
    (!data_dirs.is_empty()).then_some(AgentRequest::DeleteDataDirectories { data_dirs })
}

/// Tablespace directories the target created for `seg`.
pub fn target_tablespace_dirs(
    seg: &SegConfig,
    source: &Cluster,
    target_major: u64,
    catalog_version: &str,
) -> Vec<PathBuf> {
    user_defined(&source.segment_tablespaces(seg.dbid))
        .map(|(_, location)| tablespace_path(location, seg.dbid, target_major, catalog_version))
        .collect()
}

/// Delete the target's tablespace directories of the primaries on `host`.
pub fn delete_target_tablespaces_request(
    host: &str,
    source: &Cluster,
    intermediate: &Cluster,
) -> Option<AgentRequest> {
    let major = intermediate.version().major;
    let dirs: Vec<PathBuf> = intermediate
        .select_segments(|seg| seg.hostname == host && seg.is_primary())
        .into_iter()
        .flat_map(|seg| target_tablespace_dirs(seg, source, major, intermediate.catalog_version()))
        .collect();
    (!dirs.is_empty()).then_some(AgentRequest::DeleteTablespaceDirectories { dirs })
}

// ---------------------------------------------------------------------------
// Mirrors
// ---------------------------------------------------------------------------

/// Copy each primary on `host` to its intermediate mirror's host.
pub fn rsync_mirror_data_dirs_request(
    host: &str,
    source: &Cluster,
    intermediate: &Cluster,
) -> Option<AgentRequest> {
    let options: Vec<RsyncOptions> = source
        .select_segments(|seg| seg.hostname == host && seg.is_primary())
        .into_iter()
        .filter_map(|source_primary| {
            let content = source_primary.content_id;
            let primary = intermediate.primaries().get(content)?;
            let mirror = intermediate.mirrors().get(content)?;
            Some(RsyncOptions {
                sources: vec![source_primary.data_dir.clone(), primary.data_dir.clone()],
                destination: mirror.data_dir.parent()?.to_path_buf(),
                destination_host: mirror.hostname.clone(),
                options: MIRROR_RSYNC_FLAGS.iter().map(|f| f.to_string()).collect(),
                excluded_files: Vec::new(),
            })
        })
        .collect();
    (!options.is_empty()).then_some(AgentRequest::RsyncDataDirectories { options })
}

/// Copy the user tablespaces of each primary on `host` to its mirror's
/// tablespace location.
pub fn rsync_mirror_tablespaces_request(
    host: &str,
    source: &Cluster,
    intermediate: &Cluster,
) -> Option<AgentRequest> {
    let mut options = Vec::new();
    for source_primary in source.select_segments(|seg| seg.hostname == host && seg.is_primary()) {
        let Some(mirror) = intermediate.mirrors().get(source_primary.content_id) else {
            continue;
        };
        let mirror_tablespaces = source.segment_tablespaces(mirror.dbid);
        for (oid, location) in user_defined(&source.segment_tablespaces(source_primary.dbid)) {
            let Some(mirror_ts) = mirror_tablespaces.get(oid) else {
                continue;
            };
            options.push(RsyncOptions {
                sources: vec![contents_of(location)],
                destination: mirror_ts.location.clone(),
                destination_host: mirror.hostname.clone(),
                options: MIRROR_RSYNC_FLAGS.iter().map(|f| f.to_string()).collect(),
                excluded_files: Vec::new(),
            });
        }
    }
    (!options.is_empty()).then_some(AgentRequest::RsyncTablespaceDirectories { options })
}

/// Copied mirror tablespaces carry the primary's dbid; rename them to the
/// mirror's on the mirror's host.
pub fn rename_mirror_tablespaces_request(
    host: &str,
    source: &Cluster,
    intermediate: &Cluster,
) -> Option<AgentRequest> {
    let mut pairs = Vec::new();
    for mirror in intermediate.select_segments(|seg| seg.hostname == host && seg.is_mirror()) {
        let (Some(primary), Some(source_primary)) = (
            intermediate.primaries().get(mirror.content_id),
            source.primaries().get(mirror.content_id),
        ) else {
            continue;
        };
        let mirror_tablespaces = source.segment_tablespaces(mirror.dbid);
        for (oid, location) in user_defined(&source.segment_tablespaces(source_primary.dbid)) {
            let Some(mirror_ts) = mirror_tablespaces.get(oid) else {
                continue;
            };
            pairs.push(RenamePair {
                source: mirror_ts.location.join(primary.dbid.to_string()),
                destination: location.join(mirror.dbid.to_string()),
            });
        }
    }
    (!pairs.is_empty()).then_some(AgentRequest::RenameTablespaces { pairs })
}

// ---------------------------------------------------------------------------
// Data directory swap
// ---------------------------------------------------------------------------

/// For every non-coordinator segment on `host`: archive the source data
/// directory as `<dir>_old` and move the intermediate one into its place.
pub fn rename_data_dirs_request(
    host: &str,
    source: &Cluster,
    intermediate: &Cluster,
) -> Option<AgentRequest> {
    let mut pairs = Vec::new();
    for seg in intermediate.select_segments(|seg| seg.hostname == host && !seg.is_coordinator()) {
        let Some(original) = source.select_segments(|s| s.dbid == seg.dbid).first().copied() else {
            continue;
        };
        pairs.push(RenamePair {
            source: original.data_dir.clone(),
            destination: with_old_suffix(&original.data_dir),
        });
        pairs.push(RenamePair {
            source: seg.data_dir.clone(),
            destination: original.data_dir.clone(),
        });
    }
    (!pairs.is_empty()).then_some(AgentRequest::RenameDirectories { pairs })
}

// ---------------------------------------------------------------------------
// Configuration files
// ---------------------------------------------------------------------------

/// Port rewrites for one target segment whose data directory now holds the
/// intermediate segment with the same dbid. Mirrors and the standby also
/// get their `primary_conninfo` pointed at the primary's target port.
pub fn conf_file_edits(seg: &SegConfig, intermediate: &Cluster, target: &Cluster) -> Vec<ConfFileEdit> {
    let Some(old) = intermediate.select_segments(|s| s.dbid == seg.dbid).first().copied() else {
        return Vec::new();
    };

    let mut edits = vec![ConfFileEdit {
        path: seg.data_dir.join("postgresql.conf"),
        setting: ConfSetting::Port,
        old_port: old.port,
        new_port: seg.port,
    }];

    if seg.role == Role::Mirror {
        let primaries = (
            intermediate.primaries().get(seg.content_id),
            target.primaries().get(seg.content_id),
        );
        if let (Some(old_primary), Some(primary)) = primaries {
            edits.push(ConfFileEdit {
                path: seg
                    .data_dir
                    .join(replication_conf_file(target.version().major)),
                setting: ConfSetting::PrimaryConninfo,
                old_port: old_primary.port,
                new_port: primary.port,
            });
        }
    }
    edits
}

/// Configuration file rewrites for every segment on `host` except the
/// coordinator, which the hub rewrites itself.
pub fn update_conf_files_request(
    host: &str,
    intermediate: &Cluster,
    target: &Cluster,
) -> Option<AgentRequest> {
    let edits: Vec<ConfFileEdit> = target
        .select_segments(|seg| seg.hostname == host && !seg.is_coordinator())
        .into_iter()
        .flat_map(|seg| conf_file_edits(seg, intermediate, target))
        .collect();
    (!edits.is_empty()).then_some(AgentRequest::UpdateConfFiles { edits })
}

/// Apply edits to files on this host.
pub async fn update_conf_files(edits: &[ConfFileEdit]) -> anyhow::Result<()> {
    for edit in edits {
        let contents = tokio::fs::read_to_string(&edit.path)
            .await
            .with_context(|| format!("reading {}", edit.path.display()))?;
        let updated = edit.apply(&contents);
        if updated == contents {
            continue;
        }
        tokio::fs::write(&edit.path, updated)
            .await
            .with_context(|| format!("writing {}", edit.path.display()))?;
        tracing::info!(
            file = %edit.path.display(),
            old_port = edit.old_port,
            new_port = edit.new_port,
            "updated configuration file"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Disk space
// ---------------------------------------------------------------------------

/// Data directories of the source segments on `host`, coordinator excluded.
pub fn check_disk_space_request(
    host: &str,
    source: &Cluster,
    disk_free_ratio: f64,
) -> Option<AgentRequest> {
    let dirs: Vec<PathBuf> = source
        .select_segments(|seg| seg.hostname == host && !seg.is_coordinator())
        .into_iter()
        .map(|seg| seg.data_dir.clone())
        .collect();
    (!dirs.is_empty()).then_some(AgentRequest::CheckDiskSpace {
        dirs,
        disk_free_ratio,
    })
}

// ---------------------------------------------------------------------------
// Coordinator-local operations
// ---------------------------------------------------------------------------

/// rsync options copying `from`'s contents into `to`, optionally on a remote
/// host.
pub fn coordinator_rsync(from: &Path, to: &Path, host: &str) -> RsyncOptions {
    RsyncOptions {
        sources: vec![contents_of(from)],
        destination: to.to_path_buf(),
        destination_host: host.to_string(),
        options: COORDINATOR_RSYNC_FLAGS.iter().map(|f| f.to_string()).collect(),
        excluded_files: COORDINATOR_RSYNC_EXCLUDES.iter().map(|f| f.to_string()).collect(),
    }
}

/// Remove a data directory. A missing directory is fine; a directory that
/// exists without `PG_VERSION` is refused.
pub async fn delete_data_dir(dir: &Path) -> anyhow::Result<()> {
    match tokio::fs::metadata(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("inspecting {}", dir.display())),
        Ok(_) => {}
    }

    if !tokio::fs::try_exists(dir.join("PG_VERSION")).await.unwrap_or(false) {
        anyhow::bail!(
            "refusing to delete {}: not a postgres data directory",
            dir.display()
        );
    }

    tokio::fs::remove_dir_all(dir)
        .await
        .with_context(|| format!("deleting {}", dir.display()))?;
    tracing::info!(dir = %dir.display(), "deleted data directory");
    Ok(())
}

/// Remove a directory tree if it exists.
pub async fn delete_dir_if_exists(dir: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other.with_context(|| format!("deleting {}", dir.display())),
    }
}

/// Rename `from` to `to`. Already renamed (only `to` exists) is success.
pub async fn rename_dir(from: &Path, to: &Path) -> anyhow::Result<()> {
    let from_exists = tokio::fs::try_exists(from).await.unwrap_or(false);
    let to_exists = tokio::fs::try_exists(to).await.unwrap_or(false);
    if !from_exists && to_exists {
        tracing::debug!(from = %from.display(), to = %to.display(), "already renamed");
        return Ok(());
    }

    tokio::fs::rename(from, to)
        .await
        .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
}

/// Source tablespace listing handed to the upgrade tool:
/// `dbid,oid,location,user_defined` per line.
pub fn tablespaces_file_contents(source: &Cluster) -> String {
    let mut text = String::new();
    for (dbid, tablespaces) in source.tablespaces() {
        for (oid, info) in tablespaces {
            text.push_str(&format!(
                "{dbid},{oid},{},{}\n",
                info.location.display(),
                u8::from(info.user_defined)
            ));
        }
    }
    text
}

/// Directory the hub's and agents' logs are moved to at the end of
/// finalize or revert.
pub fn log_archive_dir(log_dir: &Path, config: &UpgradeConfig) -> PathBuf {
    let name = format!(
        "clustergrade-{}-{}",
        config.id.short(),
        chrono::Utc::now().format("%Y%m%dT%H%M")
    );
    log_dir
        .parent()
        .map(|parent| parent.join(&name))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use clustergrade_types::cluster::{Destination, Role, TablespaceInfo, Tablespaces};
    use clustergrade_types::config::Mode;

    use super::*;
    use crate::hub::tests::Fixture;

    fn with_tablespaces(config: &mut UpgradeConfig) {
        let mut tablespaces = Tablespaces::new();
        for (dbid, location) in [(2, "/ts/p0"), (4, "/ts/m0"), (3, "/ts/p1")] {
            tablespaces.entry(dbid).or_default().insert(
                16384,
                TablespaceInfo {
                    location: location.into(),
                    user_defined: true,
                },
            );
            tablespaces.entry(dbid).or_default().insert(
                1663,
                TablespaceInfo {
                    location: "/pg_default".into(),
                    user_defined: false,
                },
            );
        }
        config.source = config.source.clone().with_tablespaces(tablespaces);
    }

    #[test]
    fn old_suffix_is_appended() {
        assert_eq!(
            with_old_suffix(Path::new("/data/primary/gpseg0")),
            PathBuf::from("/data/primary/gpseg0_old")
        );
    }

    #[test]
    fn primaries_request_only_covers_host_primaries() {
        let fx = Fixture::new();
        let config = fx.initialized_config();
        let mid = config.intermediate.clone().unwrap();

        let req = upgrade_primaries_request(
            "sdw1",
            &config,
            &mid,
            UpgradeAction::Check,
            HubOptions::default(),
            "20250101T000000",
        )
        .unwrap();
        let AgentRequest::UpgradePrimaries { action, opts } = req else {
            panic!("wrong request");
        };
        assert_eq!(action, UpgradeAction::Check);
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].content_id, 0);
        assert_eq!(opts[0].old_port, 6000);
        assert_eq!(opts[0].new_port, mid.primaries().get(0).unwrap().port);
        assert_eq!(opts[0].tool_mode, UpgradeToolMode::Segment);
        assert_eq!(opts[0].old_bin_dir, PathBuf::from("/usr/local/gpdb6/bin"));
        assert_eq!(opts[0].backup_dir, config.backup_dir("sdw1"));

        assert!(
            upgrade_primaries_request(
                "scdw",
                &config,
                &mid,
                UpgradeAction::Check,
                HubOptions::default(),
                "t"
            )
            .is_none()
        );
    }

    #[test]
    fn coordinator_options_pass_standby_dbid_from_five() {
        let fx = Fixture::new();
        let mut config = fx.initialized_config();
        let mid = config.intermediate.clone().unwrap();

        let opts = coordinator_upgrade_options(&config, &mid, UpgradeAction::Upgrade, HubOptions::default(), "t");
        assert_eq!(opts.old_options, "");
        assert_eq!(opts.tool_mode, UpgradeToolMode::Dispatcher);

        let segments = config.source.select_segments(|_| true).into_iter().cloned().collect();
        config.source = Cluster::new(
            Destination::Source,
            segments,
            "/usr/local/gpdb5",
            semver::Version::new(5, 28, 0),
        )
        .unwrap();
        let opts = coordinator_upgrade_options(&config, &mid, UpgradeAction::Upgrade, HubOptions::default(), "t");
        assert_eq!(opts.old_options, "-x 6");
    }

    #[test]
    fn delete_requests_skip_hosts_without_primaries() {
        let fx = Fixture::new();
        let config = fx.initialized_config();
        let mid = config.intermediate.clone().unwrap();

        let Some(AgentRequest::DeleteDataDirectories { data_dirs }) =
            delete_primary_data_dirs_request("sdw2", &mid)
        else {
            panic!("expected a delete request");
        };
        assert_eq!(data_dirs, vec![mid.primaries().get(1).unwrap().data_dir.clone()]);
        assert!(delete_primary_data_dirs_request("scdw", &mid).is_none());
    }

    #[test]
    fn target_tablespaces_use_target_layout() {
        let fx = Fixture::new();
        let mut config = fx.initialized_config();
        with_tablespaces(&mut config);
        let mid = config.intermediate.clone().unwrap();

        let Some(AgentRequest::DeleteTablespaceDirectories { dirs }) =
            delete_target_tablespaces_request("sdw1", &config.source, &mid)
        else {
            panic!("expected a tablespace request");
        };
        assert_eq!(dirs, vec![PathBuf::from("/ts/p0/2/GPDB_7_302307241")]);
    }

    #[test]
    fn mirror_rsync_and_rename_follow_content_ids() {
        let fx = Fixture::new();
        let mut config = fx.initialized_config();
        config.mode = Mode::Link;
        with_tablespaces(&mut config);
        let mid = config.intermediate.clone().unwrap();

        let Some(AgentRequest::RsyncDataDirectories { options }) =
            rsync_mirror_data_dirs_request("sdw1", &config.source, &mid)
        else {
            panic!("expected rsync");
        };
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].destination_host, "sdw2");
        assert_eq!(options[0].destination, PathBuf::from("/data/mirror"));
        assert_eq!(options[0].sources[0], PathBuf::from("/data/primary/gpseg0"));

        let Some(AgentRequest::RsyncTablespaceDirectories { options }) =
            rsync_mirror_tablespaces_request("sdw1", &config.source, &mid)
        else {
            panic!("expected tablespace rsync");
        };
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].sources, vec![PathBuf::from("/ts/p0/")]);
        assert_eq!(options[0].destination, PathBuf::from("/ts/m0"));

        let Some(AgentRequest::RenameTablespaces { pairs }) =
            rename_mirror_tablespaces_request("sdw2", &config.source, &mid)
        else {
            panic!("expected rename");
        };
        assert_eq!(
            pairs,
            vec![RenamePair {
                source: PathBuf::from("/ts/m0/2"),
                destination: PathBuf::from("/ts/p0/4"),
            }]
        );
    }

    #[test]
    fn rename_request_swaps_every_segment_on_host() {
        let fx = Fixture::new();
        let config = fx.initialized_config();
        let mid = config.intermediate.clone().unwrap();

        let Some(AgentRequest::RenameDirectories { pairs }) =
            rename_data_dirs_request("sdw1", &config.source, &mid)
        else {
            panic!("expected rename");
        };
        // Primary content 0 and mirror content 1.
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].source, PathBuf::from("/data/primary/gpseg0"));
        assert_eq!(pairs[0].destination, PathBuf::from("/data/primary/gpseg0_old"));
        assert_eq!(pairs[1].source, mid.primaries().get(0).unwrap().data_dir);
        assert_eq!(pairs[1].destination, PathBuf::from("/data/primary/gpseg0"));
        assert!(rename_data_dirs_request("cdw", &config.source, &mid).is_none());
    }

    #[test]
    fn conf_edits_move_segments_and_replication_to_target_ports() {
        let fx = Fixture::new();
        let config = fx.initialized_config();
        let mid = config.intermediate.clone().unwrap();
        let target = crate::hub::target::target_cluster(&config.source, &mid).unwrap();

        let Some(AgentRequest::UpdateConfFiles { edits }) = update_conf_files_request("sdw1", &mid, &target) else {
            panic!("expected conf file edits");
        };
        assert_eq!(
            edits,
            vec![
                ConfFileEdit {
                    path: PathBuf::from("/data/primary/gpseg0/postgresql.conf"),
                    setting: ConfSetting::Port,
                    old_port: 50434,
                    new_port: 6000,
                },
                ConfFileEdit {
                    path: PathBuf::from("/data/mirror/gpseg1/postgresql.conf"),
                    setting: ConfSetting::Port,
                    old_port: 50437,
                    new_port: 7001,
                },
                ConfFileEdit {
                    path: PathBuf::from("/data/mirror/gpseg1/postgresql.auto.conf"),
                    setting: ConfSetting::PrimaryConninfo,
                    old_port: 50435,
                    new_port: 6001,
                },
            ]
        );

        // The standby replicates from the coordinator.
        let Some(AgentRequest::UpdateConfFiles { edits }) = update_conf_files_request("scdw", &mid, &target) else {
            panic!("expected standby edits");
        };
        assert_eq!(edits[1].setting, ConfSetting::PrimaryConninfo);
        assert_eq!((edits[1].old_port, edits[1].new_port), (50432, 5432));

        assert!(update_conf_files_request("cdw", &mid, &target).is_none());
        let coordinator = conf_file_edits(target.coordinator(), &mid, &target);
        assert_eq!(coordinator.len(), 1);
        assert_eq!((coordinator[0].old_port, coordinator[0].new_port), (50432, 5432));
    }

    #[tokio::test]
    async fn update_conf_files_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("postgresql.conf");
        std::fs::write(&conf, "listen_addresses='*'\nport=50432\n").unwrap();
        let edits = [ConfFileEdit {
            path: conf.clone(),
            setting: ConfSetting::Port,
            old_port: 50432,
            new_port: 5432,
        }];

        update_conf_files(&edits).await.unwrap();
        update_conf_files(&edits).await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "listen_addresses='*'\nport=5432\n");

        let missing = [ConfFileEdit {
            path: dir.path().join("absent/postgresql.conf"),
            ..edits[0].clone()
        }];
        assert!(update_conf_files(&missing).await.is_err());
    }

    #[test]
    fn disk_space_request_lists_segment_dirs_on_host() {
        let fx = Fixture::new();
        let config = fx.initialized_config();

        let Some(AgentRequest::CheckDiskSpace { dirs, disk_free_ratio }) =
            check_disk_space_request("sdw2", &config.source, 0.6)
        else {
            panic!("expected disk space check");
        };
        assert_eq!(
            dirs,
            vec![PathBuf::from("/data/primary/gpseg1"), PathBuf::from("/data/mirror/gpseg0")]
        );
        assert_eq!(disk_free_ratio, 0.6);
        assert!(check_disk_space_request("cdw", &config.source, 0.6).is_none());
    }

    #[tokio::test]
    async fn delete_data_dir_requires_pg_version() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("gpseg-1");

        delete_data_dir(&data).await.unwrap();

        std::fs::create_dir(&data).unwrap();
        assert!(delete_data_dir(&data).await.is_err());
        assert!(data.exists());

        std::fs::write(data.join("PG_VERSION"), "7\n").unwrap();
        delete_data_dir(&data).await.unwrap();
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn rename_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        std::fs::create_dir(&from).unwrap();

        rename_dir(&from, &to).await.unwrap();
        rename_dir(&from, &to).await.unwrap();
        assert!(to.exists());
        assert!(!from.exists());
    }

    #[test]
    fn tablespaces_file_lists_every_entry() {
        let seg = SegConfig {
            dbid: 1,
            content_id: -1,
            role: Role::Primary,
            hostname: "cdw".into(),
            port: 5432,
            data_dir: "/data/qddir/gpseg-1".into(),
        };
        let mut tablespaces = Tablespaces::new();
        tablespaces.entry(1).or_default().insert(
            16384,
            TablespaceInfo {
                location: "/ts/qd".into(),
                user_defined: true,
            },
        );
        let cluster = Cluster::new(
            Destination::Source,
            vec![seg],
            "/usr/local/gpdb6",
            semver::Version::new(6, 26, 1),
        )
        .unwrap()
        .with_tablespaces(tablespaces);
        assert_eq!(tablespaces_file_contents(&cluster), "1,16384,/ts/qd,1\n");
    }
}
