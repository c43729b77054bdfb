//! Intermediate and target topology generation.
//!
//! The intermediate cluster is created next to the source on temporary ports
//! and data directories. Finalize later turns it into the target cluster,
//! which takes over the source's ports and directories.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clustergrade_types::cluster::{Cluster, Destination, SegConfig, coordinator_seg_prefix};
use clustergrade_types::config::UpgradeId;
use clustergrade_types::error::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("not enough temporary ports: need {needed}, {available} usable in the configured range")]
    PortsExhausted { needed: usize, available: usize },

    #[error("segment dbid {0} has no data directory parent")]
    NoParent(i32),

    #[error(transparent)]
    Topology(#[from] ClusterError),
}

/// Data directory of a segment of the intermediate cluster:
/// `<parent of source dir>/<prefix>.<short id>.<content id>`.
pub fn intermediate_data_dir(
    seg: &SegConfig,
    prefix: &str,
    id: &UpgradeId,
) -> Result<PathBuf, TargetError> {
    let parent = seg.data_dir.parent().ok_or(TargetError::NoParent(seg.dbid))?;
    Ok(parent.join(format!("{prefix}.{}.{}", id.short(), seg.content_id)))
}

/// Build the intermediate cluster from the source topology.
///
/// Keeps every dbid, content id, role and host. Ports are handed out from
/// `temp_ports` in order (coordinator, standby, primaries, mirrors), skipping
/// any port the source already uses.
pub fn intermediate_cluster(
    source: &Cluster,
    gphome: &Path,
    version: semver::Version,
    catalog_version: &str,
    id: &UpgradeId,
    temp_ports: &[u16],
) -> Result<Cluster, TargetError> {
    let prefix = coordinator_seg_prefix(source.coordinator_data_dir())?;

    let mut ordered: Vec<&SegConfig> = vec![source.coordinator()];
    ordered.extend(source.standby());
    ordered.extend(source.primaries().iter().filter(|s| !s.is_coordinator()));
    ordered.extend(source.mirrors().iter().filter(|s| !s.is_standby()));

    let used: BTreeSet<u16> = ordered.iter().map(|s| s.port).collect();
    let available: Vec<u16> = temp_ports
        .iter()
        .copied()
        .filter(|port| !used.contains(port))
        .collect();
    if available.len() < ordered.len() {
        return Err(TargetError::PortsExhausted {
            needed: ordered.len(),
            available: available.len(),
        });
    }

    let segments = ordered
        .iter()
        .zip(available)
        .map(|(seg, port)| {
            Ok(SegConfig {
                port,
                data_dir: intermediate_data_dir(seg, &prefix, id)?,
                ..(*seg).clone()
            })
        })
        .collect::<Result<Vec<_>, TargetError>>()?;

    tracing::info!(
        segments = segments.len(),
        coordinator_port = segments[0].port,
        "generated intermediate cluster"
    );

    Ok(
        Cluster::new(Destination::Intermediate, segments, gphome, version)?
            .with_catalog_version(catalog_version),
    )
}

/// The cluster finalize leaves behind: the intermediate's software on the
/// source's ports and data directories.
pub fn target_cluster(source: &Cluster, intermediate: &Cluster) -> Result<Cluster, TargetError> {
    let segments = intermediate
        .select_segments(|_| true)
        .into_iter()
        .map(|seg| {
            let original = source
                .select_segments(|s| s.dbid == seg.dbid)
                .first()
                .map(|s| (s.port, s.data_dir.clone()));
            let (port, data_dir) = original.unwrap_or((seg.port, seg.data_dir.clone()));
            SegConfig {
                port,
                data_dir,
                ..seg.clone()
            }
        })
        .collect();

    Ok(Cluster::new(
        Destination::Target,
        segments,
        intermediate.gphome(),
        intermediate.version().clone(),
    )?
    .with_catalog_version(intermediate.catalog_version())
    .with_tablespaces(source.tablespaces().clone()))
}

/// `gpinitsystem` configuration creating the coordinator and primaries of
/// `intermediate`. Mirrors and standby are added during finalize.
pub fn gpinitsystem_config(intermediate: &Cluster, use_hba_hostnames: bool) -> String {
    let coordinator = intermediate.coordinator();
    let mut text = String::new();
    let _ = writeln!(text, "ARRAY_NAME=\"clustergrade target cluster\"");
    let _ = writeln!(text, "TRUSTED_SHELL=ssh");
    let _ = writeln!(text, "ENCODING=UNICODE");
    let _ = writeln!(
        text,
        "HBA_HOSTNAMES={}",
        if use_hba_hostnames { 1 } else { 0 }
    );
    let _ = writeln!(text, "QD_PRIMARY_ARRAY={}", array_entry(coordinator));
    let _ = writeln!(text, "declare -a PRIMARY_ARRAY=(");
    for seg in intermediate.primaries().excluding_coordinator().iter() {
        let _ = writeln!(text, "{}", array_entry(seg));
    }
    let _ = writeln!(text, ")");
    text
}

fn array_entry(seg: &SegConfig) -> String {
    format!(
        "{host}~{host}~{port}~{dir}~{dbid}~{content}",
        host = seg.hostname,
        port = seg.port,
        dir = seg.data_dir.display(),
        dbid = seg.dbid,
        content = seg.content_id,
    )
}

/// `gpaddmirrors -i` input: one `content|host|port|datadir` line per mirror.
pub fn gpaddmirrors_config(cluster: &Cluster) -> String {
    cluster
        .mirrors()
        .iter()
        .filter(|seg| !seg.is_standby())
        .map(|seg| {
            format!(
                "{}|{}|{}|{}\n",
                seg.content_id,
                seg.hostname,
                seg.port,
                seg.data_dir.display()
            )
        })
        .collect()
}
