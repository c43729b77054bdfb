//! Cluster catalog port.
//!
//! Everything the hub asks a running cluster over SQL: its segment
//! configuration, tablespaces, databases, sessions and the tables that need
//! rebuilding after an upgrade. The
//! infrastructure crate implements this with sqlx against the coordinator in
//! utility mode.

use std::fmt;
use std::time::Duration;

use clustergrade_types::cluster::{Cluster, Destination, SegConfig, Tablespaces};
use clustergrade_types::error::ClusterError;

/// Errors from catalog queries.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("connecting to port {port}: {reason}")]
    Connect { port: u16, reason: String },

    #[error("querying {what} on port {port}: {reason}")]
    Query {
        what: &'static str,
        port: u16,
        reason: String,
    },

    #[error("segments of the cluster on port {port} not ready after {waited:?}: {reason}")]
    NotReady {
        port: u16,
        waited: Duration,
        reason: String,
    },

    #[error(transparent)]
    Topology(#[from] ClusterError),
}

/// How long finalize waits for segments to come up and synchronize.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One client session found in `pg_stat_activity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub pid: i32,
    pub database: String,
    pub user: String,
    pub application: String,
}

impl fmt::Display for ActiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} user {:?} database {:?} application {:?}",
            self.pid, self.user, self.database, self.application
        )
    }
}

/// Reads and patches the catalog of a running cluster.
///
/// `major` is the server's major version; queries differ between releases.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ClusterCatalogReader: Send + Sync {
    /// Rows of `gp_segment_configuration`.
    fn segments(
        &self,
        port: u16,
        major: u64,
    ) -> impl std::future::Future<Output = Result<Vec<SegConfig>, CatalogError>> + Send;

    /// Tablespace locations per segment dbid.
    fn tablespaces(
        &self,
        port: u16,
        major: u64,
    ) -> impl std::future::Future<Output = Result<Tablespaces, CatalogError>> + Send;

    /// Every database except `template0`.
    fn databases(
        &self,
        port: u16,
        major: u64,
    ) -> impl std::future::Future<Output = Result<Vec<String>, CatalogError>> + Send;

    /// Client sessions other than the one running the query.
    fn active_connections(
        &self,
        port: u16,
        major: u64,
    ) -> impl std::future::Future<Output = Result<Vec<ActiveConnection>, CatalogError>> + Send;

    /// `REINDEX INDEX ...` statements for every invalid index in `database`.
    fn invalid_index_commands(
        &self,
        port: u16,
        major: u64,
        database: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, CatalogError>> + Send;

    /// `ALTER TABLE ... TYPE pg_catalog.tsvector` statements, wrapped in a
    /// drop and recreate of the table's index, for every user table in
    /// `database` with a tsvector column.
    fn tsvector_commands(
        &self,
        port: u16,
        major: u64,
        database: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, CatalogError>> + Send;

    /// Whether every segment is up and every mirrored segment is
    /// synchronized.
    fn segments_ready(
        &self,
        port: u16,
        major: u64,
    ) -> impl std::future::Future<Output = Result<bool, CatalogError>> + Send;

    /// Rewrite `gp_segment_configuration` on the coordinator at `port` so
    /// each dbid points at the port and data directory it has in `target`.
    fn update_segment_configuration(
        &self,
        port: u16,
        major: u64,
        target: &Cluster,
    ) -> impl std::future::Future<Output = Result<(), CatalogError>> + Send;
}

/// Build a [`Cluster`] from the live catalog of the cluster on `port`.
pub async fn load_cluster<C: ClusterCatalogReader>(
    catalog: &C,
    destination: Destination,
    gphome: &std::path::Path,
    version: semver::Version,
    port: u16,
) -> Result<Cluster, CatalogError> {
    let major = version.major;
    let segments = catalog.segments(port, major).await?;
    let tablespaces = catalog.tablespaces(port, major).await?;

    tracing::info!(
        destination = %destination,
        port,
        segments = segments.len(),
        "loaded cluster topology"
    );

    Ok(Cluster::new(destination, segments, gphome, version)?.with_tablespaces(tablespaces))
}

/// Poll [`ClusterCatalogReader::segments_ready`] until it answers true.
///
/// Query errors count as "not ready yet"; the last one is reported if the
/// timeout expires.
pub async fn wait_for_segments<C: ClusterCatalogReader>(
    catalog: &C,
    port: u16,
    major: u64,
    timeout: Duration,
    interval: Duration,
) -> Result<(), CatalogError> {
    let started = tokio::time::Instant::now();
    let mut reason = String::from("segments are down or not synchronized");
    loop {
        match catalog.segments_ready(port, major).await {
            Ok(true) => {
                tracing::info!(port, waited = ?started.elapsed(), "cluster segments ready");
                return Ok(());
            }
            Ok(false) => reason = String::from("segments are down or not synchronized"),
            Err(err) => {
                tracing::debug!(port, "segment readiness query failed: {err}");
                reason = err.to_string();
            }
        }

        if started.elapsed() + interval > timeout {
            return Err(CatalogError::NotReady {
                port,
                waited: started.elapsed(),
                reason,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use clustergrade_types::cluster::{Role, TablespaceInfo};

    use super::*;

    /// Serves canned catalog answers and records catalog updates.
    #[derive(Default)]
    pub struct MockCatalog {
        pub segments: Vec<SegConfig>,
        pub tablespaces: Tablespaces,
        pub databases: Vec<String>,
        pub active: Vec<ActiveConnection>,
        pub invalid_indexes: Vec<String>,
        pub tsvector: Vec<String>,
        /// Polls answered "not ready" before the segments report ready.
        pub unready_polls: AtomicUsize,
        pub ready_checks: Mutex<Vec<u16>>,
        pub updated: Mutex<Vec<(u16, Cluster)>>,
    }

    impl ClusterCatalogReader for MockCatalog {
        async fn segments(&self, _port: u16, _major: u64) -> Result<Vec<SegConfig>, CatalogError> {
            Ok(self.segments.clone())
        }

        async fn tablespaces(&self, _port: u16, _major: u64) -> Result<Tablespaces, CatalogError> {
            Ok(self.tablespaces.clone())
        }

        async fn databases(&self, _port: u16, _major: u64) -> Result<Vec<String>, CatalogError> {
            Ok(self.databases.clone())
        }

        async fn active_connections(
            &self,
            _port: u16,
            _major: u64,
        ) -> Result<Vec<ActiveConnection>, CatalogError> {
            Ok(self.active.clone())
        }

        async fn invalid_index_commands(
            &self,
            _port: u16,
            _major: u64,
            _database: &str,
        ) -> Result<Vec<String>, CatalogError> {
            Ok(self.invalid_indexes.clone())
        }

        async fn tsvector_commands(
            &self,
            _port: u16,
            _major: u64,
            _database: &str,
        ) -> Result<Vec<String>, CatalogError> {
            Ok(self.tsvector.clone())
        }

        async fn segments_ready(&self, port: u16, _major: u64) -> Result<bool, CatalogError> {
            self.ready_checks.lock().unwrap().push(port);
            let remaining = self.unready_polls.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(true);
            }
            self.unready_polls.store(remaining - 1, Ordering::SeqCst);
            Ok(false)
        }

        async fn update_segment_configuration(
            &self,
            port: u16,
            _major: u64,
            target: &Cluster,
        ) -> Result<(), CatalogError> {
            self.updated.lock().unwrap().push((port, target.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_cluster_combines_segments_and_tablespaces() {
        let mut tablespaces = Tablespaces::new();
        tablespaces.entry(1).or_default().insert(
            16384,
            TablespaceInfo {
                location: PathBuf::from("/tmp/ts/1"),
                user_defined: true,
            },
        );
        let catalog = MockCatalog {
            segments: vec![SegConfig {
                dbid: 1,
                content_id: -1,
                role: Role::Primary,
                hostname: "cdw".into(),
                port: 5432,
                data_dir: "/data/qddir/gpseg-1".into(),
            }],
            tablespaces,
            ..Default::default()
        };

        let cluster = load_cluster(
            &catalog,
            Destination::Source,
            std::path::Path::new("/usr/local/gpdb6"),
            semver::Version::new(6, 25, 0),
            5432,
        )
        .await
        .unwrap();

        assert_eq!(cluster.coordinator_port(), 5432);
        assert_eq!(cluster.segment_tablespaces(1).len(), 1);
    }

    #[tokio::test]
    async fn load_cluster_rejects_invalid_topology() {
        let catalog = MockCatalog::default();
        let err = load_cluster(
            &catalog,
            Destination::Source,
            std::path::Path::new("/gphome"),
            semver::Version::new(6, 0, 0),
            5432,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Topology(ClusterError::MissingCoordinator)
        ));
    }

    #[tokio::test]
    async fn wait_for_segments_polls_until_ready() {
        let catalog = MockCatalog {
            unready_polls: AtomicUsize::new(2),
            ..Default::default()
        };
        wait_for_segments(
            &catalog,
            6432,
            7,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(*catalog.ready_checks.lock().unwrap(), vec![6432, 6432, 6432]);
    }

    #[tokio::test]
    async fn wait_for_segments_gives_up_after_timeout() {
        let catalog = MockCatalog {
            unready_polls: AtomicUsize::new(usize::MAX),
            ..Default::default()
        };
        let err = wait_for_segments(
            &catalog,
            6432,
            7,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CatalogError::NotReady { port: 6432, .. }));
        assert!(err.to_string().contains("not synchronized"));
        assert!(!catalog.ready_checks.lock().unwrap().is_empty());
    }

    #[test]
    fn active_connection_display() {
        let conn = ActiveConnection {
            pid: 42,
            database: "postgres".into(),
            user: "gpadmin".into(),
            application: "psql".into(),
        };
        assert_eq!(
            conn.to_string(),
            "pid 42 user \"gpadmin\" database \"postgres\" application \"psql\""
        );
    }
}
