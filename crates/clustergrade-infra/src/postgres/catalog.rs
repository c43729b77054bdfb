//! Catalog queries against a running coordinator.
//!
//! Implements `ClusterCatalogReader` from `clustergrade-core` with sqlx.
//! Every call except the readiness check opens a single utility-mode
//! connection, so the reader works while only the coordinator is up. Queries that changed shape between
//! releases pick their text by the server's major version.

use clustergrade_core::catalog::{ActiveConnection, CatalogError, ClusterCatalogReader};
use clustergrade_core::statement::PoolOptions;
use clustergrade_types::cluster::{Cluster, Role, SegConfig, TablespaceInfo, Tablespaces};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Connection, Row};

use super::connect_options;

const CATALOG_DATABASE: &str = "template1";

/// Reads the catalog of the cluster whose coordinator listens on a port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgCatalogReader;

impl PgCatalogReader {
    pub fn new() -> Self {
        Self
    }

    async fn connect(
        &self,
        port: u16,
        major: u64,
        database: &str,
    ) -> Result<PgConnection, CatalogError> {
        let options = PoolOptions::new(port, major).database(database).utility_mode();
        PgConnection::connect_with(&connect_options(&options))
            .await
            .map_err(|e| CatalogError::Connect {
                port,
                reason: e.to_string(),
            })
    }

    async fn fetch_all(
        &self,
        what: &'static str,
        port: u16,
        major: u64,
        database: &str,
        sql: &str,
    ) -> Result<Vec<PgRow>, CatalogError> {
        let mut conn = self.connect(port, major, database).await?;
        let rows = sqlx::query(sql)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| query_error(what, port, e))?;
        close(conn).await;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Releases before 6 keep data directories in `pg_filespace_entry`.
const SEGMENTS_5X: &str = "
SELECT s.dbid::int AS dbid, s.content::int AS content, s.role::text AS role,
       s.hostname, s.port, e.fselocation AS datadir
FROM gp_segment_configuration s
JOIN pg_filespace_entry e ON s.dbid = e.fsedbid
JOIN pg_filespace f ON e.fsefsoid = f.oid
WHERE f.fsname = 'pg_system'
ORDER BY s.content, s.role";

const SEGMENTS: &str = "
SELECT dbid::int AS dbid, content::int AS content, role::text AS role,
       hostname, port, datadir
FROM gp_segment_configuration
ORDER BY content, role";

const TABLESPACES_5X: &str = "
SELECT e.fsedbid::int AS dbid, t.oid::bigint AS oid,
       CASE WHEN t.oid >= 16384 THEN e.fselocation || '/' || t.oid::text
            ELSE e.fselocation END AS location,
       t.oid >= 16384 AS user_defined
FROM pg_tablespace t
JOIN pg_filespace_entry e ON e.fsefsoid = t.spcfsoid
ORDER BY 1, 2";

const TABLESPACES: &str = "
SELECT s.dbid::int AS dbid, t.oid::bigint AS oid, l.tblspc_loc AS location,
       t.oid >= 16384 AS user_defined
FROM pg_tablespace t
CROSS JOIN LATERAL gp_tablespace_location(t.oid) l
JOIN gp_segment_configuration s ON s.content = l.gp_segment_id
WHERE t.oid >= 16384
ORDER BY 1, 2";

const DATABASES: &str = "SELECT datname FROM pg_database WHERE datname != 'template0' ORDER BY datname";

/// Releases before 6 name the backend pid column `procpid`.
const ACTIVITY_5X: &str = "
SELECT procpid AS pid, coalesce(datname::text, '') AS datname,
       coalesce(usename::text, '') AS usename, coalesce(application_name, '') AS application_name
FROM pg_stat_activity
WHERE procpid <> pg_backend_pid()";

const ACTIVITY: &str = "
SELECT pid, coalesce(datname::text, '') AS datname,
       coalesce(usename::text, '') AS usename, coalesce(application_name, '') AS application_name
FROM pg_stat_activity
WHERE pid <> pg_backend_pid() AND datname IS NOT NULL";

const INVALID_INDEXES: &str = "
SELECT 'REINDEX INDEX ' || quote_ident(n.nspname) || '.' || quote_ident(c.relname) || ';' AS command
FROM pg_catalog.pg_class c
JOIN pg_index i ON i.indexrelid = c.oid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE NOT i.indisvalid
ORDER BY 1";

/// User tables with a tsvector column, joined with any index on the table.
const TSVECTOR_COLUMNS: &str = "
SELECT quote_ident(n.nspname) AS nspname, quote_ident(c.relname) AS relname,
       quote_ident(a.attname) AS attname,
       i.indexrelid::regclass::text AS indexname,
       pg_get_indexdef(i.indexrelid) AS indexdef
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
LEFT JOIN pg_index i ON i.indrelid = c.oid
WHERE c.relkind = 'r' AND NOT a.attisdropped AND a.attinhcount = 0
  AND a.atttypid = 'pg_catalog.tsvector'::pg_catalog.regtype
  AND n.nspname !~ '^pg_temp_' AND n.nspname !~ '^pg_toast_temp_'
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
ORDER BY 1, 2, 3";

/// True once no segment is down and every mirrored content is in sync.
const SEGMENTS_READY: &str = "
SELECT NOT EXISTS (
    SELECT 1 FROM gp_segment_configuration s
    WHERE s.status <> 'u'
       OR (s.content <> -1 AND s.role = 'p' AND s.mode <> 's' AND EXISTS (
            SELECT 1 FROM gp_segment_configuration m
            WHERE m.content = s.content AND m.role = 'm'))
) AS ready";

const UPDATE_SEGMENT: &str = "
UPDATE gp_segment_configuration
SET hostname = $2, address = $2, port = $3, datadir = $4
WHERE dbid = $1";

const INSERT_SEGMENT: &str = r#"
INSERT INTO gp_segment_configuration
    (dbid, content, role, preferred_role, mode, status, port, hostname, address, datadir)
VALUES ($1, $2, $3::text::"char", $3::text::"char", $4::text::"char", 'u', $5, $6, $6, $7)"#;

fn segments_query(major: u64) -> &'static str {
    if major < 6 { SEGMENTS_5X } else { SEGMENTS }
}

fn tablespaces_query(major: u64) -> &'static str {
    if major < 6 { TABLESPACES_5X } else { TABLESPACES }
}

fn activity_query(major: u64) -> &'static str {
    if major < 6 { ACTIVITY_5X } else { ACTIVITY }
}

// ---------------------------------------------------------------------------
// Private Row types for catalog-to-domain mapping
// ---------------------------------------------------------------------------

struct SegmentRow {
    dbid: i32,
    content: i32,
    role: String,
    hostname: String,
    port: i32,
    datadir: String,
}

impl SegmentRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            dbid: row.try_get("dbid")?,
            content: row.try_get("content")?,
            role: row.try_get("role")?,
            hostname: row.try_get("hostname")?,
            port: row.try_get("port")?,
            datadir: row.try_get("datadir")?,
        })
    }

    fn into_seg_config(self) -> Result<SegConfig, CatalogError> {
        let port = u16::try_from(self.port).map_err(|_| CatalogError::Query {
            what: "segments",
            port: 0,
            reason: format!("dbid {} has invalid port {}", self.dbid, self.port),
        })?;
        Ok(SegConfig {
            dbid: self.dbid,
            content_id: self.content,
            role: Role::from_code(&self.role)?,
            hostname: self.hostname,
            port,
            data_dir: self.datadir.into(),
        })
    }
}

struct TablespaceRow {
    dbid: i32,
    oid: i64,
    location: String,
    user_defined: bool,
}

impl TablespaceRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            dbid: row.try_get("dbid")?,
            oid: row.try_get("oid")?,
            location: row.try_get("location")?,
            user_defined: row.try_get("user_defined")?,
        })
    }
}

struct ActivityRow {
    pid: i32,
    datname: String,
    usename: String,
    application_name: String,
}

impl ActivityRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pid: row.try_get("pid")?,
            datname: row.try_get("datname")?,
            usename: row.try_get("usename")?,
            application_name: row.try_get("application_name")?,
        })
    }

    fn into_connection(self) -> ActiveConnection {
        ActiveConnection {
            pid: self.pid,
            database: self.datname,
            user: self.usename,
            application: self.application_name,
        }
    }
}

struct TsvectorRow {
    schema: String,
    table: String,
    column: String,
    index_name: Option<String>,
    index_def: Option<String>,
}

impl TsvectorRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            schema: row.try_get("nspname")?,
            table: row.try_get("relname")?,
            column: row.try_get("attname")?,
            index_name: row.try_get("indexname")?,
            index_def: row.try_get("indexdef")?,
        })
    }

    /// Drops the table's index around the column rewrite and recreates it
    /// from its definition.
    fn into_command(self) -> String {
        let mut command = String::new();
        if let Some(index) = &self.index_name {
            command.push_str(&format!("DROP INDEX {index};\n"));
        }
        command.push_str(&format!(
            "ALTER TABLE {schema}.{table}\nALTER COLUMN {column} TYPE pg_catalog.tsvector USING {column}::pg_catalog.text::pg_catalog.tsvector;\n",
            schema = self.schema,
            table = self.table,
            column = self.column,
        ));
        if let Some(def) = &self.index_def {
            command.push_str(&format!("{def};\n"));
        }
        command
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(what: &'static str, port: u16, err: sqlx::Error) -> CatalogError {
    CatalogError::Query {
        what,
        port,
        reason: err.to_string(),
    }
}

async fn close(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        tracing::debug!("closing catalog connection: {err}");
    }
}

fn scan<T>(
    rows: &[PgRow],
    what: &'static str,
    port: u16,
    from_row: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, CatalogError> {
    rows.iter()
        .map(|row| from_row(row).map_err(|e| query_error(what, port, e)))
        .collect()
}

fn collect_tablespaces(rows: Vec<TablespaceRow>) -> Result<Tablespaces, CatalogError> {
    let mut tablespaces = Tablespaces::new();
    for row in rows {
        let oid = u32::try_from(row.oid).map_err(|_| CatalogError::Query {
            what: "tablespaces",
            port: 0,
            reason: format!("invalid tablespace oid {}", row.oid),
        })?;
        tablespaces.entry(row.dbid).or_default().insert(
            oid,
            TablespaceInfo {
                location: row.location.into(),
                user_defined: row.user_defined,
            },
        );
    }
    Ok(tablespaces)
}

/// `'s'` (synchronized) for segments with a mirror, `'n'` otherwise.
fn segment_mode(target: &Cluster, seg: &SegConfig) -> &'static str {
    if seg.content_id >= 0 && target.mirrors().contains(seg.content_id) {
        "s"
    } else {
        "n"
    }
}

fn role_code(role: Role) -> &'static str {
    match role {
        Role::Primary => "p",
        Role::Mirror => "m",
    }
}

fn small(value: i32, what: &str) -> Result<i16, CatalogError> {
    i16::try_from(value).map_err(|_| CatalogError::Query {
        what: "segment configuration update",
        port: 0,
        reason: format!("{what} {value} out of range"),
    })
}

// ---------------------------------------------------------------------------
// ClusterCatalogReader implementation
// ---------------------------------------------------------------------------

impl ClusterCatalogReader for PgCatalogReader {
    async fn segments(&self, port: u16, major: u64) -> Result<Vec<SegConfig>, CatalogError> {
        let rows = self
            .fetch_all("segments", port, major, CATALOG_DATABASE, segments_query(major))
            .await?;
        scan(&rows, "segments", port, SegmentRow::from_row)?
            .into_iter()
            .map(SegmentRow::into_seg_config)
            .collect()
    }

    async fn tablespaces(&self, port: u16, major: u64) -> Result<Tablespaces, CatalogError> {
        let rows = self
            .fetch_all("tablespaces", port, major, CATALOG_DATABASE, tablespaces_query(major))
            .await?;
        collect_tablespaces(scan(&rows, "tablespaces", port, TablespaceRow::from_row)?)
    }

    async fn databases(&self, port: u16, major: u64) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .fetch_all("databases", port, major, CATALOG_DATABASE, DATABASES)
            .await?;
        scan(&rows, "databases", port, |row: &PgRow| row.try_get::<String, _>("datname"))
    }

    async fn active_connections(
        &self,
        port: u16,
        major: u64,
    ) -> Result<Vec<ActiveConnection>, CatalogError> {
        let rows = self
            .fetch_all("active connections", port, major, "postgres", activity_query(major))
            .await?;
        Ok(scan(&rows, "active connections", port, ActivityRow::from_row)?
            .into_iter()
            .map(ActivityRow::into_connection)
            .collect())
    }

    async fn invalid_index_commands(
        &self,
        port: u16,
        major: u64,
        database: &str,
    ) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .fetch_all("invalid indexes", port, major, database, INVALID_INDEXES)
            .await?;
        scan(&rows, "invalid indexes", port, |row: &PgRow| {
            row.try_get::<String, _>("command")
        })
    }

    async fn tsvector_commands(
        &self,
        port: u16,
        major: u64,
        database: &str,
    ) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .fetch_all("tsvector columns", port, major, database, TSVECTOR_COLUMNS)
            .await?;
        Ok(scan(&rows, "tsvector columns", port, TsvectorRow::from_row)?
            .into_iter()
            .map(TsvectorRow::into_command)
            .collect())
    }

    /// Runs in normal mode: utility mode only sees the coordinator.
    async fn segments_ready(&self, port: u16, major: u64) -> Result<bool, CatalogError> {
        let options = PoolOptions::new(port, major).database(CATALOG_DATABASE);
        let mut conn = PgConnection::connect_with(&connect_options(&options))
            .await
            .map_err(|e| CatalogError::Connect {
                port,
                reason: e.to_string(),
            })?;
        let ready: bool = sqlx::query_scalar(SEGMENTS_READY)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| query_error("segment readiness", port, e))?;
        close(conn).await;
        Ok(ready)
    }

    /// Update each dbid's host, port and data directory in place, inserting
    /// rows for segments the catalog does not know yet. Runs in one
    /// transaction.
    async fn update_segment_configuration(
        &self,
        port: u16,
        major: u64,
        target: &Cluster,
    ) -> Result<(), CatalogError> {
        const WHAT: &str = "segment configuration update";
        let mut conn = self.connect(port, major, CATALOG_DATABASE).await?;
        let system_table_mods = PoolOptions::new(port, major)
            .allow_system_table_mods()
            .session_setup();

        let mut tx = conn.begin().await.map_err(|e| query_error(WHAT, port, e))?;
        for statement in &system_table_mods {
            sqlx::raw_sql(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error(WHAT, port, e))?;
        }

        for seg in target.primaries().iter().chain(target.mirrors().iter()) {
            let data_dir = seg.data_dir.display().to_string();
            let updated = sqlx::query(UPDATE_SEGMENT)
                .bind(small(seg.dbid, "dbid")?)
                .bind(&seg.hostname)
                .bind(i32::from(seg.port))
                .bind(&data_dir)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error(WHAT, port, e))?;

            if updated.rows_affected() == 0 {
                sqlx::query(INSERT_SEGMENT)
                    .bind(small(seg.dbid, "dbid")?)
                    .bind(small(seg.content_id, "content id")?)
                    .bind(role_code(seg.role))
                    .bind(segment_mode(target, seg))
                    .bind(i32::from(seg.port))
                    .bind(&seg.hostname)
                    .bind(&data_dir)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| query_error(WHAT, port, e))?;
                tracing::info!(dbid = seg.dbid, host = %seg.hostname, "inserted segment configuration");
            }
        }

        tx.commit().await.map_err(|e| query_error(WHAT, port, e))?;
        close(conn).await;
        tracing::info!(port, segments = target.primaries().len() + target.mirrors().len(), "updated segment configuration");
        Ok(())
    }
}
