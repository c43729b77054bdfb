//! Parallel SQL statement execution.
//!
//! - [`Statement`]: one SQL statement plus how it must be grouped
//! - [`script`]: parser for index data migration scripts
//! - [`runner`]: bounded worker pool that applies grouped statements
//!
//! The pool itself is a port ([`StatementPool`] / [`PoolFactory`]); the
//! infrastructure crate provides a Postgres implementation.

pub mod runner;
pub mod script;

use std::fmt;

pub use runner::execute_statements;
pub use script::IndexScript;

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// An index statement from a data migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatement {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub definition: String,
}

impl IndexStatement {
    /// Schema-qualified index name.
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A statement for the parallel runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Grouped with every other index statement on the same owning table, so
    /// statements that lock the table never run concurrently.
    Index(IndexStatement),
    /// Independent statement; forms a group of its own.
    Command(String),
}

impl Statement {
    pub fn sql(&self) -> &str {
        match self {
            Statement::Index(index) => &index.definition,
            Statement::Command(sql) => sql,
        }
    }

    /// Statements sharing a key run sequentially on one worker. `None`
    /// means the statement is its own group.
    pub fn group_key(&self) -> Option<&str> {
        match self {
            Statement::Index(index) => Some(&index.table),
            Statement::Command(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pool options
// ---------------------------------------------------------------------------

/// Connection settings for a statement pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub port: u16,
    /// Major version of the server; connection parameters differ between
    /// releases.
    pub major: u64,
    pub database: String,
    pub utility_mode: bool,
    pub allow_system_table_mods: bool,
    /// Extra `SET ...` statements run on every new connection.
    pub gucs: Vec<String>,
    /// Upper bound on concurrent workers and connections.
    pub jobs: usize,
}

pub const DEFAULT_DATABASE: &str = "template1";

impl PoolOptions {
    pub fn new(port: u16, major: u64) -> Self {
        Self {
            port,
            major,
            database: DEFAULT_DATABASE.to_string(),
            utility_mode: false,
            allow_system_table_mods: false,
            gucs: Vec::new(),
            jobs: 1,
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn utility_mode(mut self) -> Self {
        self.utility_mode = true;
        self
    }

    pub fn allow_system_table_mods(mut self) -> Self {
        self.allow_system_table_mods = true;
        self
    }

    pub fn gucs(mut self, gucs: Vec<String>) -> Self {
        self.gucs = gucs;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Server parameter that puts a session in utility mode, if requested.
    /// Releases before 7 call it `gp_session_role`.
    pub fn utility_parameter(&self) -> Option<(&'static str, &'static str)> {
        if !self.utility_mode {
            return None;
        }
        Some(if self.major < 7 {
            ("gp_session_role", "utility")
        } else {
            ("gp_role", "utility")
        })
    }

    /// Connection URI for the server.
    pub fn connection_uri(&self) -> String {
        let mut uri = format!(
            "postgresql://localhost:{}/{}?search_path=",
            self.port, self.database
        );
        if let Some((name, value)) = self.utility_parameter() {
            uri.push_str(&format!("&{name}={value}"));
        }
        uri
    }

    /// Statements to run on each new connection.
    pub fn session_setup(&self) -> Vec<String> {
        let mut setup = Vec::new();
        if self.allow_system_table_mods {
            setup.push(if self.major < 6 {
                "SET allow_system_table_mods=dml".to_string()
            } else {
                "SET allow_system_table_mods=on".to_string()
            });
        }
        setup.extend(self.gucs.iter().cloned());
        setup
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// A pool of database connections private to one runner invocation.
pub trait StatementPool: Send + Sync + 'static {
    /// Execute one statement on any idle connection.
    fn execute(&self, sql: &str) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Connection string, quoted in error messages.
    fn connection_string(&self) -> &str;

    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Opens [`StatementPool`]s.
pub trait PoolFactory: Send + Sync {
    type Pool: StatementPool;

    /// Open a pool with room for `options.jobs` connections.
    fn open(
        &self,
        options: &PoolOptions,
    ) -> impl std::future::Future<Output = Result<Self::Pool, StatementError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// One statement that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    pub connection: String,
    pub statement: String,
    pub message: String,
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "URI: {}: executing statement {:?}: {}",
            self.connection, self.statement, self.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatementError {
    #[error("connecting to {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("{}", render_failures(.0))]
    Failed(Vec<StatementFailure>),

    #[error("{path}: {reason}")]
    Script { path: String, reason: String },

    #[error("statement worker stopped: {0}")]
    Worker(String),
}

fn render_failures(failures: &[StatementFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_statements_group_by_table() {
        let index = Statement::Index(IndexStatement {
            schema: "public".into(),
            table: "orders".into(),
            name: "orders_idx".into(),
            definition: "CREATE INDEX orders_idx ON public.orders (id);".into(),
        });
        assert_eq!(index.group_key(), Some("orders"));
        assert_eq!(index.sql(), "CREATE INDEX orders_idx ON public.orders (id);");

        let command = Statement::Command("ANALYZE;".into());
        assert_eq!(command.group_key(), None);
    }

    #[test]
    fn connection_uri_by_version() {
        let opts = PoolOptions::new(5432, 6).database("postgres").utility_mode();
        assert_eq!(
            opts.connection_uri(),
            "postgresql://localhost:5432/postgres?search_path=&gp_session_role=utility"
        );
        let opts = PoolOptions::new(5432, 7).database("postgres").utility_mode();
        assert_eq!(
            opts.connection_uri(),
            "postgresql://localhost:5432/postgres?search_path=&gp_role=utility"
        );
        assert_eq!(
            PoolOptions::new(15432, 6).connection_uri(),
            "postgresql://localhost:15432/template1?search_path="
        );
    }

    #[test]
    fn session_setup_includes_system_table_mods_and_gucs() {
        let opts = PoolOptions::new(5432, 5)
            .allow_system_table_mods()
            .gucs(vec!["SET search_path TO public".into()]);
        assert_eq!(
            opts.session_setup(),
            vec!["SET allow_system_table_mods=dml", "SET search_path TO public"]
        );
        let opts = PoolOptions::new(5432, 6).allow_system_table_mods();
        assert_eq!(opts.session_setup()[0], "SET allow_system_table_mods=on");
    }

    #[test]
    fn jobs_is_at_least_one() {
        assert_eq!(PoolOptions::new(1, 7).jobs(0).jobs, 1);
    }

    #[test]
    fn failures_render_connection_and_statement() {
        let err = StatementError::Failed(vec![StatementFailure {
            connection: "postgresql://localhost:5432/db".into(),
            statement: "DROP INDEX i;".into(),
            message: "index \"i\" does not exist".into(),
        }]);
        assert_eq!(
            err.to_string(),
            "URI: postgresql://localhost:5432/db: executing statement \"DROP INDEX i;\": index \"i\" does not exist"
        );
    }
}
