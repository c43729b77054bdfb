//! Parser for index data migration scripts.
//!
//! ```text
//! \c mydb
//! -- TYPE: INDEX, SCHEMA: public, TABLE: orders, NAME: orders_idx
//! CREATE INDEX orders_idx ON public.orders USING btree (id);
//! ```

use std::path::Path;

use super::{IndexStatement, PoolFactory, PoolOptions, Statement, StatementError, execute_statements};
use crate::event::bus::EventBus;

const INDEX_HEADER: &str = "-- TYPE: INDEX, ";

/// Parsed contents of one index script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexScript {
    pub database: String,
    pub statements: Vec<IndexStatement>,
}

impl IndexScript {
    /// Parse script text. `source` names the script in error messages.
    pub fn parse(contents: &str, source: &str) -> Result<Self, StatementError> {
        let script_err = |reason: String| StatementError::Script {
            path: source.to_string(),
            reason,
        };

        let database = contents
            .lines()
            .find_map(|line| line.strip_prefix("\\c"))
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty())
            .ok_or_else(|| script_err("unable to parse database from script".to_string()))?;

        let separator = format!("\n{INDEX_HEADER}");
        let mut parts = contents.split(separator.as_str());
        parts.next();

        let statements = parts
            .map(|part| parse_statement(&format!("{INDEX_HEADER}{part}")).map_err(script_err))
            .collect::<Result<Vec<_>, _>>()?;

        if statements.is_empty() {
            return Err(script_err("no index statements found".to_string()));
        }

        Ok(Self {
            database,
            statements,
        })
    }

    /// Read and parse a script file.
    pub async fn read(path: &Path) -> Result<Self, StatementError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StatementError::Script {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Apply the script's statements against its database on `port`, grouped
    /// by owning table with at most `jobs` tables in flight.
    pub async fn apply<F: PoolFactory>(
        &self,
        factory: &F,
        port: u16,
        major: u64,
        jobs: usize,
        bus: Option<&EventBus>,
    ) -> Result<(), StatementError> {
        let options = PoolOptions::new(port, major).database(&self.database).jobs(jobs);
        let statements = self
            .statements
            .iter()
            .cloned()
            .map(Statement::Index)
            .collect();
        execute_statements(factory, &options, statements, bus).await
    }
}

fn parse_statement(text: &str) -> Result<IndexStatement, String> {
    let invalid = || "failed to parse index statement: invalid header".to_string();

    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    if !header.starts_with("-- TYPE: INDEX") {
        return Err(invalid());
    }

    let fields: Vec<&str> = header.split(", ").collect();
    let [_, schema, table, name] = fields.as_slice() else {
        return Err(invalid());
    };

    let statement = IndexStatement {
        schema: schema.trim_start_matches("SCHEMA: ").trim().to_string(),
        table: table.trim_start_matches("TABLE: ").trim().to_string(),
        name: name.trim_start_matches("NAME: ").trim().to_string(),
        definition: lines.next().unwrap_or_default().trim().to_string(),
    };

    if statement.schema.is_empty()
        || statement.table.is_empty()
        || statement.name.is_empty()
        || statement.definition.is_empty()
    {
        return Err("failed to parse index statement: missing required fields".to_string());
    }

    Ok(statement)
}
