//! sqlx connection pools for the parallel statement runner.

use clustergrade_core::statement::{PoolFactory, PoolOptions, StatementError, StatementPool};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::connect_options;

/// Opens one [`PgStatementPool`] per runner invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgPoolFactory;

impl PgPoolFactory {
    pub fn new() -> Self {
        Self
    }
}

/// A pool of up to `jobs` connections to one database.
pub struct PgStatementPool {
    pool: PgPool,
    uri: String,
}

impl StatementPool for PgStatementPool {
    async fn execute(&self, sql: &str) -> Result<(), String> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn connection_string(&self) -> &str {
        &self.uri
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

impl PoolFactory for PgPoolFactory {
    type Pool = PgStatementPool;

    /// Open the pool and establish its first connection, so an unreachable
    /// server fails here instead of inside every worker.
    async fn open(&self, options: &PoolOptions) -> Result<PgStatementPool, StatementError> {
        let uri = options.connection_uri();
        let setup = options.session_setup();
        let max_connections = u32::try_from(options.jobs.max(1)).unwrap_or(u32::MAX);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    for statement in &setup {
                        sqlx::raw_sql(statement).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options(options))
            .await
            .map_err(|e| StatementError::Connect {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(uri = %uri, jobs = max_connections, "opened statement pool");
        Ok(PgStatementPool { pool, uri })
    }
}
