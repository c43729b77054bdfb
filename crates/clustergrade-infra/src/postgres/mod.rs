//! Postgres adapters built on sqlx.
//!
//! - [`pool`]: `PoolFactory` for the parallel statement runner
//! - [`catalog`]: `ClusterCatalogReader` over the coordinator's catalog

pub mod catalog;
pub mod pool;

pub use catalog::PgCatalogReader;
pub use pool::{PgPoolFactory, PgStatementPool};

use clustergrade_core::statement::PoolOptions;
use sqlx::postgres::PgConnectOptions;

/// Connect options for a local server. Sessions use an empty search path,
/// and utility mode when `options` asks for it.
pub fn connect_options(options: &PoolOptions) -> PgConnectOptions {
    let mut params = vec![("search_path", "")];
    if let Some(utility) = options.utility_parameter() {
        params.push(utility);
    }
    PgConnectOptions::new()
        .host("localhost")
        .port(options.port)
        .database(&options.database)
        .options(params)
}
