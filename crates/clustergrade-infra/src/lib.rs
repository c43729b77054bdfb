//! Infrastructure layer for clustergrade.
//!
//! Contains implementations of the port traits defined in `clustergrade-core`:
//! JSON status and config files in the state directory, the HTTP agent
//! client, sqlx Postgres pools and catalog queries, and a tokio process
//! launcher. Also resolves the state and log directories.

pub mod agent_http;
pub mod config_file;
pub mod paths;
pub mod postgres;
pub mod process;
pub mod state;
