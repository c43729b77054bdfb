//! Shared domain types for clustergrade.
//!
//! This crate contains the domain types used across the upgrade tooling:
//! cluster topology, database versions, upgrade steps and their statuses,
//! the persisted upgrade configuration, agent requests, and error types.
//!
//! Zero infrastructure dependencies -- only serde, semver, uuid, chrono,
//! thiserror, bincode, regex.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod disk;
pub mod error;
pub mod event;
pub mod step;
pub mod version;
