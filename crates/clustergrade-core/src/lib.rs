//! Upgrade workflow engine and port trait definitions for clustergrade.
//!
//! This crate defines the "ports" (status store, agent client, statement
//! executor, process launcher, catalog reader, confirmation gate) that the
//! infrastructure layer implements, plus everything that runs on top of
//! them: the step/substep engine, the fan-out executor, the parallel
//! statement runner and the upgrade steps themselves. It depends only on
//! `clustergrade-types` -- never on `clustergrade-infra` or any database/IO
//! crate.

pub mod agent;
pub mod catalog;
pub mod event;
pub mod hub;
pub mod process;
pub mod statement;
pub mod workflow;
