//! `clustergrade apply`: run one phase's data migration scripts outside a
//! step.

use std::path::Path;

use anyhow::Context;
use clustergrade_core::event::bus::EventBus;
use clustergrade_core::hub::scripts::{apply_data_migration_scripts, phase_dir};
use clustergrade_core::process::UpgradeToolRunner;
use clustergrade_infra::postgres::PgPoolFactory;
use clustergrade_infra::process::TokioProcessLauncher;
use clustergrade_types::config::DEFAULT_JOBS;
use console::style;

use super::render::Renderer;
use crate::state::AppState;

pub async fn apply(
    state: &AppState,
    gphome: &Path,
    port: u16,
    input_dir: &Path,
    phase: &str,
    jobs: Option<u32>,
) -> anyhow::Result<()> {
    let tools = UpgradeToolRunner::new(TokioProcessLauncher::new(), &state.log_dir);
    let version = tools
        .version(gphome)
        .await
        .with_context(|| format!("determining the version of {}", gphome.display()))?;

    let dir = phase_dir(input_dir, phase);
    let jobs = jobs.unwrap_or(DEFAULT_JOBS).max(1) as usize;
    tracing::info!(dir = %dir.display(), port, %version, jobs, "applying data migration scripts");

    let bus = EventBus::new(256);
    let renderer = Renderer::spawn(&bus, state.verbose > 0);
    let applied =
        apply_data_migration_scripts(&PgPoolFactory::new(), &dir, port, version.major, jobs, Some(&bus)).await;
    renderer.finish().await;
    let applied = applied?;

    if applied == 0 {
        println!("  No {phase} scripts found in {}.", dir.display());
    } else {
        println!(
            "  {} Applied {applied} {phase} script(s) from {}.",
            style("✓").green(),
            dir.display()
        );
    }
    Ok(())
}
