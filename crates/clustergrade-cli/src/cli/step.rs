//! `initialize`, `execute`, `finalize` and `revert`.

use clustergrade_core::hub::HubOptions;
use clustergrade_core::workflow::Completion;
use clustergrade_types::step::Step;
use console::style;

use super::InitializeArgs;
use super::render::Renderer;
use crate::state::{AppState, Hub};

/// Run `step` on `hub` while rendering its progress, then print the outcome.
async fn run_rendered<F, Fut>(state: &AppState, hub: &Hub, step: Step, body: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Completion>>,
{
    let renderer = Renderer::spawn(hub.events(), state.verbose > 0);
    let result = body().await;
    renderer.finish().await;

    match result? {
        Completion::Finished(summary) => {
            println!();
            println!("{summary}");
            println!();
        }
        Completion::Quit => {
            println!();
            println!("  {} {} stopped before completing.", style("!").yellow(), step);
        }
    }
    Ok(())
}

pub async fn initialize(
    state: &AppState,
    args: InitializeArgs,
    jobs: Option<u32>,
) -> anyhow::Result<()> {
    let id = state.initialize_id().await?;
    let request = args.into_request(id, jobs).await?;
    let hub = state.hub(state.store().with_upgrade_id(id), HubOptions::default())?;

    tracing::info!(upgrade_id = %id, "initialize");
    run_rendered(state, &hub, Step::Initialize, || hub.initialize(&request)).await
}

pub async fn execute(state: &AppState, options: HubOptions) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), options)?;
    run_rendered(state, &hub, Step::Execute, || hub.execute()).await
}

pub async fn finalize(state: &AppState) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), HubOptions::default())?;
    run_rendered(state, &hub, Step::Finalize, || hub.finalize()).await
}

pub async fn revert(state: &AppState) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), HubOptions::default())?;
    run_rendered(state, &hub, Step::Revert, || hub.revert()).await
}

/// `kill-services`: ask every agent to exit.
pub async fn kill_services(state: &AppState) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), HubOptions::default())?;
    hub.stop_agents().await?;
    println!("  {} Stopped the agents.", style("✓").green());
    Ok(())
}
