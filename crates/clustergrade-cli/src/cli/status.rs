//! `clustergrade status`: the persisted substep statuses as a table.

use std::collections::BTreeMap;

use clustergrade_core::hub::HubOptions;
use clustergrade_types::step::{Step, SubstepStatus, SubstepStatuses};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

fn status_color(status: SubstepStatus) -> Color {
    match status {
        SubstepStatus::Complete => Color::Green,
        SubstepStatus::Failed => Color::Red,
        SubstepStatus::Running => Color::Yellow,
        SubstepStatus::Skipped | SubstepStatus::Pending => Color::DarkGrey,
    }
}

/// One row per substep of every step, in execution order. Substeps with no
/// recorded status show as pending.
pub fn status_table(statuses: &[(Step, SubstepStatuses)]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Step").fg(Color::White),
        Cell::new("Substep").fg(Color::White),
        Cell::new("Status").fg(Color::White),
    ]);

    for (step, recorded) in statuses {
        if recorded.is_empty() {
            continue;
        }
        for substep in step.substeps() {
            let status = recorded.get(*substep).unwrap_or(SubstepStatus::Pending);
            table.add_row(vec![
                Cell::new(step.as_str()),
                Cell::new(substep.as_str()),
                Cell::new(status.as_str()).fg(status_color(status)),
            ]);
        }
    }
    table
}

/// Started steps keyed by name, as `status --json` prints them.
pub fn status_json(statuses: &[(Step, SubstepStatuses)]) -> serde_json::Value {
    let started: BTreeMap<Step, &SubstepStatuses> = statuses
        .iter()
        .filter(|(_, recorded)| !recorded.is_empty())
        .map(|(step, recorded)| (*step, recorded))
        .collect();
    serde_json::json!(started)
}

pub async fn status(state: &AppState, json: bool) -> anyhow::Result<()> {
    let hub = state.hub(state.store(), HubOptions::default())?;
    let statuses = hub.statuses().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status_json(&statuses))?);
        return Ok(());
    }

    if statuses.iter().all(|(_, recorded)| recorded.is_empty()) {
        println!("  No upgrade in progress. Run {} to start one.", style("clustergrade initialize").cyan());
        return Ok(());
    }

    if let Ok(config) = hub.config().await {
        println!();
        println!("  Upgrade {}", style(config.id).bold());
    }
    println!();
    println!("{}", status_table(&statuses));
    Ok(())
}
