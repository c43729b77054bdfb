//! Interactive confirmation prompts.

use clustergrade_core::workflow::ConfirmationGate;
use clustergrade_types::step::Step;
use console::style;
use dialoguer::Confirm;

/// Asks on the terminal with `dialoguer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialoguerGate;

/// What the operator is told before `step` starts.
pub fn step_summary(step: Step) -> &'static str {
    match step {
        Step::Initialize => {
            "initialize checks the source and target installations, saves the source \
             cluster's configuration and creates the target cluster on temporary ports.\n\
             The source cluster keeps running."
        }
        Step::Execute => {
            "execute stops the source cluster and upgrades the coordinator and primaries \
             into the target cluster, then starts it.\n\
             The source cluster is not available until revert or finalize."
        }
        Step::Finalize => {
            "finalize upgrades the mirrors and standby and moves the target cluster onto \
             the source cluster's ports and data directories.\n\
             After finalize starts the upgrade can no longer be reverted."
        }
        Step::Revert => {
            "revert stops and deletes the target cluster and restarts the source cluster."
        }
    }
}

impl ConfirmationGate for DialoguerGate {
    fn confirm(&self, step: Step) -> anyhow::Result<bool> {
        println!();
        println!("{}", step_summary(step));
        println!();
        let proceed = Confirm::new()
            .with_prompt(format!("Continue with {}?", style(step.as_str()).bold()))
            .default(false)
            .interact()?;
        if !proceed {
            println!("  Cancelled.");
        }
        Ok(proceed)
    }

    fn ask(&self, question: &str) -> anyhow::Result<bool> {
        Ok(Confirm::new()
            .with_prompt(question)
            .default(false)
            .interact()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_step_has_a_summary_naming_it() {
        for step in Step::ALL {
            assert!(step_summary(step).starts_with(step.as_str()), "{step}");
        }
    }
}
