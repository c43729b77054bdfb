//! Event types for the upgrade event bus.
//!
//! `UpgradeEvent` is broadcast by the workflow engine and the statement
//! runner. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use serde::{Deserialize, Serialize};

use crate::step::{Step, Substep, SubstepStatus};

/// Events emitted while a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpgradeEvent {
    /// A step passed its confirmation gate and started.
    StepStarted { step: Step },

    /// A substep changed status.
    SubstepStatus {
        step: Step,
        substep: Substep,
        status: SubstepStatus,
    },

    /// A line of output written by a substep body.
    SubstepOutput {
        step: Step,
        substep: Substep,
        line: String,
    },

    /// A batch of statements finished (successfully or not).
    StatementProgress { completed: usize, total: usize },

    /// The step stopped: `quit` is true when a body ended it cleanly.
    StepFinished {
        step: Step,
        succeeded: bool,
        quit: bool,
    },
}
