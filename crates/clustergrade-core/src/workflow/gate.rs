//! Confirmation prompts shown to the operator.

use clustergrade_types::step::Step;

/// Asks the operator whether to proceed.
///
/// The CLI implements this with an interactive prompt; non-interactive runs
/// use [`AutoConfirm`].
pub trait ConfirmationGate: Send + Sync {
    /// Asked before a step starts. Returns `Ok(false)` when the operator
    /// declines.
    fn confirm(&self, step: Step) -> anyhow::Result<bool>;

    /// A yes/no question asked from inside a substep.
    fn ask(&self, question: &str) -> anyhow::Result<bool>;

    /// False when nobody is there to answer prompts.
    fn is_interactive(&self) -> bool {
        true
    }
}

/// Gate that always proceeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl ConfirmationGate for AutoConfirm {
    fn confirm(&self, _step: Step) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn ask(&self, _question: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}
