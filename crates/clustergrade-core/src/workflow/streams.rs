//! Output sink for substep bodies and the processes they launch.

use std::sync::Arc;

use clustergrade_types::event::UpgradeEvent;
use clustergrade_types::step::{Step, Substep};

use crate::event::bus::EventBus;

#[derive(Debug)]
struct Target {
    step: Step,
    substep: Substep,
    bus: EventBus,
}

/// Where a substep writes its stdout and stderr.
///
/// Every line goes to the log and is published as
/// [`UpgradeEvent::SubstepOutput`] so the CLI can echo it in verbose mode.
/// Cloning is cheap; [`OutStreams::discard`] drops everything.
#[derive(Debug, Clone, Default)]
pub struct OutStreams {
    target: Option<Arc<Target>>,
}

impl OutStreams {
    pub fn new(step: Step, substep: Substep, bus: EventBus) -> Self {
        Self {
            target: Some(Arc::new(Target { step, substep, bus })),
        }
    }

    /// A sink that drops all output.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn stdout(&self, line: &str) {
        if let Some(target) = &self.target {
            tracing::info!(step = %target.step, substep = %target.substep, "{line}");
            self.publish(target, line);
        }
    }

    pub fn stderr(&self, line: &str) {
        if let Some(target) = &self.target {
            tracing::warn!(step = %target.step, substep = %target.substep, "{line}");
            self.publish(target, line);
        }
    }

    fn publish(&self, target: &Target, line: &str) {
        target.bus.publish(UpgradeEvent::SubstepOutput {
            step: target.step,
            substep: target.substep,
            line: line.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_published_with_substep() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let streams = OutStreams::new(Step::Execute, Substep::UpgradeCoordinator, bus);

        streams.stdout("Performing Consistency Checks");
        streams.stderr("warning: something");

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            UpgradeEvent::SubstepOutput {
                step: Step::Execute,
                substep: Substep::UpgradeCoordinator,
                line: "Performing Consistency Checks".into(),
            }
        );
        assert!(matches!(rx.recv().await.unwrap(), UpgradeEvent::SubstepOutput { .. }));
    }

    #[test]
    fn discard_drops_output() {
        let streams = OutStreams::discard();
        streams.stdout("ignored");
        streams.stderr("ignored");
    }
}
