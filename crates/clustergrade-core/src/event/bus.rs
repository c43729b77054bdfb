//! Progress events of a running step.
//!
//! The workflow engine, the statement runner and substep output streams all
//! publish onto one `EventBus`; the CLI renderer subscribes to it. Events
//! published while nobody listens are dropped.

use clustergrade_types::event::UpgradeEvent;
use tokio::sync::broadcast;

/// Events buffered per subscriber before a slow one starts lagging.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel of [`UpgradeEvent`]s. Clones publish to the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpgradeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: UpgradeEvent) {
        // no subscribers
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
