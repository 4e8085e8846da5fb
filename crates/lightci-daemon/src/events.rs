//! In-process event bus feeding a run's log stream (Section 4.3 "in-process
//! signals, not durable"; Section 5 "per-build subscriber sets").

use lightci_core::events::Event;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts [`Event`] values to whoever is currently streaming a run's
/// logs. Lagging subscribers miss events rather than blocking the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
