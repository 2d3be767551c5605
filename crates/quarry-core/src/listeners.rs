//! Host environment events (focus and connectivity).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const ENVIRONMENT_CHANNEL_CAPACITY: usize = 64;

/// A change in the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentEvent {
    Focus,
    FocusLost,
    Online,
    Offline,
}

/// Fan-out of environment events to the engine and any other listener.
///
/// Dropping a receiver unsubscribes it.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EnvironmentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ENVIRONMENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; returns how many listeners received it.
    pub fn emit(&self, event: EnvironmentEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!(?event, "no environment listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
