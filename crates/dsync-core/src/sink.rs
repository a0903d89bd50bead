// ── Event sink ──
//
// Destination for finished system events. The engine only publishes;
// downstream consumers subscribe to the broadcast channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::event::SystemEvent;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Accepts finished, externally visible events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SystemEvent);
}

/// Fan-out sink backed by a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events rather than
/// holding up the dispatcher.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<SystemEvent>>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SystemEvent>> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: SystemEvent) {
        trace!(?event, "publishing system event");
        // No subscribers is not an error.
        let _ = self.tx.send(Arc::new(event));
    }
}
