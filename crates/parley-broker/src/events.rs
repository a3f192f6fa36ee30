//! Broker event fan-out.

use parley_core::events::BrokerEvent;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Broadcast channel shared by every broker component.
///
/// Emitting never blocks and never fails; slow subscribers observe
/// `RecvError::Lagged` instead of back-pressuring the broker.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    /// New bus with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event.
    pub fn emit(&self, event: BrokerEvent) {
        let name = event.name();
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(event = name, receivers, "broker event");
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::errors::ParleyError;

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(BrokerEvent::error(&ParleyError::system("x")));
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(BrokerEvent::error(&ParleyError::routing("a")));
        bus.emit(BrokerEvent::error(&ParleyError::routing("b")));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, BrokerEvent::ErrorOccurred { ref message, .. } if message.ends_with('a')));
        assert!(matches!(second, BrokerEvent::ErrorOccurred { ref message, .. } if message.ends_with('b')));
    }
}
