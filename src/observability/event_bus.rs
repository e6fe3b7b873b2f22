//! Tokio broadcast event bus for connection lifecycle notifications.

use crate::models::ConnectionEvent;
use tokio::sync::broadcast;

/// Default buffer capacity for event buses.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// Broadcast channel for [`ConnectionEvent`]s.
///
/// Publishing is best effort: with no subscribers, or with lagging ones,
/// events are dropped and the publisher is never blocked or failed.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

/// Filtered receiver that yields events matching a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<ConnectionEvent>,
    predicate: F,
}

impl EventBus {
    /// Creates a new event bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers (best effort).
    pub fn publish(&self, event: ConnectionEvent) {
        let meta = event.meta();
        tracing::debug!(
            event_id = %meta.event_id,
            source = meta.source,
            timestamp = meta.timestamp,
            event_type = event.event_type(),
            "Publishing connection event"
        );
        metrics::counter!("event_bus_publish_total", "event" => event.event_type()).increment(1);
        if self.sender.send(event).is_err() {
            metrics::counter!("event_bus_publish_dropped_total").increment(1);
        }
    }

    /// Subscribes to the event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Subscribes to events matching the provided event type.
    #[must_use]
    pub fn subscribe_event_type(
        &self,
        event_type: &'static str,
    ) -> FilteredReceiver<impl Fn(&ConnectionEvent) -> bool> {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            predicate: move |event: &ConnectionEvent| event.event_type() == event_type,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&ConnectionEvent) -> bool,
{
    /// Receives the next event that matches the predicate.
    pub async fn recv(&mut self) -> Result<ConnectionEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Ok(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("event_bus_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }
}
