//! State change notifications.
//!
//! The coordinator emits an event after each mutation has been applied.
//! Presentation layers subscribe and re-read whatever they display.

use tokio::sync::broadcast;

use crate::models::{ConnectionId, DatabaseId, TabId};
use crate::state::SelectionView;

/// Something observable changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A connection was added, updated or removed
    ConnectionsChanged,
    /// A connection's active flag or load status changed
    ConnectionStatusChanged(ConnectionId),
    /// A connection's database list changed
    DatabasesChanged(ConnectionId),
    /// One database's schema or load status changed
    DatabaseChanged(DatabaseId),
    /// Tabs were opened, closed or refocused
    TabsChanged,
    /// One tab's contents changed
    TabChanged(TabId),
    /// The derived selection changed
    SelectionChanged(SelectionView),
}

/// Broadcast sender for [`StateEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StateEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: StateEvent) {
        tracing::trace!(?event, "State event");
        let _ = self.sender.send(event);
    }

    /// Emit several events in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = StateEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit_all([StateEvent::TabsChanged, StateEvent::TabChanged(TabId(2))]);

        assert_eq!(rx.recv().await.unwrap(), StateEvent::TabsChanged);
        assert_eq!(rx.recv().await.unwrap(), StateEvent::TabChanged(TabId(2)));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(0);
        bus.emit(StateEvent::ConnectionsChanged);
    }
}
