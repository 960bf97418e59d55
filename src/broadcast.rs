//! Process-wide publish/subscribe of session events.
//!
//! The worker publishes into its broadcaster and remote control surfaces are
//! attached as listeners by the RPC subscriber listener. The control surface
//! has its own broadcaster fed by the event relay. Nothing is persisted: a
//! listener attached late must query the worker for the current status.

use crate::error::{AlertEvent, AlertKind};
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use crate::rpc::SessionStatus;
use std::sync::Arc;

/// Cross-process message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    StatusChanged(SessionStatus),
    Alert(AlertEvent),
    /// Request to stop the session.
    ServiceClose,
}

#[derive(Default)]
pub struct EventBroadcaster {
    listeners: ListenerRegistry<BroadcastEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener<BroadcastEvent>>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.count()
    }

    pub fn status_changed(&self, status: SessionStatus) {
        self.publish(BroadcastEvent::StatusChanged(status));
    }

    pub fn alert(&self, kind: AlertKind, message: Option<String>) {
        self.publish(BroadcastEvent::Alert(AlertEvent::new(kind, message)));
    }

    pub fn service_close(&self) {
        self.publish(BroadcastEvent::ServiceClose);
    }

    pub fn publish(&self, event: BroadcastEvent) {
        let removed = self.listeners.broadcast(event);
        if !removed.is_empty() {
            tracing::debug!("Broadcast dropped {} dead listener(s)", removed.len());
        }
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
