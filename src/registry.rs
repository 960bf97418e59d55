//! Listener registry with deregistration-on-failure.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unique listener ID for tracking registered listeners.
pub type ListenerId = u64;

/// Delivery to a listener that can no longer accept events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerGone;

/// Something that accepts events of type `E`.
pub trait Listener<E>: Send + Sync {
    fn deliver(&self, event: E) -> Result<(), ListenerGone>;
}

impl<E: Send> Listener<E> for mpsc::UnboundedSender<E> {
    fn deliver(&self, event: E) -> Result<(), ListenerGone> {
        self.send(event).map_err(|_| ListenerGone)
    }
}

struct RegistryInner<E> {
    listeners: BTreeMap<ListenerId, Arc<dyn Listener<E>>>,
    next_id: ListenerId,
}

/// Fan-out registry. Listeners are called in registration order; a listener
/// that fails is removed and never called again.
pub struct ListenerRegistry<E> {
    inner: Mutex<RegistryInner<E>>,
}

impl<E: Clone> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                listeners: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Add a listener. Returns the assigned ID.
    pub fn add(&self, listener: Arc<dyn Listener<E>>) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, listener);
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.inner.lock().listeners.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Deliver `event` to every listener. Returns IDs of removed listeners.
    ///
    /// The lock is not held while listeners run, so a listener may add or
    /// remove registrations during dispatch.
    pub fn broadcast(&self, event: E) -> Vec<ListenerId> {
        let snapshot: Vec<(ListenerId, Arc<dyn Listener<E>>)> = {
            let inner = self.inner.lock();
            inner
                .listeners
                .iter()
                .map(|(id, l)| (*id, Arc::clone(l)))
                .collect()
        };

        let failed: Vec<ListenerId> = snapshot
            .into_iter()
            .filter_map(|(id, listener)| listener.deliver(event.clone()).err().map(|_| id))
            .collect();

        if !failed.is_empty() {
            let mut inner = self.inner.lock();
            for id in &failed {
                inner.listeners.remove(id);
                tracing::debug!("Removed failed listener: {}", id);
            }
        }
        failed
    }
}

impl<E: Clone> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
