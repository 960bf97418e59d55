//! Bind/unbind lifecycle towards the worker process.
//!
//! A successful bind is the control side's proof that the worker is alive:
//! it reports Started, every failure or loss reports Stopped. Nothing here is
//! fatal.

use crate::error::SessionError;
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use crate::rpc::SessionStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Handed to a binding so it can report that the worker went away.
#[derive(Debug, Clone)]
pub struct LossSignal {
    tx: mpsc::UnboundedSender<u64>,
    generation: u64,
}

impl LossSignal {
    pub fn fire(&self) {
        if self.tx.send(self.generation).is_err() {
            tracing::debug!("Loss signal dropped: connection gone");
        }
    }
}

/// Establishes bindings to the worker.
#[async_trait]
pub trait WorkerBinder: Send + Sync {
    async fn bind(&self, loss: LossSignal) -> Result<Box<dyn WorkerBinding>, SessionError>;
}

/// An established binding.
#[async_trait]
pub trait WorkerBinding: Send {
    async fn unbind(self: Box<Self>);
}

enum Phase {
    Unbound,
    Binding,
    Bound(Box<dyn WorkerBinding>),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Unbound => "unbound",
            Phase::Binding => "binding",
            Phase::Bound(_) => "bound",
        }
    }
}

struct ConnectionState {
    phase: Phase,
    /// Bumped by every connect and disconnect. Bind results and loss signals
    /// from an older generation are discarded.
    generation: u64,
}

pub struct WorkerConnection {
    binder: Arc<dyn WorkerBinder>,
    state: Mutex<ConnectionState>,
    listeners: ListenerRegistry<SessionStatus>,
    loss_tx: mpsc::UnboundedSender<u64>,
}

impl WorkerConnection {
    /// Must be called inside a tokio runtime.
    pub fn new(binder: Arc<dyn WorkerBinder>) -> Arc<Self> {
        let (loss_tx, mut loss_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            binder,
            state: Mutex::new(ConnectionState {
                phase: Phase::Unbound,
                generation: 0,
            }),
            listeners: ListenerRegistry::new(),
            loss_tx,
        });

        let weak: Weak<Self> = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(generation) = loss_rx.recv().await {
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                connection.on_unexpected_loss(generation);
            }
        });

        connection
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<SessionStatus>>) -> ListenerId {
        self.listeners.add(listener)
    }

    #[cfg(test)]
    pub fn is_bound(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Bound(_))
    }

    /// Start a bind attempt. Returns false when already bound or binding.
    pub fn connect(self: &Arc<Self>) -> bool {
        let generation = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Unbound) {
                tracing::debug!("Connect skipped: worker connection {}", state.phase.name());
                return false;
            }
            state.generation += 1;
            state.phase = Phase::Binding;
            state.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let loss = LossSignal {
                tx: this.loss_tx.clone(),
                generation,
            };
            let result = this.binder.bind(loss).await;
            this.finish_bind(generation, result).await;
        });
        true
    }

    async fn finish_bind(
        &self,
        generation: u64,
        result: Result<Box<dyn WorkerBinding>, SessionError>,
    ) {
        let (report, discarded) = {
            let mut state = self.state.lock();
            let current = state.generation == generation && matches!(state.phase, Phase::Binding);
            match (current, result) {
                (false, Ok(binding)) => (None, Some(binding)),
                (false, Err(_)) => (None, None),
                (true, Ok(binding)) => {
                    state.phase = Phase::Bound(binding);
                    (Some(SessionStatus::Started), None)
                }
                (true, Err(e)) => {
                    tracing::warn!("Worker bind failed: {}", e);
                    state.phase = Phase::Unbound;
                    (Some(SessionStatus::Stopped), None)
                }
            }
        };

        if let Some(binding) = discarded {
            tracing::debug!("Discarding binding obtained after disconnect");
            binding.unbind().await;
        }
        if let Some(status) = report {
            self.listeners.broadcast(status);
        }
    }

    /// Release the binding. Reports Stopped only when one was held.
    pub async fn disconnect(&self) {
        let binding = {
            let mut state = self.state.lock();
            state.generation += 1;
            match std::mem::replace(&mut state.phase, Phase::Unbound) {
                Phase::Bound(binding) => Some(binding),
                Phase::Binding | Phase::Unbound => None,
            }
        };

        if let Some(binding) = binding {
            binding.unbind().await;
            self.listeners.broadcast(SessionStatus::Stopped);
        }
    }

    fn on_unexpected_loss(self: &Arc<Self>, generation: u64) {
        let binding = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Bound(_)) {
                tracing::debug!("Ignoring stale loss signal");
                return;
            }
            std::mem::replace(&mut state.phase, Phase::Unbound)
        };
        drop(binding);

        tracing::warn!("Worker binding lost, retrying once");
        self.connect();
    }
}

#[cfg(test)]
#[path = "tests/worker_connection_tests.rs"]
mod tests;
