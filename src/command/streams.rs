//! Typed specializations of [`CommandChannelClient`].

use crate::command::{CommandChannelClient, CommandConnector, CommandHandler, CommandKind};
use crate::config::CommandChannelConfig;
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use crate::rpc::{OutboundGroup, StatusSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct StatusForwarder {
    listener: Arc<dyn Listener<StatusSample>>,
}

impl CommandHandler for StatusForwarder {
    fn update_status(&self, sample: StatusSample) {
        if self.listener.deliver(sample).is_err() {
            tracing::debug!("Status sample dropped: listener gone");
        }
    }
}

/// Periodic engine status samples.
pub struct StatusStream {
    client: Arc<CommandChannelClient>,
}

impl StatusStream {
    pub fn new(
        retry: CommandChannelConfig,
        connector: Arc<dyn CommandConnector>,
        listener: Arc<dyn Listener<StatusSample>>,
    ) -> Self {
        let handler = Arc::new(StatusForwarder { listener });
        Self {
            client: CommandChannelClient::new(CommandKind::Status, retry, connector, handler),
        }
    }

    /// Refused when already connected.
    pub fn connect(&self) -> bool {
        if self.client.is_connected() {
            return false;
        }
        self.client.connect()
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

/// Events surfaced by [`LogStream`] to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Connected,
    Disconnected,
    Cleared,
    Line(String),
}

/// Bounded history of log lines plus observer fan-out.
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
    observers: ListenerRegistry<LogEvent>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
            observers: ListenerRegistry::new(),
        }
    }

    /// Register an observer, replaying the retained history to it first.
    ///
    /// Replay and registration happen under the `lines` lock, which
    /// [`append`](Self::append) also holds while broadcasting, so every line
    /// reaches the observer exactly once. Observers must not call back into
    /// the buffer.
    pub fn attach(&self, observer: Arc<dyn Listener<LogEvent>>) -> Option<ListenerId> {
        let lines = self.lines.lock();
        for line in lines.iter() {
            if observer.deliver(LogEvent::Line(line.clone())).is_err() {
                return None;
            }
        }
        Some(self.observers.add(observer))
    }

    pub fn detach(&self, id: ListenerId) {
        self.observers.remove(id);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut lines = self.lines.lock();
        lines.clear();
        self.observers.broadcast(LogEvent::Cleared);
    }

    pub fn append(&self, line: String) {
        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.clone());
        self.observers.broadcast(LogEvent::Line(line));
    }
}

impl CommandHandler for LogBuffer {
    fn on_connected(&self) {
        self.observers.broadcast(LogEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.observers.broadcast(LogEvent::Disconnected);
    }

    fn clear_logs(&self) {
        self.clear();
    }

    fn append_logs(&self, lines: Vec<String>) {
        for line in lines {
            self.append(line);
        }
    }
}

/// Engine log lines with a replayable ring buffer.
pub struct LogStream {
    client: Arc<CommandChannelClient>,
    buffer: Arc<LogBuffer>,
}

impl LogStream {
    pub fn new(retry: CommandChannelConfig, connector: Arc<dyn CommandConnector>) -> Self {
        let buffer = Arc::new(LogBuffer::new(retry.log_buffer));
        Self {
            client: CommandChannelClient::new(CommandKind::Log, retry, connector, buffer.clone()),
            buffer,
        }
    }

    /// Refused when already connected.
    pub fn connect(&self) -> bool {
        if self.client.is_connected() {
            return false;
        }
        self.client.connect()
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }
}

#[derive(Default)]
struct GroupSnapshot {
    groups: Mutex<Vec<OutboundGroup>>,
}

impl CommandHandler for GroupSnapshot {
    fn update_groups(&self, groups: Vec<OutboundGroup>) {
        *self.groups.lock() = groups;
    }

    fn on_disconnected(&self) {
        self.groups.lock().clear();
    }
}

/// Latest outbound-group snapshot.
pub struct GroupStream {
    client: Arc<CommandChannelClient>,
    snapshot: Arc<GroupSnapshot>,
}

impl GroupStream {
    pub fn new(retry: CommandChannelConfig, connector: Arc<dyn CommandConnector>) -> Self {
        let snapshot = Arc::new(GroupSnapshot::default());
        Self {
            client: CommandChannelClient::new(
                CommandKind::Group,
                retry,
                connector,
                snapshot.clone(),
            ),
            snapshot,
        }
    }

    pub fn connect(&self) -> bool {
        self.client.connect()
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn groups(&self) -> Vec<OutboundGroup> {
        self.snapshot.groups.lock().clone()
    }
}

/// Routing modes offered by the engine and the active one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeState {
    pub modes: Vec<String>,
    pub current: String,
}

#[derive(Default)]
struct ModeSnapshot {
    state: Mutex<ModeState>,
}

impl CommandHandler for ModeSnapshot {
    fn initialize_mode(&self, modes: Vec<String>, current: String) {
        *self.state.lock() = ModeState { modes, current };
    }

    fn update_mode(&self, mode: String) {
        self.state.lock().current = mode;
    }

    fn on_disconnected(&self) {
        *self.state.lock() = ModeState::default();
    }
}

/// Latest routing-mode state.
pub struct ModeStream {
    client: Arc<CommandChannelClient>,
    snapshot: Arc<ModeSnapshot>,
}

impl ModeStream {
    pub fn new(retry: CommandChannelConfig, connector: Arc<dyn CommandConnector>) -> Self {
        let snapshot = Arc::new(ModeSnapshot::default());
        Self {
            client: CommandChannelClient::new(CommandKind::Mode, retry, connector, snapshot.clone()),
            snapshot,
        }
    }

    pub fn connect(&self) -> bool {
        self.client.connect()
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn state(&self) -> ModeState {
        self.snapshot.state.lock().clone()
    }
}

#[cfg(test)]
#[path = "tests/streams_tests.rs"]
mod tests;
