//! Reconnecting, single-flight client for one command kind.
//!
//! `connect()` returns immediately and runs the attempt sequence on a tokio
//! task; `disconnect()` may be called at any time from any task. The
//! `client`/`is_connecting` pair lives under one mutex, and every write made by
//! an attempt sequence is checked against the sequence number it was started
//! with so a cancelled sequence can never store a handle.

use crate::command::{CommandConnector, CommandHandler, CommandKind, CommandMessage, CommandTransport};
use crate::config::CommandChannelConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A stored, live connection: its dispatch task and the token that stops it.
struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ClientState {
    client: Option<ActiveSession>,
    is_connecting: bool,
    /// Cancels the in-flight attempt sequence.
    attempt_cancel: Option<CancellationToken>,
    attempt_seq: u64,
    next_session_id: u64,
}

pub struct CommandChannelClient {
    kind: CommandKind,
    retry: CommandChannelConfig,
    connector: Arc<dyn CommandConnector>,
    handler: Arc<dyn CommandHandler>,
    state: Mutex<ClientState>,
}

impl CommandChannelClient {
    pub fn new(
        kind: CommandKind,
        retry: CommandChannelConfig,
        connector: Arc<dyn CommandConnector>,
        handler: Arc<dyn CommandHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            retry,
            connector,
            handler,
            state: Mutex::new(ClientState::default()),
        })
    }

    /// Start an attempt sequence unless one is running or a client is stored.
    /// Returns whether a new sequence was started.
    pub fn connect(self: &Arc<Self>) -> bool {
        let (seq, cancel) = {
            let mut state = self.state.lock();
            if state.is_connecting || state.client.is_some() {
                return false;
            }
            state.is_connecting = true;
            state.attempt_seq += 1;
            let cancel = CancellationToken::new();
            state.attempt_cancel = Some(cancel.clone());
            (state.attempt_seq, cancel)
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_attempts(seq, cancel).await;
        });
        true
    }

    /// Stop any attempt sequence and close the stored client, if any.
    pub fn disconnect(&self) {
        let taken = {
            let mut state = self.state.lock();
            state.is_connecting = false;
            if let Some(cancel) = state.attempt_cancel.take() {
                cancel.cancel();
            }
            state.client.take()
        };

        if let Some(session) = taken {
            // The dispatch task closes the transport and swallows close errors.
            session.cancel.cancel();
            tracing::debug!("{} command client disconnected", self.kind);
            drop(session.task);
        }
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.client.is_some() && !state.is_connecting
    }

    async fn run_attempts(self: Arc<Self>, seq: u64, cancel: CancellationToken) {
        for attempt in 1..=self.retry.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return self.abandon(seq),
                _ = tokio::time::sleep(self.retry.retry_delay(attempt)) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return self.abandon(seq),
                result = self.connector.connect(self.kind) => result,
            };

            match result {
                Ok(transport) => {
                    self.store(seq, &cancel, transport).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        "{} command connect attempt {}/{} failed: {:#}",
                        self.kind,
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                }
            }
        }

        tracing::debug!("{} command client gave up", self.kind);
        self.abandon(seq);
    }

    /// Clear `is_connecting` if this sequence still owns it.
    fn abandon(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.attempt_seq == seq && state.is_connecting {
            state.is_connecting = false;
            state.attempt_cancel = None;
        }
    }

    async fn store(
        self: &Arc<Self>,
        seq: u64,
        cancel: &CancellationToken,
        mut transport: Box<dyn CommandTransport>,
    ) {
        {
            let mut state = self.state.lock();
            if !cancel.is_cancelled() && state.attempt_seq == seq && state.is_connecting {
                let id = state.next_session_id;
                state.next_session_id += 1;
                let session_cancel = CancellationToken::new();
                let task = tokio::spawn(Arc::clone(self).dispatch(
                    id,
                    session_cancel.clone(),
                    transport,
                ));
                state.client = Some(ActiveSession {
                    id,
                    cancel: session_cancel,
                    task,
                });
                state.is_connecting = false;
                state.attempt_cancel = None;
                return;
            }
        }

        tracing::debug!("{} command connection discarded after cancel", self.kind);
        if let Err(e) = transport.close().await {
            tracing::debug!("Closing discarded {} connection: {}", self.kind, e);
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
        mut transport: Box<dyn CommandTransport>,
    ) {
        self.handler.on_connected();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = transport.next_message() => next,
            };
            match next {
                Ok(Some(message)) => self.deliver(message),
                Ok(None) => {
                    tracing::debug!("{} command stream closed by remote", self.kind);
                    self.clear_if_current(id);
                    break;
                }
                Err(e) => {
                    tracing::debug!("{} command stream failed: {:#}", self.kind, e);
                    self.clear_if_current(id);
                    break;
                }
            }
        }

        if let Err(e) = transport.close().await {
            tracing::debug!("Closing {} connection: {}", self.kind, e);
        }
        self.handler.on_disconnected();
    }

    /// Drop the stored handle if it still refers to session `id`.
    fn clear_if_current(&self, id: u64) {
        let mut state = self.state.lock();
        if state.client.as_ref().map(|s| s.id) == Some(id) {
            state.client = None;
        }
    }

    fn deliver(&self, message: CommandMessage) {
        if message.kind() != Some(self.kind) {
            tracing::debug!("{} command client ignoring {:?}", self.kind, message);
            return;
        }
        match message {
            CommandMessage::Status { sample } => self.handler.update_status(sample),
            CommandMessage::Logs { lines } => self.handler.append_logs(lines),
            CommandMessage::ClearLogs => self.handler.clear_logs(),
            CommandMessage::Groups { groups } => self.handler.update_groups(groups),
            CommandMessage::ModeList { modes, current } => {
                self.handler.initialize_mode(modes, current)
            }
            CommandMessage::ModeChanged { mode } => self.handler.update_mode(mode),
            CommandMessage::Subscribed | CommandMessage::Rejected { .. } => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
