//! Worker-side session lifecycle.
//!
//! A single task owns the engine and processes commands in order, so start,
//! stop and reload never interleave. Every status change is published to the
//! [`EventBroadcaster`] and mirrored into a watch channel for RPC queries.
//! A failed start raises exactly one alert, immediately followed by Stopped.

use crate::broadcast::{BroadcastEvent, EventBroadcaster};
use crate::error::{AlertEvent, AlertKind, SessionError};
use crate::rpc::{SessionStatus, StartRequest};
use crate::worker::command_server::CommandServer;
use crate::worker::engine::{Engine, EngineFactory, EngineFailure};
use crate::worker::hub::CommandHub;
use crate::worker::port_file::PortFile;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// How long a worker that never received a start request stays up.
const STARTUP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Start(StartRequest),
    Reload,
    /// Stop any running session and end the worker.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Token command clients must present.
    pub token: String,
    pub status_interval: Duration,
    pub require_root: bool,
    /// Idle time after a session ends before the worker exits.
    pub exit_linger: Duration,
}

enum Next {
    Command(Option<WorkerCommand>),
    Event(BroadcastEvent),
    EngineExited(String),
    Idle,
}

pub struct WorkerSession {
    status: watch::Sender<SessionStatus>,
    broadcaster: Arc<EventBroadcaster>,
    hub: Arc<CommandHub>,
    factory: Arc<dyn EngineFactory>,
    port_file: Arc<PortFile>,
    options: SessionOptions,
    engine: Option<Box<dyn Engine>>,
    command_server: Option<CommandServer>,
    last_request: Option<StartRequest>,
    served: bool,
    idle_since: Option<Instant>,
}

impl WorkerSession {
    pub fn new(
        broadcaster: Arc<EventBroadcaster>,
        hub: Arc<CommandHub>,
        factory: Arc<dyn EngineFactory>,
        port_file: Arc<PortFile>,
        options: SessionOptions,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status, status_rx) = watch::channel(SessionStatus::Stopped);
        let session = Self {
            status,
            broadcaster,
            hub,
            factory,
            port_file,
            options,
            engine: None,
            command_server: None,
            last_request: None,
            served: false,
            idle_since: Some(Instant::now()),
        };
        (session, status_rx)
    }

    /// Process commands until shutdown, the command channel closing, or the
    /// idle timeout elapsing while Stopped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let listener_id = self.broadcaster.subscribe(Arc::new(events_tx));

        loop {
            let deadline = self.idle_deadline();
            let next = {
                let engine = self.engine.as_mut();
                tokio::select! {
                    command = commands.recv() => Next::Command(command),
                    Some(event) = events.recv() => Next::Event(event),
                    reason = wait_engine(engine) => Next::EngineExited(reason),
                    _ = sleep_until(deadline) => Next::Idle,
                }
            };

            match next {
                Next::Command(Some(WorkerCommand::Start(request))) => self.start(request).await,
                Next::Command(Some(WorkerCommand::Reload)) => self.reload().await,
                Next::Command(Some(WorkerCommand::Shutdown)) | Next::Command(None) => {
                    self.stop().await;
                    break;
                }
                Next::Event(BroadcastEvent::ServiceClose) => self.stop().await,
                Next::Event(_) => {}
                Next::EngineExited(reason) => {
                    tracing::warn!("Engine stopped unexpectedly: {}", reason);
                    self.hub.append_log(reason);
                    self.stop().await;
                }
                Next::Idle => {
                    tracing::info!("Session idle, worker exiting");
                    break;
                }
            }
        }

        self.broadcaster.unsubscribe(listener_id);
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let since = self.idle_since?;
        let idle = if self.served {
            self.options.exit_linger
        } else {
            STARTUP_IDLE_TIMEOUT
        };
        Some(since + idle)
    }

    fn current(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, status: SessionStatus) {
        tracing::info!("Session status: {}", status);
        self.idle_since = (status == SessionStatus::Stopped).then(Instant::now);
        self.status.send_replace(status);
        self.broadcaster.status_changed(status);
    }

    async fn start(&mut self, request: StartRequest) {
        if self.current() != SessionStatus::Stopped {
            tracing::debug!("Ignoring start while {}", self.current());
            return;
        }
        self.served = true;
        self.last_request = Some(request.clone());
        self.set_status(SessionStatus::Starting);
        match self.launch(request).await {
            Ok(()) => self.set_status(SessionStatus::Started),
            Err(error) => self.stop_and_alert(error).await,
        }
    }

    async fn launch(&mut self, request: StartRequest) -> Result<(), SessionError> {
        let server = CommandServer::start(
            self.hub.clone(),
            self.options.token.clone(),
            self.options.status_interval,
        )
        .await
        .map_err(|e| SessionError::CommandEndpointStartFailed(format!("{:#}", e)))?;
        if let Err(e) = self.port_file.set_command_port(server.port()) {
            tracing::warn!("Failed to publish command port: {:#}", e);
        }
        self.command_server = Some(server);

        if self.options.require_root && !running_as_root() {
            return Err(SessionError::PermissionRequestFailed);
        }
        if is_empty_config(&request.config) {
            return Err(SessionError::EmptyConfiguration);
        }

        self.hub.reset();
        let mut engine = self
            .factory
            .create(&request, self.hub.clone())
            .await
            .map_err(|failure| match failure {
                EngineFailure::NoVpnAddress => SessionError::NoVpnAddress,
                EngineFailure::Failed(message) => SessionError::EngineCreateFailed(message),
            })?;
        if let Err(failure) = engine.start().await {
            if let Err(e) = engine.close().await {
                tracing::warn!("Failed to close engine after start failure: {:#}", e);
            }
            return Err(match failure {
                EngineFailure::NoVpnAddress => SessionError::NoVpnAddress,
                EngineFailure::Failed(message) => SessionError::EngineStartFailed(message),
            });
        }
        self.engine = Some(engine);
        Ok(())
    }

    async fn stop(&mut self) {
        if self.current() != SessionStatus::Started {
            tracing::debug!("Ignoring stop while {}", self.current());
            return;
        }
        self.set_status(SessionStatus::Stopping);
        self.teardown().await;
        self.set_status(SessionStatus::Stopped);
    }

    async fn stop_and_alert(&mut self, error: SessionError) {
        let alert = error
            .to_alert()
            .unwrap_or_else(|| AlertEvent::new(AlertKind::StartService, Some(error.to_string())));
        tracing::warn!("Session start failed: {}", error);
        self.broadcaster.alert(alert.kind, alert.message);
        self.teardown().await;
        self.set_status(SessionStatus::Stopped);
    }

    /// Restart the engine with the last request, keeping the session alive.
    async fn reload(&mut self) {
        if self.current() != SessionStatus::Started {
            tracing::debug!("Ignoring reload while {}", self.current());
            return;
        }
        let Some(request) = self.last_request.clone() else {
            return;
        };
        self.set_status(SessionStatus::Starting);
        self.teardown().await;
        match self.launch(request).await {
            Ok(()) => self.set_status(SessionStatus::Started),
            Err(error) => self.stop_and_alert(error).await,
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.close().await {
                tracing::warn!("Failed to close engine: {:#}", e);
            }
        }
        if let Some(server) = self.command_server.take() {
            server.close().await;
        }
        if let Err(e) = self.port_file.set_command_port(0) {
            tracing::warn!("Failed to clear command port: {:#}", e);
        }
    }
}

async fn wait_engine(engine: Option<&mut Box<dyn Engine>>) -> String {
    match engine {
        Some(engine) => engine.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Blank or `{}` configurations cannot start an engine.
pub fn is_empty_config(config: &str) -> bool {
    let trimmed = config.trim();
    trimmed.is_empty() || trimmed == "{}"
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
