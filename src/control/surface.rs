//! The control-surface API.
//!
//! Every request either reads/writes settings directly or is routed through
//! the session actor. Failures return to the caller and never change the
//! session status.

use crate::broadcast::EventBroadcaster;
use crate::command::streams::{LogEvent, ModeState};
use crate::command::tcp::{Endpoint, TcpCommandConnector};
use crate::command::CommandConnector;
use crate::config::SessionConfig;
use crate::context::AppContext;
use crate::control::actor::{ask, SessionActor, SessionActorArgs, SessionEvent, SessionMessage};
use crate::control::apps::{AppCatalog, DesktopEntryCatalog, InstalledApp};
use crate::control::rpc_worker::{RpcWorker, WorkerEndpoint, WorkerLauncher};
use crate::control::telemetry::TelemetryStreams;
use crate::control::worker_connection::{WorkerBinder, WorkerConnection};
use crate::error::SessionError;
use crate::registry::{Listener, ListenerId};
use crate::rpc::{ConnectionQuery, OutboundGroup, PerAppProxyMode, SessionStatus};
use crate::settings::Settings;
use anyhow::Result;
use ractor::{Actor, ActorRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 256;

fn storage(e: anyhow::Error) -> SessionError {
    SessionError::Storage(format!("{:#}", e))
}

/// Collaborators of a [`ControlSurface`].
pub struct SurfaceParts {
    pub settings: Settings,
    pub config: SessionConfig,
    pub worker: Arc<dyn WorkerLauncher>,
    pub binder: Arc<dyn WorkerBinder>,
    /// Broadcaster the worker's events are relayed into.
    pub relayed: Arc<EventBroadcaster>,
    pub connector: Arc<dyn CommandConnector>,
    pub apps: Arc<dyn AppCatalog>,
}

pub struct ControlSurface {
    actor: ActorRef<SessionMessage>,
    actor_handle: JoinHandle<()>,
    settings: Settings,
    streams: Arc<TelemetryStreams>,
    worker: Arc<dyn WorkerLauncher>,
    apps: Arc<dyn AppCatalog>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl ControlSurface {
    /// Production wiring: tarpc worker access, TCP command channel and XDG
    /// application catalog, all rooted at the context's storage home.
    pub async fn launch(ctx: &AppContext) -> Result<Self> {
        let relayed = Arc::new(EventBroadcaster::new());
        let rpc = Arc::new(RpcWorker::new(
            WorkerEndpoint::new(
                ctx.paths.clone(),
                Duration::from_millis(ctx.config.worker.spawn_timeout_ms),
            ),
            relayed.clone(),
            Duration::from_millis(ctx.config.worker.watchdog_interval_ms.max(1)),
        ));
        let connector = Arc::new(TcpCommandConnector::new(Endpoint::PortFile(
            ctx.paths.worker_port_path(),
        )));

        Self::spawn(SurfaceParts {
            settings: ctx.settings.clone(),
            config: ctx.config.clone(),
            worker: rpc.clone(),
            binder: rpc,
            relayed,
            connector,
            apps: Arc::new(DesktopEntryCatalog::from_env()),
        })
        .await
    }

    pub async fn spawn(parts: SurfaceParts) -> Result<Self> {
        let connection = WorkerConnection::new(parts.binder);
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(TelemetryStreams::new(
            parts.config.command.clone(),
            parts.connector,
            Arc::new(samples_tx),
        ));
        let (status_tx, status) = watch::channel(SessionStatus::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let args = SessionActorArgs {
            worker: parts.worker.clone(),
            connection,
            streams: streams.clone(),
            samples: samples_rx,
            relayed: parts.relayed,
            settings: parts.settings.clone(),
            timings: parts.config.session.clone(),
            status_tx,
            events: events.clone(),
        };
        let (actor, actor_handle) = Actor::spawn(None, SessionActor, args)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to spawn session actor: {}", e))?;

        Ok(Self {
            actor,
            actor_handle,
            settings: parts.settings,
            streams,
            worker: parts.worker,
            apps: parts.apps,
            status,
            events,
        })
    }

    /// Stop the session actor. The worker keeps running.
    pub async fn shutdown(self) {
        self.actor.stop(None);
        if self.actor_handle.await.is_err() {
            tracing::debug!("Session actor ended abnormally");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn save_config(&self, blob: &str) -> Result<bool, SessionError> {
        self.settings.set_config(blob).map_err(storage)?;
        Ok(true)
    }

    pub fn get_config(&self) -> Result<String, SessionError> {
        self.settings.config().map_err(storage)
    }

    pub async fn start_vpn(&self) -> Result<bool, SessionError> {
        ask(&self.actor, SessionMessage::Start).await?
    }

    pub async fn stop_vpn(&self) -> Result<bool, SessionError> {
        ask(&self.actor, SessionMessage::Stop).await?
    }

    pub async fn toggle_vpn(&self) -> Result<bool, SessionError> {
        ask(&self.actor, SessionMessage::Toggle).await?
    }

    /// Status after a best-effort liveness probe of the worker.
    pub async fn get_vpn_status(&self) -> Result<SessionStatus, SessionError> {
        ask(&self.actor, |reply| SessionMessage::GetStatus { probe: true, reply }).await
    }

    pub fn set_per_app_proxy_mode(&self, mode: &str) -> Result<bool, SessionError> {
        let parsed = PerAppProxyMode::parse(mode)
            .ok_or_else(|| SessionError::InvalidMode(mode.to_string()))?;
        self.settings.set_per_app_mode(parsed).map_err(storage)?;
        Ok(true)
    }

    pub fn get_per_app_proxy_mode(&self) -> Result<PerAppProxyMode, SessionError> {
        self.settings.per_app_mode().map_err(storage)
    }

    pub fn set_per_app_proxy_list(&self, list: &[String]) -> Result<bool, SessionError> {
        self.settings.set_per_app_list(list).map_err(storage)?;
        Ok(true)
    }

    pub fn get_per_app_proxy_list(&self) -> Result<Vec<String>, SessionError> {
        self.settings.per_app_list().map_err(storage)
    }

    pub async fn get_installed_apps(&self) -> Result<Vec<InstalledApp>, SessionError> {
        let apps = self.apps.clone();
        tokio::task::spawn_blocking(move || apps.installed_apps())
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))?
            .map_err(storage)
    }

    pub fn get_logs(&self) -> Vec<String> {
        self.streams.logs().buffer().lines()
    }

    pub fn clear_logs(&self) -> bool {
        self.streams.logs().buffer().clear();
        true
    }

    /// Attach a log observer; retained lines are replayed to it first.
    pub fn attach_log_observer(&self, observer: Arc<dyn Listener<LogEvent>>) -> Option<ListenerId> {
        self.streams.logs().buffer().attach(observer)
    }

    pub fn detach_log_observer(&self, id: ListenerId) {
        self.streams.logs().buffer().detach(id);
    }

    pub fn get_notification_title(&self) -> Result<String, SessionError> {
        self.settings.notification_title().map_err(storage)
    }

    pub fn set_notification_title(&self, title: &str) -> Result<bool, SessionError> {
        self.settings.set_notification_title(title).map_err(storage)?;
        Ok(true)
    }

    pub fn get_notification_description(&self) -> Result<String, SessionError> {
        self.settings.notification_description().map_err(storage)
    }

    pub fn set_notification_description(&self, description: &str) -> Result<bool, SessionError> {
        self.settings
            .set_notification_description(description)
            .map_err(storage)?;
        Ok(true)
    }

    pub fn get_auto_start(&self) -> Result<bool, SessionError> {
        self.settings.auto_start().map_err(storage)
    }

    pub fn set_auto_start(&self, enabled: bool) -> Result<bool, SessionError> {
        self.settings.set_auto_start(enabled).map_err(storage)?;
        Ok(true)
    }

    pub fn get_outbound_groups(&self) -> Vec<OutboundGroup> {
        self.streams.groups()
    }

    pub fn get_clash_mode(&self) -> ModeState {
        self.streams.mode()
    }

    pub async fn find_connection_owner(&self, query: ConnectionQuery) -> Result<u32, SessionError> {
        self.worker.find_connection_owner(query).await
    }
}

#[cfg(test)]
#[path = "tests/surface_tests.rs"]
mod tests;
