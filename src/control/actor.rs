//! Session actor for the control surface.
//!
//! The SessionActor is the one serialized context that owns the
//! [`SessionMachine`]. Requests, worker reports, relayed broadcasts, timers
//! and telemetry samples all arrive as messages; the machine's effects are
//! applied here.

use crate::broadcast::{BroadcastEvent, EventBroadcaster};
use crate::config::SessionTimings;
use crate::control::machine::{Effect, SessionMachine};
use crate::control::rpc_worker::WorkerLauncher;
use crate::control::telemetry::TelemetryStreams;
use crate::control::traffic::{TrafficAccountant, TrafficEvent};
use crate::control::worker_connection::WorkerConnection;
use crate::error::{AlertEvent, SessionError};
use crate::registry::{Listener, ListenerGone};
use crate::rpc::{SessionStatus, StartRequest, StatusSample};
use crate::settings::Settings;
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Events pushed to control-surface observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionStatus),
    Alert(AlertEvent),
    Traffic(TrafficEvent),
}

/// Reply to a start, stop or toggle request: whether it was acted upon.
pub type RequestReply = oneshot::Sender<Result<bool, SessionError>>;

/// Messages that can be sent to the session actor.
pub enum SessionMessage {
    Start(RequestReply),
    Stop(RequestReply),
    /// Stopped starts, Started stops, transitional states are left alone.
    Toggle(RequestReply),
    /// Status reported by the worker connection, stamped with the cycle it
    /// was delivered in.
    Connection { cycle: u64, status: SessionStatus },
    /// Broadcast relayed from the worker.
    Relayed(BroadcastEvent),
    LaunchFailed { cycle: u64, error: SessionError },
    SettleElapsed { cycle: u64 },
    StopCleanup { cycle: u64 },
    Sample(StatusSample),
    ProbeTick,
    ProbeResult {
        cycle: u64,
        status: Option<SessionStatus>,
        reply: Option<oneshot::Sender<SessionStatus>>,
    },
    /// Current status, optionally after asking the worker.
    GetStatus {
        probe: bool,
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Arguments for spawning a session actor.
pub struct SessionActorArgs {
    pub worker: Arc<dyn WorkerLauncher>,
    pub connection: Arc<WorkerConnection>,
    pub streams: Arc<TelemetryStreams>,
    /// Samples delivered by the status stream.
    pub samples: mpsc::UnboundedReceiver<StatusSample>,
    /// Broadcaster fed by the worker's event relay.
    pub relayed: Arc<EventBroadcaster>,
    pub settings: Settings,
    pub timings: SessionTimings,
    pub status_tx: watch::Sender<SessionStatus>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// State maintained by the session actor.
pub struct SessionActorState {
    machine: SessionMachine,
    /// Mirror of the machine's cycle read by [`ConnectionReports`].
    cycle: Arc<AtomicU64>,
    worker: Arc<dyn WorkerLauncher>,
    connection: Arc<WorkerConnection>,
    streams: Arc<TelemetryStreams>,
    traffic: TrafficAccountant,
    settings: Settings,
    timings: SessionTimings,
    status_tx: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    settle: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

/// Forwards worker-connection reports into the actor.
struct ConnectionReports {
    actor: ActorRef<SessionMessage>,
    cycle: Arc<AtomicU64>,
}

impl Listener<SessionStatus> for ConnectionReports {
    fn deliver(&self, status: SessionStatus) -> Result<(), ListenerGone> {
        let cycle = self.cycle.load(Ordering::SeqCst);
        self.actor
            .send_message(SessionMessage::Connection { cycle, status })
            .map_err(|_| ListenerGone)
    }
}

impl Listener<BroadcastEvent> for ActorRef<SessionMessage> {
    fn deliver(&self, event: BroadcastEvent) -> Result<(), ListenerGone> {
        self.send_message(SessionMessage::Relayed(event))
            .map_err(|_| ListenerGone)
    }
}

/// Send a request and wait for its reply.
pub async fn ask<T>(
    actor: &ActorRef<SessionMessage>,
    make: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
) -> Result<T, SessionError> {
    let (tx, rx) = oneshot::channel();
    actor
        .send_message(make(tx))
        .map_err(|_| SessionError::ActivityUnavailable)?;
    rx.await.map_err(|_| SessionError::ActivityUnavailable)
}

/// The session actor.
pub struct SessionActor;

impl SessionActorState {
    fn start_request(&self) -> Result<StartRequest, SessionError> {
        let storage = |e: anyhow::Error| SessionError::Storage(format!("{:#}", e));
        Ok(StartRequest {
            config: self.settings.config().map_err(storage)?,
            per_app_mode: self.settings.per_app_mode().map_err(storage)?,
            per_app_list: self.settings.per_app_list().map_err(storage)?,
        })
    }

    fn sync_cycle(&self) {
        self.cycle.store(self.machine.cycle(), Ordering::SeqCst);
    }

    fn cancel_timers(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.abort();
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
    }

    async fn start(&mut self, myself: &ActorRef<SessionMessage>) -> Result<bool, SessionError> {
        if !self.worker.can_launch() {
            return Err(SessionError::ActivityUnavailable);
        }
        if matches!(
            self.machine.status(),
            SessionStatus::Starting | SessionStatus::Started
        ) {
            tracing::debug!("Start ignored: session is {}", self.machine.status());
            return Ok(true);
        }
        let request = self.start_request()?;

        self.cancel_timers();
        let (cycle, effects) = self.machine.begin_start();
        self.sync_cycle();
        tracing::info!("Starting session (cycle {})", cycle);

        let worker = self.worker.clone();
        let actor = myself.clone();
        tokio::spawn(async move {
            if let Err(error) = worker.launch(request).await {
                tracing::warn!("Worker launch failed: {}", error);
                let _ = actor.send_message(SessionMessage::LaunchFailed { cycle, error });
            }
        });

        let delay = self.timings.settle_delay();
        let actor = myself.clone();
        self.settle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor.send_message(SessionMessage::SettleElapsed { cycle });
        }));

        self.apply(effects).await;
        Ok(true)
    }

    async fn stop(&mut self, myself: &ActorRef<SessionMessage>) -> Result<bool, SessionError> {
        self.cancel_timers();
        let (cycle, effects) = self.machine.begin_stop();
        self.sync_cycle();
        tracing::info!("Stopping session (cycle {})", cycle);
        self.apply(effects).await;

        let worker = self.worker.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.request_close().await {
                tracing::warn!("Worker close request failed: {}", e);
            }
        });

        let grace = self.timings.stop_grace();
        let actor = myself.clone();
        self.cleanup = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = actor.send_message(SessionMessage::StopCleanup { cycle });
        }));
        Ok(true)
    }

    async fn toggle(&mut self, myself: &ActorRef<SessionMessage>) -> Result<bool, SessionError> {
        match self.machine.status() {
            SessionStatus::Stopped => self.start(myself).await,
            SessionStatus::Started => self.stop(myself).await,
            SessionStatus::Starting | SessionStatus::Stopping => Ok(false),
        }
    }

    fn spawn_probe(
        &self,
        myself: &ActorRef<SessionMessage>,
        reply: Option<oneshot::Sender<SessionStatus>>,
    ) {
        let worker = self.worker.clone();
        let actor = myself.clone();
        let cycle = self.machine.cycle();
        tokio::spawn(async move {
            let status = worker.probe().await;
            let _ = actor.send_message(SessionMessage::ProbeResult {
                cycle,
                status,
                reply,
            });
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Unbinding is awaited so the connection's Stopped report is stamped
    /// with the cycle that caused it.
    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(status) => {
                    tracing::info!("Session status: {}", status);
                    self.status_tx.send_replace(status);
                    self.publish(SessionEvent::Status(status));
                }
                Effect::PublishAlert(alert) => {
                    tracing::warn!("Session alert: {}", alert);
                    self.publish(SessionEvent::Alert(alert));
                }
                Effect::ConnectStreams => {
                    self.traffic.reset();
                    self.streams.connect();
                }
                Effect::DisconnectStreams => {
                    self.streams.disconnect();
                    self.traffic.reset();
                }
                Effect::Unbind => self.connection.disconnect().await,
            }
        }
    }
}

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMessage;
    type State = SessionActorState;
    type Arguments = SessionActorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let cycle = Arc::new(AtomicU64::new(0));
        args.connection.add_listener(Arc::new(ConnectionReports {
            actor: myself.clone(),
            cycle: cycle.clone(),
        }));
        args.relayed.subscribe(Arc::new(myself.clone()));

        let mut samples = args.samples;
        let actor = myself.clone();
        let forward_samples = tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                if actor.send_message(SessionMessage::Sample(sample)).is_err() {
                    break;
                }
            }
        });

        let interval = args.timings.probe_interval();
        let actor = myself.clone();
        let prober = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if actor.send_message(SessionMessage::ProbeTick).is_err() {
                    break;
                }
            }
        });

        Ok(SessionActorState {
            machine: SessionMachine::new(),
            cycle,
            worker: args.worker,
            connection: args.connection,
            streams: args.streams,
            traffic: TrafficAccountant::new(),
            settings: args.settings,
            timings: args.timings,
            status_tx: args.status_tx,
            events: args.events,
            settle: None,
            cleanup: None,
            background: vec![forward_samples, prober],
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.cancel_timers();
        for task in state.background.drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMessage::Start(reply) => {
                let result = state.start(&myself).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Start reply channel closed");
                }
            }
            SessionMessage::Stop(reply) => {
                let result = state.stop(&myself).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Stop reply channel closed");
                }
            }
            SessionMessage::Toggle(reply) => {
                let result = state.toggle(&myself).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Toggle reply channel closed");
                }
            }
            SessionMessage::Connection { cycle, status } => {
                if cycle == state.machine.cycle() {
                    let effects = state.machine.observe(status);
                    state.apply(effects).await;
                } else {
                    tracing::debug!("Dropping connection report from cycle {}", cycle);
                }
            }
            SessionMessage::Relayed(BroadcastEvent::StatusChanged(status)) => {
                let effects = state.machine.observe_relayed(status);
                state.apply(effects).await;
            }
            SessionMessage::Relayed(BroadcastEvent::Alert(alert)) => {
                let effects = state.machine.alert(alert);
                state.apply(effects).await;
            }
            SessionMessage::Relayed(BroadcastEvent::ServiceClose) => {}
            SessionMessage::LaunchFailed { cycle, error } => {
                if cycle == state.machine.cycle() {
                    tracing::info!("Launch failed: {}", error);
                    let effects = state.machine.observe(SessionStatus::Stopped);
                    state.apply(effects).await;
                }
            }
            SessionMessage::SettleElapsed { cycle } => {
                state.settle = None;
                if state.machine.settle_should_connect(cycle) {
                    state.connection.connect();
                } else {
                    tracing::debug!("Skipping worker connect for cycle {}", cycle);
                }
            }
            SessionMessage::StopCleanup { cycle } => {
                if state.machine.cycle() == cycle {
                    state.cleanup = None;
                }
                let effects = state.machine.finish_stop(cycle);
                state.apply(effects).await;
            }
            SessionMessage::Sample(sample) => {
                if state.machine.status() == SessionStatus::Started {
                    let event = state.traffic.on_sample(&sample);
                    state.publish(SessionEvent::Traffic(event));
                }
            }
            SessionMessage::ProbeTick => {
                if state.machine.status() == SessionStatus::Started {
                    state.spawn_probe(&myself, None);
                }
            }
            SessionMessage::ProbeResult {
                cycle,
                status,
                reply,
            } => {
                if cycle == state.machine.cycle() && !state.machine.status().is_transitional() {
                    let observed = status.unwrap_or(SessionStatus::Stopped);
                    let effects = state.machine.observe(observed);
                    state.apply(effects).await;
                }
                if let Some(reply) = reply {
                    if reply.send(state.machine.status()).is_err() {
                        tracing::debug!("Status reply channel closed");
                    }
                }
            }
            SessionMessage::GetStatus { probe, reply } => {
                if probe && !state.machine.status().is_transitional() {
                    state.spawn_probe(&myself, Some(reply));
                } else if reply.send(state.machine.status()).is_err() {
                    tracing::debug!("Status reply channel closed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/actor_tests.rs"]
mod tests;
