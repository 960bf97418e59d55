//! Control-side access to the worker process over tarpc.
//!
//! [`WorkerEndpoint`] finds a running worker through its port file or spawns
//! one. [`RpcWorker`] builds on it to launch sessions, relay the worker's
//! broadcasts into the local [`EventBroadcaster`], and bind with a ping
//! watchdog.

use crate::broadcast::{BroadcastEvent, EventBroadcaster};
use crate::control::worker_connection::{LossSignal, WorkerBinder, WorkerBinding};
use crate::error::{AlertEvent, SessionError};
use crate::paths::{SessionPaths, HOME_ENV};
use crate::rpc::worker_service::{EventCallback, WorkerServiceClient};
use crate::rpc::{ConnectionQuery, PortFileContent, SessionStatus, StartRequest, WorkerError};
use crate::BUILD_SHA;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tarpc::client;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Maximum connection attempts after spawning.
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;

/// How long the relay waits for the worker to register it.
const RELAY_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Operations the session actor needs from the worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Whether this process is able to start a worker at all.
    fn can_launch(&self) -> bool;

    /// Make sure a worker runs, attach the event relay, and ask it to start.
    async fn launch(&self, request: StartRequest) -> Result<(), SessionError>;

    /// Ask a running worker to stop its session. No worker is not an error.
    async fn request_close(&self) -> Result<(), SessionError>;

    /// Worker-side status, `None` when no worker answers.
    async fn probe(&self) -> Option<SessionStatus>;

    async fn find_connection_owner(&self, query: ConnectionQuery) -> Result<u32, SessionError>;
}

/// An authenticated connection to one worker.
pub struct WorkerClient {
    pub client: WorkerServiceClient,
    pub info: PortFileContent,
}

/// Locates or spawns the worker for one storage home.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    paths: SessionPaths,
    spawn_timeout: Duration,
}

impl WorkerEndpoint {
    pub fn new(paths: SessionPaths, spawn_timeout: Duration) -> Self {
        Self {
            paths,
            spawn_timeout,
        }
    }

    fn read_port_file(&self) -> Option<PortFileContent> {
        let content = std::fs::read_to_string(self.paths.worker_port_path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Connect to an already running worker. Never spawns.
    pub async fn connect_existing(&self) -> Result<WorkerClient> {
        let info = self.read_port_file().context("No worker port file")?;
        Self::try_connect(info).await
    }

    /// Connect to the worker or spawn it if not running.
    pub async fn connect_or_spawn(&self) -> Result<WorkerClient> {
        if let Some(info) = self.read_port_file() {
            if let Ok(worker) = Self::try_connect(info).await {
                check_build(&worker).await;
                return Ok(worker);
            }
        }

        // Need to spawn the worker - acquire lock
        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.paths.worker_lock_path())
            .context("Failed to open lock file")?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let spawned = self.spawn_worker_and_wait().await;
                FileExt::unlock(&lock_file)?;
                spawned?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Another control process is spawning
                self.wait_for_port_file().await?;
            }
            Err(e) => {
                return Err(e).context("Failed to acquire lock");
            }
        }

        let worker = self.connect_with_retry().await?;
        check_build(&worker).await;
        Ok(worker)
    }

    async fn try_connect(info: PortFileContent) -> Result<WorkerClient> {
        use tarpc::serde_transport::tcp;

        let addr = format!("127.0.0.1:{}", info.port);
        let transport = tcp::connect(&addr, Bincode::default).await?;
        let client = WorkerServiceClient::new(client::Config::default(), transport).spawn();

        match client
            .authenticate(tarpc::context::current(), info.token.clone())
            .await?
        {
            Ok(()) => Ok(WorkerClient { client, info }),
            Err(WorkerError::AuthenticationFailed) => anyhow::bail!("Authentication failed"),
            Err(e) => anyhow::bail!("Worker error: {}", e),
        }
    }

    /// Spawn the worker and wait for its port file.
    ///
    /// Only called when connecting to an existing worker failed, so a worker
    /// recorded in the pid file is considered hung and killed first.
    async fn spawn_worker_and_wait(&self) -> Result<()> {
        let pid_path = self.paths.worker_pid_path();
        let port_path = self.paths.worker_port_path();

        if let Some(pid) = std::fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|pid| *pid != std::process::id())
        {
            kill_stale_worker(pid);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(&port_path);

        let exe = std::env::current_exe()
            .or_else(|_| which::which("tunnel"))
            .context("Failed to find tunnel binary")?;
        tracing::info!("Spawning worker: {}", exe.display());

        // The worker must use the same storage home as this process.
        std::process::Command::new(&exe)
            .arg("worker")
            .env(HOME_ENV, self.paths.home())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("Failed to spawn worker")?;

        self.wait_for_port_file().await
    }

    async fn wait_for_port_file(&self) -> Result<()> {
        let start = std::time::Instant::now();
        while start.elapsed() < self.spawn_timeout {
            if self.read_port_file().is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("Timeout waiting for worker port file")
    }

    /// Connect with retry and exponential backoff.
    async fn connect_with_retry(&self) -> Result<WorkerClient> {
        let mut delay_ms = BASE_DELAY_MS;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if let Some(info) = self.read_port_file() {
                if let Ok(worker) = Self::try_connect(info).await {
                    return Ok(worker);
                }
            }

            if attempt < MAX_CONNECT_ATTEMPTS {
                // Add jitter (±25%)
                let jitter = (delay_ms as f64 * 0.25 * (rand::random::<f64>() * 2.0 - 1.0)) as i64;
                let actual_delay = (delay_ms as i64 + jitter).max(10) as u64;
                tokio::time::sleep(Duration::from_millis(actual_delay)).await;
                delay_ms *= 2;
            }
        }

        anyhow::bail!("Failed to connect after {} attempts", MAX_CONNECT_ATTEMPTS)
    }
}

fn kill_stale_worker(pid: u32) {
    tracing::info!("Killing stale worker process {}", pid);
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Ok(raw) = i32::try_from(pid) {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
                tracing::debug!("Kill of stale worker {} failed: {}", pid, e);
            }
        }
    }
}

async fn check_build(worker: &WorkerClient) {
    match worker.client.build_sha(tarpc::context::current()).await {
        Ok(sha) if sha != BUILD_SHA => {
            tracing::warn!("Worker build {} differs from control build {}", sha, BUILD_SHA);
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Worker build check failed: {}", e),
    }
}

/// EventCallback server fed by the worker. Publishes into the local
/// broadcaster after swallowing the registration snapshot.
#[derive(Clone)]
struct EventRelay {
    broadcaster: Arc<EventBroadcaster>,
    ready: Arc<Mutex<Option<oneshot::Sender<SessionStatus>>>>,
}

impl EventCallback for EventRelay {
    async fn status_changed(self, _: tarpc::context::Context, status: SessionStatus) {
        let ready = self.ready.lock().take();
        match ready {
            Some(ready) => {
                if ready.send(status).is_err() {
                    tracing::debug!("Relay ready channel closed");
                }
            }
            None => self.broadcaster.status_changed(status),
        }
    }

    async fn alert(self, _: tarpc::context::Context, event: AlertEvent) {
        self.broadcaster.publish(BroadcastEvent::Alert(event));
    }

    async fn ping(self, _: tarpc::context::Context) -> bool {
        true
    }
}

struct RelayHandle {
    pid: u32,
    task: JoinHandle<()>,
}

/// [`WorkerLauncher`] and [`WorkerBinder`] over the worker's tarpc services.
pub struct RpcWorker {
    endpoint: WorkerEndpoint,
    events: Arc<EventBroadcaster>,
    relay: tokio::sync::Mutex<Option<RelayHandle>>,
    watchdog_interval: Duration,
}

impl RpcWorker {
    pub fn new(
        endpoint: WorkerEndpoint,
        events: Arc<EventBroadcaster>,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            endpoint,
            events,
            relay: tokio::sync::Mutex::new(None),
            watchdog_interval,
        }
    }

    /// Subscribe to the worker's broadcasts unless already subscribed to
    /// this worker instance.
    async fn ensure_relay(&self, info: &PortFileContent) -> Result<()> {
        use tarpc::serde_transport::tcp;

        let mut relay = self.relay.lock().await;
        if let Some(handle) = relay.as_ref() {
            if handle.pid == info.pid && !handle.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = relay.take() {
            stale.task.abort();
        }

        let addr = format!("127.0.0.1:{}", info.subscriber_port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .context("Failed to connect to subscriber port")?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = EventRelay {
            broadcaster: self.events.clone(),
            ready: Arc::new(Mutex::new(Some(ready_tx))),
        };
        let task = tokio::spawn(async move {
            server::BaseChannel::with_defaults(transport)
                .execute(handler.serve())
                .for_each(|response| async {
                    tokio::spawn(response);
                })
                .await;
            tracing::debug!("Event relay ended");
        });

        match tokio::time::timeout(RELAY_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(status)) => {
                tracing::debug!("Event relay attached to worker {} ({})", info.pid, status);
            }
            _ => {
                task.abort();
                anyhow::bail!("Worker did not register the event relay");
            }
        }
        *relay = Some(RelayHandle {
            pid: info.pid,
            task,
        });
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for RpcWorker {
    fn can_launch(&self) -> bool {
        std::env::current_exe().is_ok()
    }

    async fn launch(&self, request: StartRequest) -> Result<(), SessionError> {
        let worker = self
            .endpoint
            .connect_or_spawn()
            .await
            .map_err(|e| SessionError::BindingFailed(format!("{:#}", e)))?;
        self.ensure_relay(&worker.info)
            .await
            .map_err(|e| SessionError::BindingFailed(format!("{:#}", e)))?;

        match worker.client.start(tarpc::context::current(), request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::BindingFailed(e.to_string())),
            Err(e) => Err(SessionError::BindingFailed(e.to_string())),
        }
    }

    async fn request_close(&self) -> Result<(), SessionError> {
        let worker = match self.endpoint.connect_existing().await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::debug!("No worker to close: {:#}", e);
                return Ok(());
            }
        };
        match worker.client.close(tarpc::context::current()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::BindingFailed(e.to_string())),
            Err(e) => Err(SessionError::BindingFailed(e.to_string())),
        }
    }

    async fn probe(&self) -> Option<SessionStatus> {
        let worker = self.endpoint.connect_existing().await.ok()?;
        match worker.client.status(tarpc::context::current()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    async fn find_connection_owner(&self, query: ConnectionQuery) -> Result<u32, SessionError> {
        let worker = self
            .endpoint
            .connect_existing()
            .await
            .map_err(|e| SessionError::ConnectionOwnerLookupFailed(format!("{:#}", e)))?;
        match worker
            .client
            .find_connection_owner(tarpc::context::current(), query)
            .await
        {
            Ok(Ok(uid)) => Ok(uid),
            Ok(Err(e)) => Err(SessionError::ConnectionOwnerLookupFailed(e.to_string())),
            Err(e) => Err(SessionError::ConnectionOwnerLookupFailed(e.to_string())),
        }
    }
}

/// A binding kept alive by a ping watchdog.
struct RpcBinding {
    watchdog: JoinHandle<()>,
}

impl Drop for RpcBinding {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[async_trait]
impl WorkerBinding for RpcBinding {
    async fn unbind(self: Box<Self>) {
        tracing::debug!("Worker binding released");
    }
}

#[async_trait]
impl WorkerBinder for RpcWorker {
    async fn bind(&self, loss: LossSignal) -> Result<Box<dyn WorkerBinding>, SessionError> {
        let worker = self
            .endpoint
            .connect_existing()
            .await
            .map_err(|e| SessionError::BindingFailed(format!("{:#}", e)))?;
        let status = match worker.client.status(tarpc::context::current()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(SessionError::BindingFailed(e.to_string())),
            Err(e) => return Err(SessionError::BindingFailed(e.to_string())),
        };
        if !matches!(status, SessionStatus::Starting | SessionStatus::Started) {
            return Err(SessionError::BindingFailed(format!(
                "worker session is {}",
                status
            )));
        }

        let client = worker.client;
        let interval = self.watchdog_interval;
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !matches!(client.ping(tarpc::context::current()).await, Ok(true)) {
                    tracing::info!("Worker stopped answering pings");
                    loss.fire();
                    break;
                }
            }
        });
        Ok(Box::new(RpcBinding { watchdog }))
    }
}

#[cfg(test)]
#[path = "tests/rpc_worker_tests.rs"]
mod tests;
