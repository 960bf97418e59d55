//! RPC server implementation for the worker.
//!
//! Implements the tarpc WorkerService trait for control processes and pushes
//! broadcaster events to EventCallback subscribers.

use crate::broadcast::{BroadcastEvent, EventBroadcaster};
use crate::config::SessionConfig;
use crate::paths::SessionPaths;
use crate::rpc::worker_service::{EventCallbackClient, WorkerService};
use crate::rpc::{
    ConnectionQuery, PortFileContent, SessionStatus, StartRequest, WorkerError, WorkerResult,
};
use crate::worker::engine::ProcessEngineFactory;
use crate::worker::hub::CommandHub;
use crate::worker::owner;
use crate::worker::port_file::PortFile;
use crate::worker::session::{SessionOptions, WorkerCommand, WorkerSession};
use crate::BUILD_SHA;
use anyhow::Context;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

/// How often idle subscribers are pinged.
const SUBSCRIBER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Server implementation for WorkerService.
#[derive(Clone)]
pub struct WorkerServer {
    status: watch::Receiver<SessionStatus>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    broadcaster: Arc<EventBroadcaster>,
    /// Expected auth token for connections.
    expected_token: Option<String>,
    /// Whether this connection has been authenticated.
    authenticated: Arc<Mutex<bool>>,
}

impl WorkerServer {
    pub fn new(
        status: watch::Receiver<SessionStatus>,
        commands: mpsc::UnboundedSender<WorkerCommand>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            status,
            commands,
            broadcaster,
            expected_token: None,
            authenticated: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_auth_token(mut self, token: String) -> Self {
        self.expected_token = Some(token);
        self
    }

    async fn check_authenticated(&self) -> WorkerResult<()> {
        if self.expected_token.is_some() {
            let auth = self.authenticated.lock().await;
            if !*auth {
                return Err(WorkerError::AuthenticationFailed);
            }
        }
        Ok(())
    }

    fn submit(&self, command: WorkerCommand) -> WorkerResult<()> {
        self.commands
            .send(command)
            .map_err(|_| WorkerError::ShuttingDown)
    }
}

impl WorkerService for WorkerServer {
    async fn authenticate(self, _: tarpc::context::Context, token: String) -> WorkerResult<()> {
        if let Some(expected) = &self.expected_token {
            if token == *expected {
                let mut auth = self.authenticated.lock().await;
                *auth = true;
                tracing::debug!("Client authenticated successfully");
                return Ok(());
            }
        }
        tracing::warn!("Client authentication failed");
        Err(WorkerError::AuthenticationFailed)
    }

    async fn start(self, _: tarpc::context::Context, request: StartRequest) -> WorkerResult<()> {
        self.check_authenticated().await?;
        self.submit(WorkerCommand::Start(request))
    }

    async fn close(self, _: tarpc::context::Context) -> WorkerResult<()> {
        self.check_authenticated().await?;
        self.broadcaster.service_close();
        Ok(())
    }

    async fn reload(self, _: tarpc::context::Context) -> WorkerResult<()> {
        self.check_authenticated().await?;
        self.submit(WorkerCommand::Reload)
    }

    async fn status(self, _: tarpc::context::Context) -> WorkerResult<SessionStatus> {
        self.check_authenticated().await?;
        Ok(*self.status.borrow())
    }

    async fn find_connection_owner(
        self,
        _: tarpc::context::Context,
        query: ConnectionQuery,
    ) -> WorkerResult<u32> {
        self.check_authenticated().await?;
        tokio::task::spawn_blocking(move || owner::find_connection_owner(&query))
            .await
            .map_err(|e| WorkerError::Internal {
                message: e.to_string(),
            })?
            .map_err(|e| WorkerError::ConnectionOwnerNotFound {
                message: e.to_string(),
            })
    }

    async fn build_sha(self, _: tarpc::context::Context) -> String {
        BUILD_SHA.to_string()
    }

    async fn ping(self, _: tarpc::context::Context) -> bool {
        true
    }
}

/// Run the worker RPC server until shutdown.
pub async fn run_worker_server(
    server: WorkerServer,
    shutdown_tx: broadcast::Sender<()>,
    auth_token: String,
    port: u16,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;

    tracing::info!("RPC server listening on {}", addr);

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        // Every connection authenticates on its own.
                        let server = WorkerServer::new(
                            server.status.clone(),
                            server.commands.clone(),
                            server.broadcaster.clone(),
                        ).with_auth_token(auth_token.clone());

                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Run the subscriber listener.
///
/// Every subscriber first receives the current status once it is registered,
/// then every broadcast in publish order.
///
/// Security model: the port binds to 127.0.0.1 only and a subscriber is
/// expected to authenticate over the main RPC port first.
pub async fn run_subscriber_listener(
    broadcaster: Arc<EventBroadcaster>,
    status: watch::Receiver<SessionStatus>,
    shutdown_tx: broadcast::Sender<()>,
    subscriber_port: u16,
) -> anyhow::Result<()> {
    use tarpc::client;
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", subscriber_port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;

    tracing::info!("Subscriber listener on {} (localhost only)", addr);

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let callback_client = EventCallbackClient::new(
                            client::Config::default(),
                            transport,
                        ).spawn();
                        tokio::spawn(forward_events(
                            callback_client,
                            broadcaster.clone(),
                            status.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Subscriber accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Deliver broadcaster events to one subscriber in publish order. A failed
/// call or ping removes the subscriber.
async fn forward_events(
    client: EventCallbackClient,
    broadcaster: Arc<EventBroadcaster>,
    status: watch::Receiver<SessionStatus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber_id = broadcaster.subscribe(Arc::new(tx));
    tracing::info!("Subscriber connected: {}", subscriber_id);

    let current = *status.borrow();
    if client
        .status_changed(tarpc::context::current(), current)
        .await
        .is_err()
    {
        broadcaster.unsubscribe(subscriber_id);
        tracing::info!("Subscriber removed before ready: {}", subscriber_id);
        return;
    }

    let mut ping = tokio::time::interval(SUBSCRIBER_PING_INTERVAL);
    ping.tick().await;

    loop {
        let alive = tokio::select! {
            event = rx.recv() => match event {
                Some(BroadcastEvent::StatusChanged(status)) => client
                    .status_changed(tarpc::context::current(), status)
                    .await
                    .is_ok(),
                Some(BroadcastEvent::Alert(alert)) => client
                    .alert(tarpc::context::current(), alert)
                    .await
                    .is_ok(),
                // Service-close is consumed inside the worker.
                Some(BroadcastEvent::ServiceClose) => true,
                None => false,
            },
            _ = ping.tick() => matches!(client.ping(tarpc::context::current()).await, Ok(true)),
            _ = shutdown_rx.recv() => false,
        };
        if !alive {
            break;
        }
    }

    broadcaster.unsubscribe(subscriber_id);
    tracing::info!("Subscriber removed: {}", subscriber_id);
}

/// Find an available TCP port.
pub async fn find_available_port() -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn generate_token() -> String {
    rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Main entry point for `tunnel worker`.
///
/// Serves until the session has been idle long enough, a termination signal
/// arrives, or the RPC server fails.
pub async fn run_worker(paths: SessionPaths, config: SessionConfig) -> anyhow::Result<()> {
    let pid = std::process::id();
    let pid_path = paths.worker_pid_path();
    std::fs::write(&pid_path, pid.to_string()).context("Failed to write PID file")?;

    let auth_token = generate_token();
    let main_port = find_available_port().await?;
    let subscriber_port = find_available_port().await?;

    let port_file = Arc::new(PortFile::create(
        paths.worker_port_path(),
        PortFileContent {
            port: main_port,
            subscriber_port,
            command_port: 0,
            token: auth_token.clone(),
            pid,
        },
    )?);

    tracing::info!(
        "Worker {} starting on ports {} (main) and {} (subscriber)",
        pid,
        main_port,
        subscriber_port
    );

    let broadcaster = Arc::new(EventBroadcaster::new());
    let hub = CommandHub::new(config.command.log_buffer);
    let factory = Arc::new(ProcessEngineFactory::new(
        config.engine.clone(),
        paths.run_dir()?,
    ));
    let (session, status) = WorkerSession::new(
        broadcaster.clone(),
        hub,
        factory,
        port_file.clone(),
        SessionOptions {
            token: auth_token.clone(),
            status_interval: config.command.status_interval(),
            require_root: config.engine.require_root,
            exit_linger: Duration::from_millis(config.worker.exit_linger_ms),
        },
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let session_shutdown = shutdown_tx.clone();
    let session_task = tokio::spawn(async move {
        session.run(commands_rx).await;
        let _ = session_shutdown.send(());
    });

    let sub_broadcaster = broadcaster.clone();
    let sub_status = status.clone();
    let sub_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            run_subscriber_listener(sub_broadcaster, sub_status, sub_shutdown, subscriber_port)
                .await
        {
            tracing::error!("Subscriber listener error: {}", e);
        }
    });

    let signal_commands = commands_tx.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("Termination signal received");
        let _ = signal_commands.send(WorkerCommand::Shutdown);
    });

    let server = WorkerServer::new(status, commands_tx.clone(), broadcaster);
    let served = run_worker_server(server, shutdown_tx.clone(), auth_token, main_port).await;

    let _ = commands_tx.send(WorkerCommand::Shutdown);
    let _ = session_task.await;
    let _ = shutdown_tx.send(());

    port_file.remove();
    let _ = std::fs::remove_file(&pid_path);
    tracing::info!("Worker {} exited", pid);

    served
}

#[cfg(test)]
#[path = "tests/rpc_server_tests.rs"]
mod tests;
