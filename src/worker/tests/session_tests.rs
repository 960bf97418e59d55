use super::*;
use crate::rpc::PortFileContent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{tempdir, TempDir};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const VALID_CONFIG: &str = r#"{"inbounds":[]}"#;

#[derive(Default)]
struct FakeFactory {
    create_failure: Option<EngineFailure>,
    start_failure: Option<EngineFailure>,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    /// Handed to the next engine; firing it simulates the engine dying.
    exit: Mutex<Option<oneshot::Receiver<String>>>,
}

struct FakeEngine {
    start_failure: Option<EngineFailure>,
    closed: Arc<AtomicUsize>,
    exit: Option<oneshot::Receiver<String>>,
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn create(
        &self,
        _request: &StartRequest,
        _hub: Arc<CommandHub>,
    ) -> Result<Box<dyn Engine>, EngineFailure> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.create_failure {
            return Err(failure.clone());
        }
        Ok(Box::new(FakeEngine {
            start_failure: self.start_failure.clone(),
            closed: self.closed.clone(),
            exit: self.exit.lock().take(),
        }))
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn start(&mut self) -> Result<(), EngineFailure> {
        match &self.start_failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    async fn wait(&mut self) -> String {
        match self.exit.as_mut() {
            Some(exit) => exit.await.unwrap_or_default(),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    broadcaster: Arc<EventBroadcaster>,
    port_file: Arc<PortFile>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<BroadcastEvent>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(factory: Arc<FakeFactory>, require_root: bool) -> Self {
        let dir = tempdir().unwrap();
        let broadcaster = Arc::new(EventBroadcaster::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        broadcaster.subscribe(Arc::new(events_tx));
        let port_file = Arc::new(
            PortFile::create(
                dir.path().join("worker.port"),
                PortFileContent {
                    port: 1,
                    subscriber_port: 2,
                    command_port: 0,
                    token: "token".to_string(),
                    pid: 3,
                },
            )
            .unwrap(),
        );
        let (session, status) = WorkerSession::new(
            broadcaster.clone(),
            CommandHub::new(10),
            factory,
            port_file.clone(),
            SessionOptions {
                token: "token".to_string(),
                status_interval: Duration::from_millis(50),
                require_root,
                exit_linger: Duration::from_millis(100),
            },
        );
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(commands_rx));
        Self {
            _dir: dir,
            broadcaster,
            port_file,
            commands,
            events,
            status,
            task,
        }
    }

    fn send(&self, command: WorkerCommand) {
        self.commands.send(command).unwrap();
    }

    /// Ask the session to stop the way the rpc `close` call does.
    fn close(&self) {
        self.broadcaster.service_close();
    }

    /// Events up to and including the next one matching `last`.
    async fn events_until(&mut self, last: BroadcastEvent) -> Vec<BroadcastEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = event == last;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
}

fn start_with(config: &str) -> WorkerCommand {
    WorkerCommand::Start(StartRequest {
        config: config.to_string(),
        ..StartRequest::default()
    })
}

fn status(status: SessionStatus) -> BroadcastEvent {
    BroadcastEvent::StatusChanged(status)
}

#[tokio::test]
async fn test_start_and_close_cycle() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory.clone(), false);

    harness.send(start_with(VALID_CONFIG));
    let started = harness.events_until(status(SessionStatus::Started)).await;

    assert_eq!(
        started,
        vec![status(SessionStatus::Starting), status(SessionStatus::Started)]
    );
    assert_eq!(*harness.status.borrow(), SessionStatus::Started);
    assert_ne!(harness.port_file.content().command_port, 0);

    harness.close();
    let stopped = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        stopped,
        vec![
            BroadcastEvent::ServiceClose,
            status(SessionStatus::Stopping),
            status(SessionStatus::Stopped),
        ]
    );
    assert_eq!(harness.port_file.content().command_port, 0);
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_config_alerts_then_stops() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory.clone(), false);

    harness.send(start_with("  {} "));
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        events,
        vec![
            status(SessionStatus::Starting),
            BroadcastEvent::Alert(AlertEvent::new(AlertKind::EmptyConfiguration, None)),
            status(SessionStatus::Stopped),
        ]
    );
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_failure_raises_create_service_alert() {
    let factory = Arc::new(FakeFactory {
        create_failure: Some(EngineFailure::Failed("bad binary".to_string())),
        ..FakeFactory::default()
    });
    let mut harness = Harness::start(factory, false);

    harness.send(start_with(VALID_CONFIG));
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        events[1],
        BroadcastEvent::Alert(AlertEvent::new(
            AlertKind::CreateService,
            Some("bad binary".to_string())
        ))
    );
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_start_failure_closes_engine_and_reports_no_address() {
    let factory = Arc::new(FakeFactory {
        start_failure: Some(EngineFailure::NoVpnAddress),
        ..FakeFactory::default()
    });
    let mut harness = Harness::start(factory.clone(), false);

    harness.send(start_with(VALID_CONFIG));
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        events[1],
        BroadcastEvent::Alert(AlertEvent::new(AlertKind::VpnNoAddress, None))
    );
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.port_file.content().command_port, 0);
}

#[tokio::test]
async fn test_service_close_broadcast_stops_session() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory, false);
    harness.send(start_with(VALID_CONFIG));
    harness.events_until(status(SessionStatus::Started)).await;

    harness.broadcaster.service_close();
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        events,
        vec![
            BroadcastEvent::ServiceClose,
            status(SessionStatus::Stopping),
            status(SessionStatus::Stopped),
        ]
    );
}

#[tokio::test]
async fn test_second_start_is_ignored_while_started() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory.clone(), false);
    harness.send(start_with(VALID_CONFIG));
    harness.events_until(status(SessionStatus::Started)).await;

    harness.send(start_with(VALID_CONFIG));
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.close();
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(events.len(), 3);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_engine_death_stops_session() {
    let (exit_tx, exit_rx) = oneshot::channel();
    let factory = Arc::new(FakeFactory {
        exit: Mutex::new(Some(exit_rx)),
        ..FakeFactory::default()
    });
    let mut harness = Harness::start(factory, false);
    harness.send(start_with(VALID_CONFIG));
    harness.events_until(status(SessionStatus::Started)).await;

    exit_tx.send("engine exited (signal 9)".to_string()).unwrap();
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(events.first(), Some(&status(SessionStatus::Stopping)));
}

#[tokio::test]
async fn test_reload_restarts_engine() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory.clone(), false);
    harness.send(start_with(VALID_CONFIG));
    harness.events_until(status(SessionStatus::Started)).await;

    harness.send(WorkerCommand::Reload);
    let events = harness.events_until(status(SessionStatus::Started)).await;

    assert_eq!(
        events,
        vec![status(SessionStatus::Starting), status(SessionStatus::Started)]
    );
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_worker_exits_after_linger_once_stopped() {
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory, false);
    harness.send(start_with(VALID_CONFIG));
    harness.events_until(status(SessionStatus::Started)).await;
    harness.close();
    harness.events_until(status(SessionStatus::Stopped)).await;

    tokio::time::timeout(Duration::from_secs(5), &mut harness.task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_require_root_alerts_for_unprivileged_worker() {
    if running_as_root() {
        return;
    }
    let factory = Arc::new(FakeFactory::default());
    let mut harness = Harness::start(factory, true);

    harness.send(start_with(VALID_CONFIG));
    let events = harness.events_until(status(SessionStatus::Stopped)).await;

    assert_eq!(
        events[1],
        BroadcastEvent::Alert(AlertEvent::new(AlertKind::RequestVpnPermission, None))
    );
}

#[test]
fn test_empty_config_detection() {
    assert!(is_empty_config(""));
    assert!(is_empty_config(" \n"));
    assert!(is_empty_config("{}"));
    assert!(!is_empty_config(VALID_CONFIG));
}
