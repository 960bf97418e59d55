use super::*;
use crate::rpc::StatusSample;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<CommandMessage>,
    closed: Arc<AtomicU32>,
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn next_message(&mut self) -> anyhow::Result<Option<CommandMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `failures` attempts, then hands out channel-backed transports.
struct ScriptedConnector {
    attempts: AtomicU32,
    failures: u32,
    connect_delay: Duration,
    senders: Mutex<Vec<mpsc::UnboundedSender<CommandMessage>>>,
    closed: Arc<AtomicU32>,
}

impl ScriptedConnector {
    fn new(failures: u32) -> Arc<Self> {
        Self::with_delay(failures, Duration::ZERO)
    }

    fn with_delay(failures: u32, connect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            failures,
            connect_delay,
            senders: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicU32::new(0)),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn send(&self, message: CommandMessage) {
        for tx in self.senders.lock().iter() {
            let _ = tx.send(message.clone());
        }
    }

    fn drop_remote(&self) {
        self.senders.lock().clear();
    }
}

#[async_trait]
impl CommandConnector for ScriptedConnector {
    async fn connect(&self, _kind: CommandKind) -> anyhow::Result<Box<dyn CommandTransport>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if attempt <= self.failures {
            anyhow::bail!("connection refused");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        Ok(Box::new(ChannelTransport {
            rx,
            closed: self.closed.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl CommandHandler for RecordingHandler {
    fn on_connected(&self) {
        self.events.lock().push("connected".to_string());
    }

    fn on_disconnected(&self) {
        self.events.lock().push("disconnected".to_string());
    }

    fn update_status(&self, sample: StatusSample) {
        self.events
            .lock()
            .push(format!("status:{}", sample.uplink_total));
    }

    fn append_logs(&self, lines: Vec<String>) {
        self.events.lock().push(format!("logs:{}", lines.join("|")));
    }
}

fn client_for(
    kind: CommandKind,
    connector: Arc<ScriptedConnector>,
) -> (Arc<CommandChannelClient>, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let client = CommandChannelClient::new(
        kind,
        CommandChannelConfig::default(),
        connector,
        handler.clone(),
    );
    (client, handler)
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_connects_after_failed_attempts() {
    let connector = ScriptedConnector::new(2);
    let (client, handler) = client_for(CommandKind::Status, connector.clone());

    assert!(client.connect());
    assert!(!client.is_connected());
    settle().await;

    assert!(client.is_connected());
    assert_eq!(connector.attempts(), 3);
    assert_eq!(handler.events(), vec!["connected"]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_is_single_flight() {
    let connector = ScriptedConnector::new(0);
    let (client, _handler) = client_for(CommandKind::Status, connector.clone());

    let first = client.connect();
    let second = client.connect();
    settle().await;
    let third = client.connect();

    assert!(first);
    assert!(!second);
    assert!(!third, "connect must be refused while a client is stored");
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let connector = ScriptedConnector::new(u32::MAX);
    let (client, _handler) = client_for(CommandKind::Log, connector.clone());

    client.connect();
    settle().await;

    assert_eq!(connector.attempts(), 10);
    assert!(!client.is_connected());
    assert!(client.connect(), "a new sequence may start after giving up");
}

#[tokio::test(start_paused = true)]
async fn test_first_attempt_waits_initial_backoff() {
    let connector = ScriptedConnector::new(0);
    let (client, _handler) = client_for(CommandKind::Status, connector.clone());

    client.connect();
    tokio::time::sleep(Duration::from_millis(140)).await;
    assert_eq!(connector.attempts(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_retry_sequence() {
    let connector = ScriptedConnector::new(u32::MAX);
    let (client, _handler) = client_for(CommandKind::Status, connector.clone());

    client.connect();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let before = connector.attempts();
    client.disconnect();
    settle().await;

    assert_eq!(connector.attempts(), before);
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_attempt_discards_connection() {
    let connector = ScriptedConnector::with_delay(0, Duration::from_secs(1));
    let (client, handler) = client_for(CommandKind::Status, connector.clone());

    client.connect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.attempts(), 1);
    client.disconnect();
    settle().await;

    assert!(!client.is_connected());
    assert!(handler.events().is_empty());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_stored_client() {
    let connector = ScriptedConnector::new(0);
    let (client, handler) = client_for(CommandKind::Status, connector.clone());
    client.connect();
    settle().await;
    assert!(client.is_connected());

    client.disconnect();
    assert!(!client.is_connected());
    settle().await;

    assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    assert_eq!(handler.events(), vec!["connected", "disconnected"]);
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_clears_handle() {
    let connector = ScriptedConnector::new(0);
    let (client, handler) = client_for(CommandKind::Status, connector.clone());
    client.connect();
    settle().await;

    connector.drop_remote();
    settle().await;

    assert!(!client.is_connected());
    assert_eq!(handler.events(), vec!["connected", "disconnected"]);
    assert!(client.connect());
    settle().await;
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_only_own_kind() {
    let connector = ScriptedConnector::new(0);
    let (client, handler) = client_for(CommandKind::Status, connector.clone());
    client.connect();
    settle().await;

    connector.send(CommandMessage::Status {
        sample: StatusSample {
            uplink_total: 42,
            ..StatusSample::default()
        },
    });
    connector.send(CommandMessage::Logs {
        lines: vec!["ignored".to_string()],
    });
    settle().await;

    assert_eq!(handler.events(), vec!["connected", "status:42"]);
}
