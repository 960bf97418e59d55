//! These tests run a real worker in-process and talk to it over localhost TCP.

use super::*;
use crate::config::{EngineConfig, SessionConfig};
use crate::control::worker_connection::WorkerConnection;
use crate::error::AlertKind;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

async fn start_worker(dir: &TempDir) -> SessionPaths {
    let paths = SessionPaths::new(dir.path()).unwrap();
    let mut config = SessionConfig::default();
    config.engine = EngineConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 30".to_string()],
        interface: None,
        require_root: false,
        startup_grace_ms: 20,
    };
    config.worker.exit_linger_ms = 30_000;
    tokio::spawn(crate::worker::run_worker(paths.clone(), config));

    for _ in 0..100 {
        if paths.worker_port_path().exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    paths
}

fn rpc_worker(paths: SessionPaths) -> (RpcWorker, mpsc::UnboundedReceiver<BroadcastEvent>) {
    let events = Arc::new(EventBroadcaster::new());
    let (tx, rx) = mpsc::unbounded_channel();
    events.subscribe(Arc::new(tx));
    let worker = RpcWorker::new(
        WorkerEndpoint::new(paths, Duration::from_millis(500)),
        events,
        Duration::from_millis(100),
    );
    (worker, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<BroadcastEvent>) -> BroadcastEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn valid_request() -> StartRequest {
    StartRequest {
        config: r#"{"log":{}}"#.to_string(),
        ..StartRequest::default()
    }
}

#[tokio::test]
async fn test_probe_without_worker_is_none() {
    let dir = tempdir().unwrap();
    let (worker, _events) = rpc_worker(SessionPaths::new(dir.path()).unwrap());

    assert_eq!(worker.probe().await, None);
    assert_eq!(worker.request_close().await, Ok(()));
}

#[tokio::test]
async fn test_launch_relays_worker_status() {
    let dir = tempdir().unwrap();
    let paths = start_worker(&dir).await;
    let (worker, mut events) = rpc_worker(paths);

    assert_eq!(worker.probe().await, Some(SessionStatus::Stopped));
    worker.launch(valid_request()).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Starting)
    );
    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Started)
    );
    assert_eq!(worker.probe().await, Some(SessionStatus::Started));

    worker.request_close().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Stopping)
    );
    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Stopped)
    );
}

#[tokio::test]
async fn test_empty_config_relays_alert_then_stopped() {
    let dir = tempdir().unwrap();
    let paths = start_worker(&dir).await;
    let (worker, mut events) = rpc_worker(paths);

    worker
        .launch(StartRequest {
            config: "{}".to_string(),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Starting)
    );
    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::Alert(AlertEvent::new(AlertKind::EmptyConfiguration, None))
    );
    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::StatusChanged(SessionStatus::Stopped)
    );
}

#[tokio::test]
async fn test_bind_requires_running_session() {
    let dir = tempdir().unwrap();
    let paths = start_worker(&dir).await;
    let (worker, mut events) = rpc_worker(paths);
    let worker = Arc::new(worker);
    let connection = WorkerConnection::new(worker.clone());
    let (tx, mut reports) = mpsc::unbounded_channel();
    connection.add_listener(Arc::new(tx));

    connection.connect();
    let first = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(SessionStatus::Stopped));

    worker.launch(valid_request()).await.unwrap();
    next_event(&mut events).await;
    next_event(&mut events).await;
    connection.connect();
    let second = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap();

    assert_eq!(second, Some(SessionStatus::Started));
    assert!(connection.is_bound());
}

#[tokio::test]
async fn test_connection_owner_lookup_without_worker_fails() {
    let dir = tempdir().unwrap();
    let (worker, _events) = rpc_worker(SessionPaths::new(dir.path()).unwrap());

    let result = worker
        .find_connection_owner(ConnectionQuery {
            protocol: crate::rpc::IpProtocol::Tcp,
            source: "127.0.0.1:1".parse().unwrap(),
            destination: "127.0.0.1:2".parse().unwrap(),
        })
        .await;

    assert!(matches!(
        result,
        Err(SessionError::ConnectionOwnerLookupFailed(_))
    ));
}
