use super::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

struct FakeBinding {
    unbinds: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerBinding for FakeBinding {
    async fn unbind(self: Box<Self>) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeBinder {
    results: Mutex<VecDeque<Result<(), SessionError>>>,
    gate: Option<Arc<Notify>>,
    binds: AtomicUsize,
    unbinds: Arc<AtomicUsize>,
    losses: Mutex<Vec<LossSignal>>,
}

impl FakeBinder {
    fn with_results(results: Vec<Result<(), SessionError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerBinder for FakeBinder {
    async fn bind(&self, loss: LossSignal) -> Result<Box<dyn WorkerBinding>, SessionError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.losses.lock().push(loss);
        let next = self.results.lock().pop_front().unwrap_or(Ok(()));
        next.map(|()| {
            Box::new(FakeBinding {
                unbinds: self.unbinds.clone(),
            }) as Box<dyn WorkerBinding>
        })
    }
}

fn observe(connection: &WorkerConnection) -> mpsc::UnboundedReceiver<SessionStatus> {
    let (tx, rx) = mpsc::unbounded_channel();
    connection.add_listener(Arc::new(tx));
    rx
}

async fn next_report(rx: &mut mpsc::UnboundedReceiver<SessionStatus>) -> SessionStatus {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for report")
        .expect("listener channel closed")
}

async fn assert_no_report(rx: &mut mpsc::UnboundedReceiver<SessionStatus>) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "unexpected report: {:?}", result);
}

fn failure() -> Result<(), SessionError> {
    Err(SessionError::BindingFailed("worker not running".to_string()))
}

#[tokio::test]
async fn test_bind_success_reports_started() {
    let binder = Arc::new(FakeBinder::default());
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);

    assert!(connection.connect());

    assert_eq!(next_report(&mut reports).await, SessionStatus::Started);
    assert!(connection.is_bound());
    assert_eq!(binder.binds(), 1);
}

#[tokio::test]
async fn test_bind_failure_reports_stopped() {
    let binder = Arc::new(FakeBinder::with_results(vec![failure()]));
    let connection = WorkerConnection::new(binder);
    let mut reports = observe(&connection);

    connection.connect();

    assert_eq!(next_report(&mut reports).await, SessionStatus::Stopped);
    assert!(!connection.is_bound());
}

#[tokio::test]
async fn test_connect_is_single_flight_and_noop_when_bound() {
    let gate = Arc::new(Notify::new());
    let binder = Arc::new(FakeBinder {
        gate: Some(gate.clone()),
        ..FakeBinder::default()
    });
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);

    assert!(connection.connect());
    assert!(!connection.connect());
    gate.notify_one();
    assert_eq!(next_report(&mut reports).await, SessionStatus::Started);

    assert!(!connection.connect());
    assert_eq!(binder.binds(), 1);
}

#[tokio::test]
async fn test_disconnect_during_bind_discards_result() {
    let gate = Arc::new(Notify::new());
    let binder = Arc::new(FakeBinder {
        gate: Some(gate.clone()),
        ..FakeBinder::default()
    });
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);

    connection.connect();
    connection.disconnect().await;
    gate.notify_one();

    for _ in 0..100 {
        if binder.unbinds() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(binder.unbinds(), 1);
    assert!(!connection.is_bound());
    assert_no_report(&mut reports).await;
}

#[tokio::test]
async fn test_disconnect_reports_stopped_only_when_bound() {
    let binder = Arc::new(FakeBinder::default());
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);

    connection.disconnect().await;
    assert_no_report(&mut reports).await;

    connection.connect();
    assert_eq!(next_report(&mut reports).await, SessionStatus::Started);
    connection.disconnect().await;

    assert_eq!(next_report(&mut reports).await, SessionStatus::Stopped);
    assert_eq!(binder.unbinds(), 1);
    assert!(!connection.is_bound());
}

#[tokio::test]
async fn test_loss_retries_once_then_reports_stopped() {
    let binder = Arc::new(FakeBinder::with_results(vec![Ok(()), failure()]));
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);
    connection.connect();
    assert_eq!(next_report(&mut reports).await, SessionStatus::Started);

    let loss = binder.losses.lock()[0].clone();
    loss.fire();

    assert_eq!(next_report(&mut reports).await, SessionStatus::Stopped);
    assert_eq!(binder.binds(), 2);
    assert!(!connection.is_bound());
    assert_no_report(&mut reports).await;
    assert_eq!(binder.binds(), 2);
}

#[tokio::test]
async fn test_loss_retry_can_rebind() {
    let binder = Arc::new(FakeBinder::default());
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);
    connection.connect();
    next_report(&mut reports).await;

    let loss = binder.losses.lock()[0].clone();
    loss.fire();

    assert_eq!(next_report(&mut reports).await, SessionStatus::Started);
    assert!(connection.is_bound());
    assert_eq!(binder.binds(), 2);
}

#[tokio::test]
async fn test_stale_loss_after_disconnect_is_ignored() {
    let binder = Arc::new(FakeBinder::default());
    let connection = WorkerConnection::new(binder.clone());
    let mut reports = observe(&connection);
    connection.connect();
    next_report(&mut reports).await;
    let loss = binder.losses.lock()[0].clone();
    connection.disconnect().await;
    next_report(&mut reports).await;

    loss.fire();

    assert_no_report(&mut reports).await;
    assert_eq!(binder.binds(), 1);
}
