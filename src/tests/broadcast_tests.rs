use super::*;
use tokio::sync::mpsc;

#[test]
fn test_publish_without_listeners_is_fine() {
    let broadcaster = EventBroadcaster::new();
    broadcaster.status_changed(SessionStatus::Started);
    assert_eq!(broadcaster.listener_count(), 0);
}

#[test]
fn test_alert_then_status_order_is_preserved() {
    let broadcaster = EventBroadcaster::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broadcaster.subscribe(Arc::new(tx));

    broadcaster.alert(AlertKind::EmptyConfiguration, None);
    broadcaster.status_changed(SessionStatus::Stopped);

    assert_eq!(
        rx.try_recv().unwrap(),
        BroadcastEvent::Alert(AlertEvent::new(AlertKind::EmptyConfiguration, None))
    );
    assert_eq!(
        rx.try_recv().unwrap(),
        BroadcastEvent::StatusChanged(SessionStatus::Stopped)
    );
}

#[test]
fn test_late_subscriber_gets_no_replay() {
    let broadcaster = EventBroadcaster::new();
    broadcaster.status_changed(SessionStatus::Started);

    let (tx, mut rx) = mpsc::unbounded_channel();
    broadcaster.subscribe(Arc::new(tx));

    assert!(rx.try_recv().is_err());
    broadcaster.service_close();
    assert_eq!(rx.try_recv().unwrap(), BroadcastEvent::ServiceClose);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let broadcaster = EventBroadcaster::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = broadcaster.subscribe(Arc::new(tx));

    broadcaster.unsubscribe(id);
    broadcaster.status_changed(SessionStatus::Stopping);

    assert!(rx.try_recv().is_err());
}
