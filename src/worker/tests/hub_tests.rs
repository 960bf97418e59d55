use super::*;

#[test]
fn test_log_subscriber_gets_history_then_updates() {
    let hub = CommandHub::new(2);
    hub.append_log("a");
    hub.append_log("b");
    hub.append_log("c");

    let (initial, mut updates) = hub.subscribe(CommandKind::Log);
    hub.append_log("d");

    assert_eq!(
        initial,
        vec![CommandMessage::Logs {
            lines: vec!["b".to_string(), "c".to_string()],
        }]
    );
    assert_eq!(
        updates.try_recv().unwrap(),
        CommandMessage::Logs {
            lines: vec!["d".to_string()],
        }
    );
}

#[test]
fn test_empty_log_history_sends_nothing_initially() {
    let hub = CommandHub::new(10);

    let (initial, _updates) = hub.subscribe(CommandKind::Log);

    assert!(initial.is_empty());
}

#[test]
fn test_reset_keeps_logs_and_drops_engine_state() {
    let hub = CommandHub::new(10);
    hub.append_log("kept");
    hub.record_status(StatusSample {
        uplink_total: 5,
        ..StatusSample::default()
    });
    hub.set_modes(vec!["rule".to_string()], "rule".to_string());

    hub.reset();

    assert_eq!(hub.latest_status(), StatusSample::default());
    assert!(hub.subscribe(CommandKind::Mode).0.is_empty());
    assert_eq!(hub.subscribe(CommandKind::Log).0.len(), 1);
}

#[test]
fn test_mode_snapshot_tracks_changes() {
    let hub = CommandHub::new(10);
    hub.set_modes(
        vec!["rule".to_string(), "global".to_string()],
        "rule".to_string(),
    );
    hub.change_mode("global".to_string());

    let (initial, _) = hub.subscribe(CommandKind::Mode);

    assert_eq!(
        initial,
        vec![CommandMessage::ModeList {
            modes: vec!["rule".to_string(), "global".to_string()],
            current: "global".to_string(),
        }]
    );
}

#[test]
fn test_clear_logs_is_broadcast() {
    let hub = CommandHub::new(10);
    hub.append_log("x");
    let (_, mut updates) = hub.subscribe(CommandKind::Log);

    hub.clear_logs();

    assert_eq!(updates.try_recv().unwrap(), CommandMessage::ClearLogs);
    assert!(hub.subscribe(CommandKind::Log).0.is_empty());
}

#[test]
fn test_engine_lines_route_telemetry_and_logs() {
    let hub = CommandHub::new(10);

    hub.ingest_engine_line("plain log line".to_string());
    hub.ingest_engine_line(r#"{"type":"mode_list","modes":["rule"],"current":"rule"}"#.to_string());
    hub.ingest_engine_line(
        r#"{"type":"status","sample":{"uplink":1,"downlink":2,"uplink_total":3,"downlink_total":4,"connections_in":0,"connections_out":5}}"#
            .to_string(),
    );

    assert_eq!(hub.latest_status().connections_out, 5);
    assert_eq!(hub.subscribe(CommandKind::Mode).0.len(), 1);
    assert_eq!(
        hub.subscribe(CommandKind::Log).0,
        vec![CommandMessage::Logs {
            lines: vec!["plain log line".to_string()],
        }]
    );
}
