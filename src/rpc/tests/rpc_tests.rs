use super::*;

#[test]
fn test_worker_error_display_authentication_failed() {
    let err = WorkerError::AuthenticationFailed;
    assert_eq!(format!("{}", err), "Authentication failed");
}

#[test]
fn test_worker_error_display_shutting_down() {
    let err = WorkerError::ShuttingDown;
    assert_eq!(format!("{}", err), "Worker is shutting down");
}

#[test]
fn test_worker_error_display_internal() {
    let err = WorkerError::Internal {
        message: "something went wrong".to_string(),
    };
    assert_eq!(format!("{}", err), "Internal error: something went wrong");
}

#[test]
fn test_session_status_ordinals() {
    assert_eq!(SessionStatus::Stopped.ordinal(), 0);
    assert_eq!(SessionStatus::Starting.ordinal(), 1);
    assert_eq!(SessionStatus::Started.ordinal(), 2);
    assert_eq!(SessionStatus::Stopping.ordinal(), 3);
    assert_eq!(SessionStatus::from_ordinal(2), Some(SessionStatus::Started));
    assert_eq!(SessionStatus::from_ordinal(4), None);
}

#[test]
fn test_session_status_transitional() {
    assert!(SessionStatus::Starting.is_transitional());
    assert!(SessionStatus::Stopping.is_transitional());
    assert!(!SessionStatus::Started.is_transitional());
    assert!(!SessionStatus::Stopped.is_transitional());
    assert_eq!(SessionStatus::default(), SessionStatus::Stopped);
    assert_eq!(SessionStatus::Started.to_string(), "Started");
}

#[test]
fn test_per_app_mode_parse() {
    assert_eq!(PerAppProxyMode::parse("off"), Some(PerAppProxyMode::Off));
    assert_eq!(
        PerAppProxyMode::parse("include"),
        Some(PerAppProxyMode::Include)
    );
    assert_eq!(
        PerAppProxyMode::parse("exclude"),
        Some(PerAppProxyMode::Exclude)
    );
    assert_eq!(PerAppProxyMode::parse("Include"), None);
    assert_eq!(PerAppProxyMode::parse("all"), None);
    assert_eq!(PerAppProxyMode::Exclude.as_str(), "exclude");
}

#[test]
fn test_port_file_json() {
    let content = PortFileContent {
        port: 4000,
        subscriber_port: 4001,
        command_port: 4002,
        token: "abc".to_string(),
        pid: 42,
    };
    let json = serde_json::to_string(&content).unwrap();
    assert!(json.contains("\"command_port\":4002"));
    let parsed: PortFileContent = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, content);
}

#[test]
fn test_outbound_group_uses_type_key() {
    let group = OutboundGroup {
        tag: "proxy".to_string(),
        kind: "selector".to_string(),
        selectable: true,
        selected: "hk".to_string(),
        items: vec![OutboundGroupItem {
            tag: "hk".to_string(),
            kind: "vmess".to_string(),
            delay_ms: 120,
        }],
    };
    let value = serde_json::to_value(&group).unwrap();
    assert_eq!(value["type"], "selector");
    assert_eq!(value["items"][0]["type"], "vmess");
}
