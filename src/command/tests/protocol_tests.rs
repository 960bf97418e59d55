use super::*;

#[test]
fn test_subscribe_wire_format() {
    let request = CommandRequest::Subscribe {
        kind: CommandKind::Log,
        token: "t0k".to_string(),
    };
    let json = serde_json::to_string(&request).unwrap();
    assert_eq!(json, r#"{"type":"subscribe","kind":"log","token":"t0k"}"#);
}

#[test]
fn test_message_tags_are_snake_case() {
    let json = serde_json::to_string(&CommandMessage::ClearLogs).unwrap();
    assert_eq!(json, r#"{"type":"clear_logs"}"#);

    let parsed: CommandMessage =
        serde_json::from_str(r#"{"type":"mode_changed","mode":"global"}"#).unwrap();
    assert_eq!(
        parsed,
        CommandMessage::ModeChanged {
            mode: "global".to_string()
        }
    );
}

#[test]
fn test_message_kinds() {
    assert_eq!(CommandMessage::Subscribed.kind(), None);
    assert_eq!(
        CommandMessage::Status {
            sample: StatusSample::default()
        }
        .kind(),
        Some(CommandKind::Status)
    );
    assert_eq!(CommandMessage::ClearLogs.kind(), Some(CommandKind::Log));
    assert_eq!(
        CommandMessage::Groups { groups: vec![] }.kind(),
        Some(CommandKind::Group)
    );
    assert_eq!(
        CommandMessage::ModeList {
            modes: vec!["rule".to_string()],
            current: "rule".to_string()
        }
        .kind(),
        Some(CommandKind::Mode)
    );
}
