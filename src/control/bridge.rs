//! JSON-lines bridge exposing the control surface over stdio.
//!
//! Each input line is a request `{"id", "method", "params"}` answered by one
//! output line `{"id", "result"}` or `{"id", "error": {"code", "message"}}`.
//! Requests are served concurrently, so responses may arrive out of order.
//! Session, traffic and log events are pushed as `{"event", "data"}` lines
//! interleaved with responses. Alerts travel on the status stream as
//! `{"type": "alert"}` data.

use crate::command::streams::LogEvent;
use crate::control::actor::SessionEvent;
use crate::control::surface::ControlSurface;
use crate::error::SessionError;
use crate::rpc::{ConnectionQuery, IpProtocol};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeError {
    pub code: String,
    pub message: String,
}

impl BridgeError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Code reported for a storage or engine failure of `method`.
fn method_code(method: &str) -> &'static str {
    match method {
        "saveConfig" => "CONFIG_SAVE_ERROR",
        "getConfig" => "CONFIG_GET_ERROR",
        "startVPN" | "toggleVPN" => "START_VPN_ERROR",
        "stopVPN" => "STOP_VPN_ERROR",
        "setPerAppProxyMode" | "getPerAppProxyMode" => "SET_MODE_ERROR",
        "setPerAppProxyList" | "getPerAppProxyList" => "SET_APP_LIST_ERROR",
        "getInstalledApps" => "GET_APPS_ERROR",
        "getNotificationTitle"
        | "setNotificationTitle"
        | "getNotificationDescription"
        | "setNotificationDescription" => "NOTIFICATION_ERROR",
        "getAutoStart" | "setAutoStart" => "AUTO_START_ERROR",
        "findConnectionOwner" => "CONNECTION_OWNER_ERROR",
        _ => "INTERNAL_ERROR",
    }
}

/// Caller-facing code: failures with a dedicated code keep it, everything
/// else reports the method's generic code.
pub fn error_code(method: &str, error: &SessionError) -> &'static str {
    match error {
        SessionError::ActivityUnavailable
        | SessionError::InvalidMode(_)
        | SessionError::BindingFailed(_)
        | SessionError::ConnectionOwnerLookupFailed(_)
        | SessionError::PermissionRequestFailed => error.code(),
        _ => method_code(method),
    }
}

fn session_error(method: &str, error: SessionError) -> BridgeError {
    BridgeError::new(error_code(method, &error), error.to_string())
}

fn invalid_params(message: impl Into<String>) -> BridgeError {
    BridgeError::new("INVALID_PARAMS", message)
}

/// Optional named parameter. A missing key or `null` yields `None`.
fn param<T: DeserializeOwned>(params: &Value, key: &str) -> Result<Option<T>, BridgeError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| invalid_params(format!("{}: {}", key, e))),
    }
}

fn required<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, BridgeError> {
    param(params, key)?.ok_or_else(|| invalid_params(format!("missing parameter {}", key)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::new("INTERNAL_ERROR", e.to_string()))
}

fn connection_query(params: &Value) -> Result<ConnectionQuery, BridgeError> {
    let protocol: String = required(params, "protocol")?;
    let protocol = match protocol.to_ascii_lowercase().as_str() {
        "tcp" => IpProtocol::Tcp,
        "udp" => IpProtocol::Udp,
        other => return Err(invalid_params(format!("unknown protocol {}", other))),
    };
    Ok(ConnectionQuery {
        protocol,
        source: required(params, "source")?,
        destination: required(params, "destination")?,
    })
}

/// Run one request against the surface.
pub async fn dispatch(
    surface: &ControlSurface,
    method: &str,
    params: &Value,
) -> Result<Value, BridgeError> {
    let fail = |e: SessionError| session_error(method, e);
    match method {
        "saveConfig" => {
            let config: String = param(params, "config")?.unwrap_or_default();
            Ok(json!(surface.save_config(&config).map_err(fail)?))
        }
        "getConfig" => Ok(json!(surface.get_config().map_err(fail)?)),
        "startVPN" => Ok(json!(surface.start_vpn().await.map_err(fail)?)),
        "stopVPN" => Ok(json!(surface.stop_vpn().await.map_err(fail)?)),
        "toggleVPN" => Ok(json!(surface.toggle_vpn().await.map_err(fail)?)),
        "getVPNStatus" => Ok(json!(surface.get_vpn_status().await.map_err(fail)?.name())),
        "setPerAppProxyMode" => {
            let mode: String = param(params, "mode")?.unwrap_or_else(|| "off".to_string());
            Ok(json!(surface.set_per_app_proxy_mode(&mode).map_err(fail)?))
        }
        "getPerAppProxyMode" => Ok(json!(surface.get_per_app_proxy_mode().map_err(fail)?.as_str())),
        "setPerAppProxyList" => {
            let list: Vec<String> = param(params, "appList")?.unwrap_or_default();
            Ok(json!(surface.set_per_app_proxy_list(&list).map_err(fail)?))
        }
        "getPerAppProxyList" => Ok(json!(surface.get_per_app_proxy_list().map_err(fail)?)),
        "getInstalledApps" => to_json(surface.get_installed_apps().await.map_err(fail)?),
        "getLogs" => Ok(json!(surface.get_logs())),
        "clearLogs" => Ok(json!(surface.clear_logs())),
        "getNotificationTitle" => Ok(json!(surface.get_notification_title().map_err(fail)?)),
        "setNotificationTitle" => {
            let title: String =
                param(params, "title")?.unwrap_or_else(|| "VPN Service".to_string());
            Ok(json!(surface.set_notification_title(&title).map_err(fail)?))
        }
        "getNotificationDescription" => {
            Ok(json!(surface.get_notification_description().map_err(fail)?))
        }
        "setNotificationDescription" => {
            let description: String =
                param(params, "description")?.unwrap_or_else(|| "Connected".to_string());
            Ok(json!(surface.set_notification_description(&description).map_err(fail)?))
        }
        "getAutoStart" => Ok(json!(surface.get_auto_start().map_err(fail)?)),
        "setAutoStart" => {
            let enabled: bool = required(params, "enabled")?;
            Ok(json!(surface.set_auto_start(enabled).map_err(fail)?))
        }
        "getOutboundGroups" => to_json(surface.get_outbound_groups()),
        "getClashMode" => {
            let mode = surface.get_clash_mode();
            Ok(json!({ "modes": mode.modes, "current": mode.current }))
        }
        "findConnectionOwner" => {
            let query = connection_query(params)?;
            Ok(json!(surface.find_connection_owner(query).await.map_err(fail)?))
        }
        other => Err(BridgeError::new(
            "NOT_IMPLEMENTED",
            format!("unknown method {}", other),
        )),
    }
}

/// Output line for a session event.
pub fn session_event_line(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::Status(status) => json!({
            "event": "status",
            "data": {
                "type": "status",
                "status": status.name(),
                "statusCode": status.ordinal(),
            },
        }),
        SessionEvent::Alert(alert) => json!({
            "event": "status",
            "data": {
                "type": "alert",
                "alert": alert.kind.ordinal(),
                "message": alert.describe(),
            },
        }),
        SessionEvent::Traffic(traffic) => json!({ "event": "traffic", "data": traffic }),
    }
}

/// Output line for a log event, `None` for connection bookkeeping.
pub fn log_event_line(event: &LogEvent) -> Option<Value> {
    let data = match event {
        LogEvent::Line(message) => json!({ "type": "log", "message": message }),
        LogEvent::Cleared => json!({ "type": "clear" }),
        LogEvent::Connected | LogEvent::Disconnected => return None,
    };
    Some(json!({ "event": "log", "data": data }))
}

fn response_line(id: Value, outcome: Result<Value, BridgeError>) -> Value {
    match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(error) => json!({ "id": id, "error": error }),
    }
}

async fn handle_line(surface: &ControlSurface, line: &str) -> Value {
    match serde_json::from_str::<BridgeRequest>(line) {
        Ok(request) => {
            tracing::debug!("Bridge request {}", request.method);
            let outcome = dispatch(surface, &request.method, &request.params).await;
            response_line(request.id, outcome)
        }
        Err(e) => response_line(
            Value::Null,
            Err(BridgeError::new("INVALID_REQUEST", e.to_string())),
        ),
    }
}

/// Serve requests from `input` until EOF, writing responses and events to
/// `output`. The surface is shut down once every in-flight request finished.
pub async fn run_bridge<R, W>(surface: ControlSurface, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let surface = Arc::new(surface);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                tracing::warn!("Bridge output closed: {}", e);
                break;
            }
            if let Err(e) = output.flush().await {
                tracing::warn!("Bridge output closed: {}", e);
                break;
            }
        }
    });

    let mut events = surface.subscribe();
    let event_tx = out_tx.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event_tx.send(session_event_line(&event)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Bridge dropped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogEvent>();
    let log_observer = surface.attach_log_observer(Arc::new(log_tx));
    let log_out = out_tx.clone();
    let log_task = tokio::spawn(async move {
        while let Some(event) = log_rx.recv().await {
            if let Some(line) = log_event_line(&event) {
                if log_out.send(line).is_err() {
                    break;
                }
            }
        }
    });

    let mut in_flight = JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let surface = surface.clone();
        let out_tx = out_tx.clone();
        in_flight.spawn(async move {
            let response = handle_line(&surface, &line).await;
            let _ = out_tx.send(response);
        });
    }
    while in_flight.join_next().await.is_some() {}

    if let Some(id) = log_observer {
        surface.detach_log_observer(id);
    }
    event_task.abort();
    log_task.abort();
    drop(out_tx);
    let _ = writer.await;

    match Arc::try_unwrap(surface) {
        Ok(surface) => surface.shutdown().await,
        Err(_) => tracing::debug!("Control surface still shared at bridge exit"),
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
