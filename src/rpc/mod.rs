//! Wire types and RPC service definitions for control ↔ worker communication.
//!
//! This module defines the tarpc services for:
//! - Control → Worker: authentication, start/close/reload, status queries
//! - Worker → Control: pushed status changes and alerts

pub mod worker_service;

use serde::{Deserialize, Serialize};

pub use crate::error::AlertEvent;

/// Lifecycle of the network session.
///
/// The discriminants are the wire ordinals reported to the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionStatus {
    #[default]
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl SessionStatus {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    #[cfg(test)]
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(SessionStatus::Stopped),
            1 => Some(SessionStatus::Starting),
            2 => Some(SessionStatus::Started),
            3 => Some(SessionStatus::Stopping),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionStatus::Stopped => "Stopped",
            SessionStatus::Starting => "Starting",
            SessionStatus::Started => "Started",
            SessionStatus::Stopping => "Stopping",
        }
    }

    /// Starting and Stopping.
    pub fn is_transitional(self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Stopping)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One periodic status report from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusSample {
    /// Bytes per second sent.
    pub uplink: u64,
    /// Bytes per second received.
    pub downlink: u64,
    /// Cumulative bytes sent since the engine started.
    pub uplink_total: u64,
    /// Cumulative bytes received since the engine started.
    pub downlink_total: u64,
    pub connections_in: u32,
    pub connections_out: u32,
}

/// Snapshot of one outbound group as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundGroup {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub selectable: bool,
    pub selected: String,
    pub items: Vec<OutboundGroupItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundGroupItem {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Last measured URL test delay, 0 when untested.
    pub delay_ms: u32,
}

/// Per-app routing mode persisted by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerAppProxyMode {
    #[default]
    Off,
    Include,
    Exclude,
}

impl PerAppProxyMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(PerAppProxyMode::Off),
            "include" => Some(PerAppProxyMode::Include),
            "exclude" => Some(PerAppProxyMode::Exclude),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PerAppProxyMode::Off => "off",
            PerAppProxyMode::Include => "include",
            PerAppProxyMode::Exclude => "exclude",
        }
    }
}

/// Everything the worker needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Opaque engine configuration.
    pub config: String,
    pub per_app_mode: PerAppProxyMode,
    pub per_app_list: Vec<String>,
}

/// Transport protocol of a connection-owner query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpProtocol {
    Tcp,
    Udp,
}

/// Identifies a local socket whose owning uid is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionQuery {
    pub protocol: IpProtocol,
    pub source: std::net::SocketAddr,
    pub destination: std::net::SocketAddr,
}

/// Port file content written by a running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFileContent {
    /// WorkerService RPC port.
    pub port: u16,
    /// EventCallback subscriber port.
    pub subscriber_port: u16,
    /// Engine command server port.
    pub command_port: u16,
    pub token: String,
    pub pid: u32,
}

/// Errors returned by worker RPC methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerError {
    /// Authentication failed
    AuthenticationFailed,
    /// Worker is shutting down
    ShuttingDown,
    /// No socket matched a connection-owner query
    ConnectionOwnerNotFound { message: String },
    /// Internal error
    Internal { message: String },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::AuthenticationFailed => write!(f, "Authentication failed"),
            WorkerError::ShuttingDown => write!(f, "Worker is shutting down"),
            WorkerError::ConnectionOwnerNotFound { message } => {
                write!(f, "Connection owner not found: {}", message)
            }
            WorkerError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
