//! Telemetry command channel between the control surface and the engine host.
//!
//! All communication uses newline-delimited JSON (one JSON object per line).
//! A client opens one connection per command kind, sends `Subscribe`, waits
//! for `Subscribed` and then receives a stream of messages for that kind.
//!
//! - **Client (`client.rs`)**: reconnecting single-flight client
//! - **Streams (`streams.rs`)**: status/log/group/mode specializations
//! - **TCP (`tcp.rs`)**: connector that locates the endpoint via the port file

pub mod client;
pub mod streams;
pub mod tcp;

use crate::rpc::{OutboundGroup, StatusSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::CommandChannelClient;

/// Which telemetry stream a connection attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Status,
    Log,
    Group,
    Mode,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Status => write!(f, "status"),
            CommandKind::Log => write!(f, "log"),
            CommandKind::Group => write!(f, "group"),
            CommandKind::Mode => write!(f, "mode"),
        }
    }
}

/// Messages sent from client to engine host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandRequest {
    Subscribe { kind: CommandKind, token: String },
}

/// Messages sent from engine host to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandMessage {
    Subscribed,
    Rejected { reason: String },
    Status { sample: StatusSample },
    Logs { lines: Vec<String> },
    ClearLogs,
    Groups { groups: Vec<OutboundGroup> },
    ModeList { modes: Vec<String>, current: String },
    ModeChanged { mode: String },
}

impl CommandMessage {
    /// The stream this message belongs to, `None` for handshake messages.
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            CommandMessage::Subscribed | CommandMessage::Rejected { .. } => None,
            CommandMessage::Status { .. } => Some(CommandKind::Status),
            CommandMessage::Logs { .. } | CommandMessage::ClearLogs => Some(CommandKind::Log),
            CommandMessage::Groups { .. } => Some(CommandKind::Group),
            CommandMessage::ModeList { .. } | CommandMessage::ModeChanged { .. } => {
                Some(CommandKind::Mode)
            }
        }
    }
}

/// Typed callback surface for delivered telemetry. Every method defaults to
/// a no-op so specializations implement only their own kind.
pub trait CommandHandler: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn update_status(&self, _sample: StatusSample) {}
    fn clear_logs(&self) {}
    fn append_logs(&self, _lines: Vec<String>) {}
    fn update_groups(&self, _groups: Vec<OutboundGroup>) {}
    fn initialize_mode(&self, _modes: Vec<String>, _current: String) {}
    fn update_mode(&self, _mode: String) {}
}

/// An open, subscribed command connection.
#[async_trait]
pub trait CommandTransport: Send {
    /// Next message, `None` once the remote end closed the stream.
    async fn next_message(&mut self) -> anyhow::Result<Option<CommandMessage>>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens subscribed connections to the engine's control endpoint.
#[async_trait]
pub trait CommandConnector: Send + Sync {
    async fn connect(&self, kind: CommandKind) -> anyhow::Result<Box<dyn CommandTransport>>;
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
