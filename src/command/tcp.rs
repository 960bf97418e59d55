//! JSON-lines command transport over localhost TCP.

use crate::command::{CommandConnector, CommandKind, CommandMessage, CommandRequest, CommandTransport};
use crate::rpc::PortFileContent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Maximum time to wait for the `Subscribed` acknowledgement.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where to find the command endpoint.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Read the port and token from a worker port file on every attempt.
    PortFile(PathBuf),
    #[cfg(test)]
    Fixed { port: u16, token: String },
}

pub struct TcpCommandConnector {
    endpoint: Endpoint,
}

impl TcpCommandConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    fn resolve(&self) -> Result<(u16, String)> {
        match &self.endpoint {
            #[cfg(test)]
            Endpoint::Fixed { port, token } => Ok((*port, token.clone())),
            Endpoint::PortFile(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read port file: {}", path.display()))?;
                let info: PortFileContent =
                    serde_json::from_str(&content).context("Failed to parse port file")?;
                if info.command_port == 0 {
                    anyhow::bail!("Command server is not running");
                }
                Ok((info.command_port, info.token))
            }
        }
    }
}

#[async_trait]
impl CommandConnector for TcpCommandConnector {
    async fn connect(&self, kind: CommandKind) -> Result<Box<dyn CommandTransport>> {
        let (port, token) = self.resolve()?;
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to connect to command port {}", port))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let subscribe = serde_json::to_string(&CommandRequest::Subscribe { kind, token })?;
        writer
            .write_all(format!("{}\n", subscribe).as_bytes())
            .await?;

        let mut line = String::new();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("Timed out waiting for subscription")??;
        match serde_json::from_str::<CommandMessage>(line.trim()) {
            Ok(CommandMessage::Subscribed) => {}
            Ok(CommandMessage::Rejected { reason }) => anyhow::bail!("Subscription rejected: {}", reason),
            Ok(other) => anyhow::bail!("Unexpected handshake message: {:?}", other),
            Err(e) => return Err(e).context("Invalid handshake response"),
        }

        Ok(Box::new(TcpCommandTransport { reader, writer }))
    }
}

struct TcpCommandTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl CommandTransport for TcpCommandTransport {
    async fn next_message(&mut self) -> Result<Option<CommandMessage>> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            match serde_json::from_str::<CommandMessage>(line.trim()) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::debug!("Skipping unparseable command line: {}", e),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
