//! Localhost JSON-lines server exposing [`CommandHub`] telemetry.
//!
//! One connection serves one command kind. The first line must be a
//! `Subscribe` request carrying the worker token; the server answers
//! `Subscribed` or `Rejected` and then streams messages of that kind until
//! either side closes. Status is pushed on a fixed interval; the other kinds
//! send their current snapshot followed by live updates.

use crate::command::{CommandKind, CommandMessage, CommandRequest};
use crate::worker::hub::CommandHub;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time a client has to send its subscription.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running command server. Dropping it without [`close`](Self::close)
/// leaves the accept loop running until the runtime shuts down.
pub struct CommandServer {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CommandServer {
    /// Bind an ephemeral localhost port and start accepting subscriptions.
    pub async fn start(hub: Arc<CommandHub>, token: String, status_interval: Duration) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind command server")?;
        let port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();

        tracing::info!("Command server listening on 127.0.0.1:{}", port);

        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let hub = hub.clone();
                            let token = token.clone();
                            let cancel = accept_cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, hub, token, status_interval, cancel).await {
                                    tracing::debug!("Command connection ended: {:#}", e);
                                }
                            });
                        }
                        Err(e) => tracing::warn!("Command server accept error: {}", e),
                    },
                }
            }
            tracing::debug!("Command server on port {} stopped", port);
        });

        Ok(Self { port, cancel, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and drop every open connection.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    hub: Arc<CommandHub>,
    token: String,
    status_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    tokio::time::timeout(SUBSCRIBE_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("Timed out waiting for subscription")??;
    let kind = match serde_json::from_str::<CommandRequest>(line.trim()) {
        Ok(CommandRequest::Subscribe { kind, token: offered }) if offered == token => kind,
        Ok(CommandRequest::Subscribe { .. }) => {
            let reason = "invalid token".to_string();
            write_message(&mut writer, &CommandMessage::Rejected { reason }).await?;
            anyhow::bail!("Rejected subscription with invalid token");
        }
        Err(e) => {
            let reason = format!("invalid request: {}", e);
            write_message(&mut writer, &CommandMessage::Rejected { reason }).await?;
            anyhow::bail!("Rejected malformed subscription");
        }
    };
    write_message(&mut writer, &CommandMessage::Subscribed).await?;
    tracing::debug!("Command client subscribed to {}", kind);

    // Client-side EOF ends the stream; anything else it sends is ignored.
    let closed = async move {
        let mut sink = String::new();
        loop {
            sink.clear();
            match reader.read_line(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };
    tokio::pin!(closed);

    if kind == CommandKind::Status {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut closed => break,
                _ = ticker.tick() => {
                    let sample = hub.latest_status();
                    write_message(&mut writer, &CommandMessage::Status { sample }).await?;
                }
            }
        }
    } else {
        let (initial, mut updates) = hub.subscribe(kind);
        for message in &initial {
            write_message(&mut writer, message).await?;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut closed => break,
                update = updates.recv() => match update {
                    Ok(message) if message.kind() == Some(kind) => {
                        write_message(&mut writer, &message).await?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Command client for {} skipped {} updates", kind, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &CommandMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(format!("{}\n", json).as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/command_server_tests.rs"]
mod tests;
