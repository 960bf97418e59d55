//! The four telemetry streams opened while the session is Started.

use crate::command::streams::{GroupStream, LogStream, ModeState, ModeStream, StatusStream};
use crate::command::CommandConnector;
use crate::config::CommandChannelConfig;
use crate::registry::Listener;
use crate::rpc::{OutboundGroup, StatusSample};
use std::sync::Arc;

pub struct TelemetryStreams {
    status: StatusStream,
    logs: LogStream,
    groups: GroupStream,
    modes: ModeStream,
}

impl TelemetryStreams {
    pub fn new(
        retry: CommandChannelConfig,
        connector: Arc<dyn CommandConnector>,
        samples: Arc<dyn Listener<StatusSample>>,
    ) -> Self {
        Self {
            status: StatusStream::new(retry.clone(), connector.clone(), samples),
            logs: LogStream::new(retry.clone(), connector.clone()),
            groups: GroupStream::new(retry.clone(), connector.clone()),
            modes: ModeStream::new(retry, connector),
        }
    }

    pub fn connect(&self) {
        tracing::debug!("Connecting telemetry streams");
        self.status.connect();
        self.logs.connect();
        self.groups.connect();
        self.modes.connect();
    }

    pub fn disconnect(&self) {
        tracing::debug!("Disconnecting telemetry streams");
        self.status.disconnect();
        self.logs.disconnect();
        self.groups.disconnect();
        self.modes.disconnect();
    }

    pub fn logs(&self) -> &LogStream {
        &self.logs
    }

    pub fn groups(&self) -> Vec<OutboundGroup> {
        self.groups.groups()
    }

    pub fn mode(&self) -> ModeState {
        self.modes.state()
    }
}
