//! Telemetry sink the engine writes into and the command server reads from.

use crate::command::{CommandKind, CommandMessage};
use crate::rpc::{OutboundGroup, StatusSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the live update channel. Slow subscribers skip ahead.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct HubState {
    sample: StatusSample,
    logs: VecDeque<String>,
    groups: Vec<OutboundGroup>,
    modes: Vec<String>,
    current_mode: String,
}

/// Latest engine telemetry plus a live update feed.
///
/// Every mutation and every subscription happens under the same lock, so a new
/// subscriber's snapshot and its update feed never overlap or leave a gap.
pub struct CommandHub {
    state: Mutex<HubState>,
    updates: broadcast::Sender<CommandMessage>,
    log_capacity: usize,
}

impl CommandHub {
    pub fn new(log_capacity: usize) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            updates,
            log_capacity: log_capacity.max(1),
        })
    }

    pub fn record_status(&self, sample: StatusSample) {
        self.state.lock().sample = sample;
    }

    pub fn latest_status(&self) -> StatusSample {
        self.state.lock().sample
    }

    pub fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.state.lock();
        while state.logs.len() >= self.log_capacity {
            state.logs.pop_front();
        }
        state.logs.push_back(line.clone());
        let _ = self.updates.send(CommandMessage::Logs { lines: vec![line] });
    }

    pub fn clear_logs(&self) {
        let mut state = self.state.lock();
        state.logs.clear();
        let _ = self.updates.send(CommandMessage::ClearLogs);
    }

    pub fn update_groups(&self, groups: Vec<OutboundGroup>) {
        let mut state = self.state.lock();
        state.groups = groups.clone();
        let _ = self.updates.send(CommandMessage::Groups { groups });
    }

    pub fn set_modes(&self, modes: Vec<String>, current: String) {
        let mut state = self.state.lock();
        state.modes = modes.clone();
        state.current_mode = current.clone();
        let _ = self.updates.send(CommandMessage::ModeList { modes, current });
    }

    pub fn change_mode(&self, mode: String) {
        let mut state = self.state.lock();
        state.current_mode = mode.clone();
        let _ = self.updates.send(CommandMessage::ModeChanged { mode });
    }

    /// Feed one line of engine output. Lines holding a JSON telemetry message
    /// update the matching snapshot; everything else is a log line.
    pub fn ingest_engine_line(&self, line: String) {
        match serde_json::from_str::<CommandMessage>(&line) {
            Ok(CommandMessage::Status { sample }) => self.record_status(sample),
            Ok(CommandMessage::Groups { groups }) => self.update_groups(groups),
            Ok(CommandMessage::ModeList { modes, current }) => self.set_modes(modes, current),
            Ok(CommandMessage::ModeChanged { mode }) => self.change_mode(mode),
            Ok(CommandMessage::ClearLogs) => self.clear_logs(),
            Ok(CommandMessage::Logs { lines }) => {
                for line in lines {
                    self.append_log(line);
                }
            }
            Ok(CommandMessage::Subscribed | CommandMessage::Rejected { .. }) | Err(_) => {
                self.append_log(line)
            }
        }
    }

    /// Forget per-engine state before a new engine starts. Logs are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.sample = StatusSample::default();
        state.groups.clear();
        state.modes.clear();
        state.current_mode.clear();
    }

    /// Initial messages for a new subscriber of `kind` and its update feed.
    pub fn subscribe(
        &self,
        kind: CommandKind,
    ) -> (Vec<CommandMessage>, broadcast::Receiver<CommandMessage>) {
        let state = self.state.lock();
        let initial = match kind {
            CommandKind::Status => vec![CommandMessage::Status {
                sample: state.sample,
            }],
            CommandKind::Log if state.logs.is_empty() => Vec::new(),
            CommandKind::Log => vec![CommandMessage::Logs {
                lines: state.logs.iter().cloned().collect(),
            }],
            CommandKind::Group => vec![CommandMessage::Groups {
                groups: state.groups.clone(),
            }],
            CommandKind::Mode if state.modes.is_empty() => Vec::new(),
            CommandKind::Mode => vec![CommandMessage::ModeList {
                modes: state.modes.clone(),
                current: state.current_mode.clone(),
            }],
        };
        (initial, self.updates.subscribe())
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
