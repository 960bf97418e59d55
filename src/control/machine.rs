//! Pure session state machine owned by the session actor.
//!
//! Every input returns the side effects the actor must perform, in order. The
//! machine never touches I/O, which keeps the arbitration rules testable.

use crate::error::AlertEvent;
use crate::rpc::SessionStatus;

/// Guard flags scoped to one start/stop cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub is_shutting_down: bool,
    pub is_starting: bool,
    pub has_startup_error: bool,
}

/// Work the actor performs after an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Publish(SessionStatus),
    PublishAlert(AlertEvent),
    /// Open the telemetry streams.
    ConnectStreams,
    /// Close the telemetry streams and drop the traffic baseline.
    DisconnectStreams,
    /// Release the worker binding.
    Unbind,
}

#[derive(Debug, Default)]
pub struct SessionMachine {
    status: SessionStatus,
    flags: SessionFlags,
    /// The most recent user request was a stop. Started reports are ignored
    /// until the next start.
    stop_requested: bool,
    /// The worker relayed Starting during the current start.
    start_acknowledged: bool,
    /// Incremented by every start and stop; delayed work carries the cycle it
    /// was scheduled in.
    cycle: u64,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[cfg(test)]
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Accept a start request. Returns the new cycle.
    pub fn begin_start(&mut self) -> (u64, Vec<Effect>) {
        self.cycle += 1;
        self.stop_requested = false;
        self.start_acknowledged = false;
        self.flags = SessionFlags {
            is_shutting_down: false,
            is_starting: true,
            has_startup_error: false,
        };
        (self.cycle, self.transition(SessionStatus::Starting, true))
    }

    /// Whether the settle delay of `cycle` should still bind to the worker.
    pub fn settle_should_connect(&self, cycle: u64) -> bool {
        cycle == self.cycle && !self.flags.has_startup_error && !self.stop_requested
    }

    /// Accept a stop request. Returns the cycle its cleanup belongs to.
    pub fn begin_stop(&mut self) -> (u64, Vec<Effect>) {
        self.cycle += 1;
        self.stop_requested = true;
        self.flags.is_shutting_down = true;
        self.flags.is_starting = false;
        (self.cycle, self.transition(SessionStatus::Stopping, true))
    }

    /// Delayed teardown after a stop. A no-op once a newer cycle began or the
    /// shutdown flag was cleared.
    pub fn finish_stop(&mut self, cycle: u64) -> Vec<Effect> {
        if cycle != self.cycle || !self.flags.is_shutting_down {
            return Vec::new();
        }
        let mut effects = vec![Effect::DisconnectStreams, Effect::Unbind];
        effects.extend(self.transition(SessionStatus::Stopped, false));
        self.flags.is_shutting_down = false;
        dedup_disconnect(effects)
    }

    /// Reconcile a status observed from the worker connection, the broadcast
    /// relay or a liveness probe.
    pub fn observe(&mut self, observed: SessionStatus) -> Vec<Effect> {
        if observed == SessionStatus::Started {
            if self.flags.is_shutting_down || self.stop_requested {
                tracing::debug!("Ignoring Started while shutting down");
                return Vec::new();
            }
            if self.flags.has_startup_error {
                tracing::debug!("Ignoring Started after a startup error");
                return Vec::new();
            }
            self.flags.is_starting = false;
        }
        if observed == SessionStatus::Stopped && self.flags.is_starting {
            tracing::info!("Worker stopped during startup");
            self.flags.has_startup_error = true;
            self.flags.is_starting = false;
        }
        self.transition(observed, false)
    }

    /// Reconcile a status relayed from the worker's broadcasts. While a start
    /// is pending, anything the worker published before its own Starting
    /// belongs to the previous cycle.
    pub fn observe_relayed(&mut self, observed: SessionStatus) -> Vec<Effect> {
        if self.flags.is_starting && !self.start_acknowledged {
            if observed != SessionStatus::Starting {
                tracing::debug!("Ignoring relayed {} from before the start request", observed);
                return Vec::new();
            }
            self.start_acknowledged = true;
        }
        self.observe(observed)
    }

    /// A start attempt failed in the worker.
    pub fn alert(&mut self, event: AlertEvent) -> Vec<Effect> {
        self.flags.has_startup_error = true;
        self.flags.is_starting = false;
        let mut effects = vec![Effect::PublishAlert(event)];
        effects.extend(self.transition(SessionStatus::Stopped, true));
        effects
    }

    fn transition(&mut self, to: SessionStatus, force_publish: bool) -> Vec<Effect> {
        let from = self.status;
        if from == to && !force_publish {
            return Vec::new();
        }
        self.status = to;

        let mut effects = Vec::new();
        if from != to && (from == SessionStatus::Started || to == SessionStatus::Stopped) {
            effects.push(Effect::DisconnectStreams);
        }
        if from != to && to == SessionStatus::Started {
            effects.push(Effect::ConnectStreams);
        }
        effects.push(Effect::Publish(to));
        effects
    }
}

fn dedup_disconnect(effects: Vec<Effect>) -> Vec<Effect> {
    let mut seen = false;
    effects
        .into_iter()
        .filter(|effect| {
            if *effect == Effect::DisconnectStreams {
                let first = !seen;
                seen = true;
                first
            } else {
                true
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod tests;
