//! Session-relative traffic accounting.

use crate::rpc::StatusSample;
use serde::Serialize;

/// Human-readable byte count: `512 B`, `1.50 KB`, `2.00 MB`, `1.00 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b < KB => format!("{} B", b),
        b if b < MB => format!("{:.2} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.2} MB", b as f64 / MB as f64),
        b => format!("{:.2} GB", b as f64 / GB as f64),
    }
}

/// Traffic event pushed to the control surface for every status sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub uplink_speed: u64,
    pub downlink_speed: u64,
    pub uplink_total: u64,
    pub downlink_total: u64,
    pub connections_in: u32,
    pub connections_out: u32,
    pub session_uplink: u64,
    pub session_downlink: u64,
    pub session_total: u64,
    pub formatted_uplink_speed: String,
    pub formatted_downlink_speed: String,
    pub formatted_uplink_total: String,
    pub formatted_downlink_total: String,
    pub formatted_session_uplink: String,
    pub formatted_session_downlink: String,
    pub formatted_session_total: String,
}

impl TrafficEvent {
    fn new(sample: &StatusSample, session_uplink: u64, session_downlink: u64) -> Self {
        let session_total = session_uplink.saturating_add(session_downlink);
        Self {
            uplink_speed: sample.uplink,
            downlink_speed: sample.downlink,
            uplink_total: sample.uplink_total,
            downlink_total: sample.downlink_total,
            connections_in: sample.connections_in,
            connections_out: sample.connections_out,
            session_uplink,
            session_downlink,
            session_total,
            formatted_uplink_speed: format!("{}/s", format_bytes(sample.uplink)),
            formatted_downlink_speed: format!("{}/s", format_bytes(sample.downlink)),
            formatted_uplink_total: format_bytes(sample.uplink_total),
            formatted_downlink_total: format_bytes(sample.downlink_total),
            formatted_session_uplink: format_bytes(session_uplink),
            formatted_session_downlink: format_bytes(session_downlink),
            formatted_session_total: format_bytes(session_total),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Baseline {
    uplink: u64,
    downlink: u64,
}

/// Derives per-session counters from the engine's cumulative counters.
///
/// The baseline is taken from the first sample with traffic after entering
/// Started. Counters that fall below the baseline (engine restart) move the
/// baseline and report zero for that sample.
#[derive(Debug, Default)]
pub struct TrafficAccountant {
    baseline: Option<Baseline>,
}

impl TrafficAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn on_sample(&mut self, sample: &StatusSample) -> TrafficEvent {
        let current = Baseline {
            uplink: sample.uplink_total,
            downlink: sample.downlink_total,
        };
        let baseline = match self.baseline {
            Some(baseline) => baseline,
            None if current.uplink > 0 || current.downlink > 0 => {
                self.baseline = Some(current);
                current
            }
            None => return TrafficEvent::new(sample, 0, 0),
        };

        if current.uplink < baseline.uplink || current.downlink < baseline.downlink {
            tracing::debug!("Traffic counters went backwards, re-baselining");
            self.baseline = Some(current);
            return TrafficEvent::new(sample, 0, 0);
        }
        TrafficEvent::new(
            sample,
            current.uplink - baseline.uplink,
            current.downlink - baseline.downlink,
        )
    }

    /// Forget the baseline. Called whenever status leaves Started.
    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

#[cfg(test)]
#[path = "tests/traffic_tests.rs"]
mod tests;
