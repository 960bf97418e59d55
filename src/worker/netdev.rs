//! Interface byte counters from `/proc/net/dev`.

use crate::rpc::StatusSample;
use std::time::Instant;

const NET_DEV_PATH: &str = "/proc/net/dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Finds `interface` in the contents of `/proc/net/dev`.
///
/// Each data line reads `name: rx_bytes rx_packets ... (8 rx fields) tx_bytes ...`.
pub fn parse_net_dev(content: &str, interface: &str) -> Option<InterfaceCounters> {
    content.lines().skip(2).find_map(|line| {
        let (name, fields) = line.split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let fields: Vec<&str> = fields.split_whitespace().collect();
        Some(InterfaceCounters {
            rx_bytes: fields.first()?.parse().ok()?,
            tx_bytes: fields.get(8)?.parse().ok()?,
        })
    })
}

pub fn read_counters(interface: &str) -> Option<InterfaceCounters> {
    let content = std::fs::read_to_string(NET_DEV_PATH).ok()?;
    parse_net_dev(&content, interface)
}

/// Turns successive counter readings into status samples.
///
/// Totals are relative to the first reading so they start at zero with the
/// engine; rates are the delta over the elapsed time.
#[derive(Debug, Default)]
pub struct RateTracker {
    origin: Option<InterfaceCounters>,
    last: Option<(Instant, InterfaceCounters)>,
}

impl RateTracker {
    pub fn sample(&mut self, counters: InterfaceCounters, now: Instant) -> StatusSample {
        let origin = *self.origin.get_or_insert(counters);
        let (uplink, downlink) = match self.last {
            Some((at, previous)) => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (
                        per_second(counters.tx_bytes.saturating_sub(previous.tx_bytes), secs),
                        per_second(counters.rx_bytes.saturating_sub(previous.rx_bytes), secs),
                    )
                } else {
                    (0, 0)
                }
            }
            None => (0, 0),
        };
        self.last = Some((now, counters));

        StatusSample {
            uplink,
            downlink,
            uplink_total: counters.tx_bytes.saturating_sub(origin.tx_bytes),
            downlink_total: counters.rx_bytes.saturating_sub(origin.rx_bytes),
            connections_in: 0,
            connections_out: 0,
        }
    }
}

fn per_second(bytes: u64, secs: f64) -> u64 {
    (bytes as f64 / secs).round() as u64
}

#[cfg(test)]
#[path = "tests/netdev_tests.rs"]
mod tests;
