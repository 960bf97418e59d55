use super::*;
use proptest::prelude::*;

fn totals(uplink_total: u64, downlink_total: u64) -> StatusSample {
    StatusSample {
        uplink_total,
        downlink_total,
        ..StatusSample::default()
    }
}

#[test]
fn test_format_bytes_units() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1536), "1.50 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
}

#[test]
fn test_first_sample_sets_baseline() {
    let mut accountant = TrafficAccountant::new();

    let first = accountant.on_sample(&totals(1000, 4000));
    let second = accountant.on_sample(&totals(1000, 5000));

    assert_eq!(first.session_uplink, 0);
    assert_eq!(first.session_downlink, 0);
    assert_eq!(second.session_uplink, 0);
    assert_eq!(second.session_downlink, 1000);
    assert_eq!(second.session_total, 1000);
}

#[test]
fn test_zero_totals_do_not_set_baseline() {
    let mut accountant = TrafficAccountant::new();

    accountant.on_sample(&totals(0, 0));

    assert!(!accountant.has_baseline());
    let next = accountant.on_sample(&totals(10, 0));
    assert_eq!(next.session_uplink, 0);
    assert!(accountant.has_baseline());
}

#[test]
fn test_counter_drop_rebaselines() {
    let mut accountant = TrafficAccountant::new();
    accountant.on_sample(&totals(5000, 5000));

    let dropped = accountant.on_sample(&totals(100, 6000));
    let after = accountant.on_sample(&totals(300, 6100));

    assert_eq!((dropped.session_uplink, dropped.session_downlink), (0, 0));
    assert_eq!((after.session_uplink, after.session_downlink), (200, 100));
}

#[test]
fn test_reset_takes_new_baseline() {
    let mut accountant = TrafficAccountant::new();
    accountant.on_sample(&totals(100, 100));
    accountant.on_sample(&totals(900, 900));

    accountant.reset();
    let event = accountant.on_sample(&totals(1000, 1000));

    assert_eq!(event.session_total, 0);
}

#[test]
fn test_event_json_shape() {
    let sample = StatusSample {
        uplink: 2048,
        downlink: 10,
        uplink_total: 2048,
        downlink_total: 10,
        connections_in: 1,
        connections_out: 2,
    };
    let event = TrafficAccountant::new().on_sample(&sample);

    let json = serde_json::to_value(&event).unwrap();

    assert_eq!(json["uplinkSpeed"], 2048);
    assert_eq!(json["connectionsOut"], 2);
    assert_eq!(json["formattedUplinkSpeed"], "2.00 KB/s");
    assert_eq!(json["formattedDownlinkTotal"], "10 B");
    assert_eq!(json["sessionTotal"], 0);
}

proptest! {
    #[test]
    fn prop_session_counters_never_exceed_cumulative(
        samples in proptest::collection::vec((0u64..1_000_000, 0u64..1_000_000), 1..40)
    ) {
        let mut accountant = TrafficAccountant::new();
        for (up, down) in samples {
            let event = accountant.on_sample(&totals(up, down));
            prop_assert!(event.session_uplink <= up);
            prop_assert!(event.session_downlink <= down);
            prop_assert_eq!(event.session_total, event.session_uplink + event.session_downlink);
        }
    }

    #[test]
    fn prop_monotonic_counters_measure_from_first_sample(
        start in 1u64..1_000_000,
        steps in proptest::collection::vec(0u64..10_000, 1..20)
    ) {
        let mut accountant = TrafficAccountant::new();
        accountant.on_sample(&totals(start, start));
        let mut current = start;
        for step in steps {
            current += step;
            let event = accountant.on_sample(&totals(current, current));
            prop_assert_eq!(event.session_uplink, current - start);
        }
    }
}
