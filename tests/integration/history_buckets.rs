//! Bucket-math and run-detection properties of the history bucketizer.

use fabricview::model::HealthState;
use fabricview::query::history::{
    build_counter_buckets, build_link_buckets, BucketSpec, BucketStats, CounterTotals,
    HistoryRange, IssueReason, LinkBucketInputs, MAX_BUCKETS, MIN_BUCKETS,
};
use proptest::prelude::*;

const RANGES: [HistoryRange; 7] = [
    HistoryRange::H1,
    HistoryRange::H3,
    HistoryRange::H6,
    HistoryRange::H12,
    HistoryRange::H24,
    HistoryRange::D3,
    HistoryRange::D7,
];

fn blank_inputs(spec: &BucketSpec) -> LinkBucketInputs {
    LinkBucketInputs {
        stats: vec![None; spec.bucket_count],
        counters: vec![CounterTotals::default(); spec.bucket_count],
        drained: vec![false; spec.bucket_count],
        committed_rtt_us: 1_000.0,
        sla_eligible: true,
    }
}

fn sample(loss_pct: f64) -> Option<BucketStats> {
    Some(BucketStats {
        avg_rtt_us: 800.0,
        loss_pct,
        samples: 30,
    })
}

proptest! {
    #[test]
    fn every_history_has_exact_bucket_count(
        range_idx in 0usize..RANGES.len(),
        requested in 1usize..400,
        now in 1_600_000_000i64..1_900_000_000,
    ) {
        let spec = BucketSpec::new(RANGES[range_idx], requested);
        prop_assert!(spec.bucket_minutes >= 5);
        prop_assert!(spec.bucket_count >= 1);

        let (buckets, _) = build_link_buckets(&spec, now, &blank_inputs(&spec));
        prop_assert_eq!(buckets.len(), spec.bucket_count);
        prop_assert!(buckets.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        // newest bucket sits at the aligned now
        let aligned = now - now.rem_euclid(spec.bucket_secs());
        prop_assert_eq!(buckets.last().unwrap().timestamp, aligned);
    }

    #[test]
    fn requested_buckets_clamp(requested in 0usize..10_000) {
        let spec = BucketSpec::new(HistoryRange::D7, requested);
        let effective = (HistoryRange::D7.hours() * 60) / spec.bucket_minutes;
        prop_assert!(effective as usize <= MAX_BUCKETS);
        let clamped = requested.clamp(MIN_BUCKETS, MAX_BUCKETS);
        prop_assert!(spec.bucket_minutes == ((HistoryRange::D7.hours() * 60) / clamped as i64).max(5));
    }
}

#[test]
fn extended_loss_scenario_four_half_hour_buckets() {
    // bucket_minutes = 30: four buckets of 100% loss make a 2-hour run
    let spec = BucketSpec::new(HistoryRange::H6, 12);
    assert_eq!(spec.bucket_minutes, 30);
    let mut inputs = blank_inputs(&spec);
    for idx in 0..spec.bucket_count {
        inputs.stats[idx] = sample(0.0);
    }
    for idx in 2..6 {
        inputs.stats[idx] = sample(100.0);
    }
    let (buckets, reasons) = build_link_buckets(&spec, 1_700_000_000, &inputs);
    for bucket in &buckets[2..6] {
        assert_eq!(bucket.state, HealthState::Disabled);
    }
    assert!(reasons.contains(&IssueReason::ExtendedLoss));
    assert!(!reasons.contains(&IssueReason::PacketLoss));
}

#[test]
fn reasons_are_sorted_and_unique() {
    let spec = BucketSpec::new(HistoryRange::H6, 12);
    let mut inputs = blank_inputs(&spec);
    for idx in 0..spec.bucket_count {
        inputs.stats[idx] = sample(5.0);
    }
    inputs.drained[0] = true;
    inputs.counters[3] = CounterTotals {
        errors: 2,
        discards: 3,
        carrier_transitions: 0,
    };
    let (_, reasons) = build_link_buckets(&spec, 1_700_000_000, &inputs);
    let mut sorted = reasons.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(reasons, sorted);
    assert!(reasons.contains(&IssueReason::Drained));
    assert!(reasons.contains(&IssueReason::PacketLoss));
}

#[test]
fn device_counter_buckets_classify_and_overlay() {
    let spec = BucketSpec::new(HistoryRange::H12, 24);
    let mut counters = vec![CounterTotals::default(); spec.bucket_count];
    counters[1] = CounterTotals {
        errors: 5,
        discards: 0,
        carrier_transitions: 0,
    };
    counters[2] = CounterTotals {
        errors: 150,
        discards: 0,
        carrier_transitions: 0,
    };
    let mut disabled = vec![false; spec.bucket_count];
    disabled[3] = true;

    let (buckets, reasons) = build_counter_buckets(&spec, 1_700_000_000, &counters, &disabled);
    assert_eq!(buckets.len(), spec.bucket_count);
    assert_eq!(buckets[0].state, HealthState::Healthy);
    assert_eq!(buckets[1].state, HealthState::Degraded);
    assert_eq!(buckets[2].state, HealthState::Unhealthy);
    assert_eq!(buckets[3].state, HealthState::Disabled);
    assert!(reasons.contains(&IssueReason::InterfaceErrors));
    assert!(reasons.contains(&IssueReason::Drained));
}
