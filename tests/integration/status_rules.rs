//! Status-snapshot rules: overall roll-up, SLA classification and issue
//! start derivation.

use fabricview::model::{classify_sla, latency_overage_pct, HealthState};
use fabricview::query::status::{derive_issue_start, overall_status};
use proptest::prelude::*;

#[test]
fn overall_rolls_up_in_priority_order() {
    use HealthState::*;
    // database ping failure dominates everything
    assert_eq!(overall_status(false, 100, 0, 0, 0.0), Unhealthy);
    // more than 10% unhealthy links
    assert_eq!(overall_status(true, 100, 0, 11, 0.0), Unhealthy);
    // average loss at 10%
    assert_eq!(overall_status(true, 50, 0, 0, 10.0), Unhealthy);
    // more than 20% degraded
    assert_eq!(overall_status(true, 100, 21, 0, 0.0), Degraded);
    // any unhealthy link degrades the fabric
    assert_eq!(overall_status(true, 100, 0, 1, 0.0), Degraded);
    // average loss at 1%
    assert_eq!(overall_status(true, 100, 0, 0, 1.0), Degraded);
    assert_eq!(overall_status(true, 100, 10, 0, 0.5), Healthy);
}

#[test]
fn sla_classification_partitions_links() {
    let cases = [
        (0.0, 0.0, HealthState::Healthy),
        (1.0, 0.0, HealthState::Degraded),
        (0.0, 20.0, HealthState::Degraded),
        (10.0, 0.0, HealthState::Unhealthy),
        (0.0, 50.0, HealthState::Unhealthy),
        (95.0, 0.0, HealthState::Disabled),
    ];
    for (loss, overage, expected) in cases {
        assert_eq!(classify_sla(loss, overage), expected, "loss={loss} overage={overage}");
    }
}

#[test]
fn committed_rtt_gates_latency_overage() {
    // non-eligible links never produce an overage
    assert_eq!(latency_overage_pct(5_000.0, 1_000.0, false), 0.0);
    assert_eq!(latency_overage_pct(5_000.0, 0.0, true), 0.0);
    // 1.5ms against a 1ms commitment is 50% over
    assert!((latency_overage_pct(1_500.0, 1_000.0, true) - 50.0).abs() < 1e-9);
    // under-commitment yields a negative overage, which never trips a rule
    assert!(latency_overage_pct(500.0, 1_000.0, true) < 0.0);
}

#[test]
fn issue_start_suppressed_when_current_hour_healthy() {
    let now = 1_000_000 + 2 * 3600;
    // the most recent hour recovered: start would land in the future
    let hours = vec![
        (1_000_000, 40.0),
        (1_000_000 + 3600, 40.0),
        (1_000_000 + 2 * 3600, 0.0),
    ];
    assert_eq!(derive_issue_start(&hours, now), None);
}

#[test]
fn issue_start_is_first_hour_after_recovery_window() {
    let base = 1_000_000;
    let hours = vec![
        (base, 0.0),
        (base + 3600, 0.0),
        (base + 2 * 3600, 30.0),
        (base + 3 * 3600, 45.0),
    ];
    assert_eq!(
        derive_issue_start(&hours, base + 10 * 3600),
        Some(base + 2 * 3600)
    );
}

proptest! {
    #[test]
    fn health_partition_is_exhaustive(loss in 0.0f64..100.0, overage in -100.0f64..200.0) {
        // every (loss, overage) pair lands in exactly one of the four states
        let state = classify_sla(loss, overage);
        prop_assert!(matches!(
            state,
            HealthState::Healthy
                | HealthState::Degraded
                | HealthState::Unhealthy
                | HealthState::Disabled
        ));
    }

    #[test]
    fn derived_start_is_never_in_the_future(
        losses in proptest::collection::vec(0.0f64..100.0, 1..50),
    ) {
        let base = 1_000_000i64;
        let hours: Vec<(i64, f64)> = losses
            .iter()
            .enumerate()
            .map(|(i, &loss)| (base + i as i64 * 3600, loss))
            .collect();
        let now = base + losses.len() as i64 * 3600;
        if let Some(start) = derive_issue_start(&hours, now) {
            prop_assert!(start <= now);
        }
    }
}
