//! End-to-end pipeline tests over the timeline assembly: grouping, sorting,
//! the DZ-total walk, validator dedup, filtering, histogram and pagination.

use fabricview::timeline::event::{
    generate_event_id, sort_events, EntityType, EventDetails, EventSeverity, InterfaceDetails,
    TimelineEvent, ValidatorDetails,
};
use fabricview::timeline::walk::{apply_dz_total_walk, WalkAnchor};
use fabricview::timeline::{assemble, TimeWindow, TimelineParams};
use proptest::prelude::*;

const SOL: i64 = 1_000_000_000;

fn attribution(vote: &str, ts: i64, change_lamports: i64) -> TimelineEvent {
    TimelineEvent::new(
        vote,
        "validator_stake_changed",
        ts,
        EventSeverity::Info,
        format!("validator {vote} stake changed on DZ"),
        EntityType::Validator,
        vote.to_string(),
        vote.to_string(),
        EventDetails::Validator(ValidatorDetails {
            vote_pubkey: vote.to_string(),
            node_pubkey: format!("node-{vote}"),
            owner_pubkey: String::new(),
            gossip_ip: String::new(),
            stake_lamports: 100_000 * SOL,
            stake_share_pct: 1.0,
            stake_share_change_pct: None,
            contribution_change_lamports: change_lamports,
            dz_total_stake_share_pct: 0.0,
            on_dz: true,
        }),
    )
}

fn interface_event(device: &str, intf: &str, ts: i64) -> TimelineEvent {
    TimelineEvent::new(
        &format!("{device}:{intf}"),
        "interface_errors_started",
        ts,
        EventSeverity::Warning,
        format!("errors started on {device} {intf}"),
        EntityType::Device,
        device.to_string(),
        device.to_uppercase(),
        EventDetails::Interface(InterfaceDetails {
            device_pk: device.to_string(),
            device_code: device.to_uppercase(),
            interface: intf.to_string(),
            link_pk: String::new(),
            link_code: String::new(),
            errors_delta: 4,
            discards_delta: 0,
            carrier_transitions_delta: 0,
        }),
    )
}

fn params(window: TimeWindow) -> TimelineParams {
    let mut p = TimelineParams::defaults(window.end);
    p.window = window;
    p
}

#[test]
fn full_pipeline_walks_dedups_and_sorts() {
    let window = TimeWindow::new(0, 1_000);
    // duplicate of the ts=300 attribution without a contribution change
    let mut duplicate = attribution("v3", 300, 0);
    duplicate.title = "validator v3 joined DZ duplicate".into();
    let events = vec![
        attribution("v1", 100, 20_000 * SOL),
        attribution("v2", 200, 10_000 * SOL),
        attribution("v3", 300, -5_000 * SOL),
        duplicate,
        interface_event("dev-a", "et-0/0/1", 150),
        interface_event("dev-a", "et-0/0/2", 150),
    ];
    let anchor = WalkAnchor {
        current_dz_total_pct: 18.0,
        total_network_stake_lamports: 1_000_000 * SOL,
    };
    let response = assemble(events, &params(window), anchor);

    // the two interface events merged, the validator duplicate collapsed
    assert_eq!(response.total, 4);
    assert!(response
        .events
        .windows(2)
        .all(|w| (w[0].timestamp, w[0].id.as_str()) >= (w[1].timestamp, w[1].id.as_str())));

    let dz_total = |e: &TimelineEvent| e.details.validator().unwrap().dz_total_stake_share_pct;
    let v3 = response.events.iter().find(|e| e.entity_pk == "v3").unwrap();
    let v2 = response.events.iter().find(|e| e.entity_pk == "v2").unwrap();
    let v1 = response.events.iter().find(|e| e.entity_pk == "v1").unwrap();
    assert!((dz_total(v3) - 18.0).abs() < 1e-9);
    assert!((dz_total(v2) - 18.5).abs() < 1e-9);
    assert!((dz_total(v1) - 17.5).abs() < 1e-9);
    // the kept v3 event is the one carrying the contribution change
    assert_eq!(
        v3.details.validator().unwrap().contribution_change_lamports,
        -5_000 * SOL
    );

    // histogram covers the window and counts all post-filter events
    let histogram_total: u64 = response.histogram.iter().map(|b| b.count).sum();
    assert_eq!(histogram_total, 4);
}

#[test]
fn walk_is_idempotent_across_reassembly() {
    let anchor = WalkAnchor {
        current_dz_total_pct: 9.0,
        total_network_stake_lamports: 500_000 * SOL,
    };
    let mut events = vec![
        attribution("b", 200, -2_000 * SOL),
        attribution("a", 100, 4_000 * SOL),
    ];
    sort_events(&mut events);
    apply_dz_total_walk(&mut events, anchor);
    let snapshot = events.clone();
    apply_dz_total_walk(&mut events, anchor);
    assert_eq!(events, snapshot);
}

#[test]
fn pagination_happens_after_histogram() {
    let window = TimeWindow::new(0, 600);
    let events: Vec<TimelineEvent> = (0..50)
        .map(|i| attribution(&format!("v{i}"), i * 10, 0))
        .collect();
    let mut p = params(window);
    p.limit = 5;
    p.offset = 10;
    let response = assemble(events, &p, WalkAnchor::default());
    assert_eq!(response.total, 50);
    assert_eq!(response.events.len(), 5);
    let histogram_total: u64 = response.histogram.iter().map(|b| b.count).sum();
    assert_eq!(histogram_total, 50);
}

proptest! {
    #[test]
    fn event_id_always_16_hex(entity in "[a-z0-9]{1,40}", ts in 0i64..2_000_000_000, kind in "[a-z_]{1,30}") {
        let id = generate_event_id(&entity, ts, &kind);
        prop_assert_eq!(id.len(), 16);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(id.clone(), generate_event_id(&entity, ts, &kind));
    }

    #[test]
    fn sort_is_total_under_permutation(timestamps in proptest::collection::vec(0i64..10_000, 1..40)) {
        let mut events: Vec<TimelineEvent> = timestamps
            .iter()
            .enumerate()
            .map(|(i, &ts)| attribution(&format!("v{i}"), ts, 0))
            .collect();
        let mut reversed: Vec<TimelineEvent> = events.iter().rev().cloned().collect();
        sort_events(&mut events);
        sort_events(&mut reversed);
        prop_assert_eq!(events, reversed);
    }

    #[test]
    fn walk_never_touches_non_validator_events(ts in 0i64..10_000) {
        let mut events = vec![interface_event("dev", "et-0/0/0", ts)];
        let before = events.clone();
        apply_dz_total_walk(&mut events, WalkAnchor {
            current_dz_total_pct: 42.0,
            total_network_stake_lamports: SOL,
        });
        prop_assert_eq!(events, before);
    }
}
