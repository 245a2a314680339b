//! Search semantics and the timeline filter chain.

use fabricview::timeline::event::{
    ActionCategory, EntityChangeDetails, EntityType, EventDetails, EventSeverity,
    PacketLossDetails, TimelineEvent, ValidatorDetails,
};
use fabricview::timeline::search::{event_matches_search, parse_search, SearchTerms};
use fabricview::timeline::{filter_events, DzFilter, TimeWindow, TimelineParams};

fn link_event(code: &str, loss: f64) -> TimelineEvent {
    TimelineEvent::new(
        &code.to_lowercase(),
        "packet_loss_started",
        500,
        if loss >= 1.0 {
            EventSeverity::Critical
        } else {
            EventSeverity::Warning
        },
        format!("packet loss started on {code}"),
        EntityType::Link,
        code.to_lowercase(),
        code.into(),
        EventDetails::PacketLoss(PacketLossDetails {
            link_pk: code.to_lowercase(),
            link_code: code.into(),
            loss_pct: loss,
            previous_loss_pct: 0.0,
        }),
    )
}

fn metro_event(code: &str) -> TimelineEvent {
    TimelineEvent::new(
        &code.to_lowercase(),
        "metro_created",
        400,
        EventSeverity::Info,
        format!("metro {code} created"),
        EntityType::Metro,
        code.to_lowercase(),
        code.into(),
        EventDetails::EntityChange(EntityChangeDetails {
            changed_fields: vec![],
            is_deleted: false,
        }),
    )
}

fn validator_event(vote: &str, event_type: &str, on_dz: bool, share: f64) -> TimelineEvent {
    TimelineEvent::new(
        vote,
        event_type,
        600,
        EventSeverity::Info,
        format!("validator {vote}"),
        EntityType::Validator,
        vote.into(),
        vote.into(),
        EventDetails::Validator(ValidatorDetails {
            vote_pubkey: vote.into(),
            node_pubkey: format!("node-{vote}"),
            owner_pubkey: String::new(),
            gossip_ip: String::new(),
            stake_lamports: 0,
            stake_share_pct: share,
            stake_share_change_pct: None,
            contribution_change_lamports: 0,
            dz_total_stake_share_pct: 0.0,
            on_dz,
        }),
    )
}

fn base_params() -> TimelineParams {
    let mut p = TimelineParams::defaults(1_000);
    p.window = TimeWindow::new(0, 1_000);
    p
}

#[test]
fn empty_search_matches_nothing() {
    assert!(!event_matches_search(
        &link_event("LAX-DEN", 2.0),
        &SearchTerms::default()
    ));
}

#[test]
fn search_is_and_across_fields_or_within() {
    let event = link_event("LAX-DEN", 2.0);
    assert!(event_matches_search(&event, &parse_search("link:lax")));
    assert!(event_matches_search(
        &event,
        &parse_search("link:ord,link:lax")
    ));
    assert!(!event_matches_search(
        &event,
        &parse_search("link:lax,metro:nyc")
    ));
    // values are lowercased at parse; candidates at match time
    assert!(event_matches_search(&event, &parse_search("link:LAX")));
}

#[test]
fn search_reaches_payload_pubkeys() {
    let event = validator_event("9WzDmkg8vote", "validator_joined_dz", true, 0.4);
    assert!(event_matches_search(
        &event,
        &parse_search("validator:9wzd")
    ));
    assert!(event_matches_search(
        &event,
        &parse_search("validator:node-9wzd")
    ));
    assert!(!event_matches_search(&event, &parse_search("device:9wzd")));
}

#[test]
fn category_filter_uses_action_mapping() {
    let events = vec![
        link_event("LAX-DEN", 2.0),          // alerting
        metro_event("NYC"),                   // added
        validator_event("v1", "validator_left_dz", false, 0.1), // removed
    ];
    let mut p = base_params();
    p.category = Some(ActionCategory::Alerting);
    assert_eq!(filter_events(events.clone(), &p).len(), 1);
    p.category = Some(ActionCategory::Added);
    assert_eq!(filter_events(events.clone(), &p).len(), 1);
    p.category = Some(ActionCategory::Removed);
    assert_eq!(filter_events(events, &p).len(), 1);
}

#[test]
fn dz_filter_splits_fabric_and_solana_events() {
    let events = vec![
        link_event("LAX-DEN", 2.0),                                   // fabric: on-DZ
        validator_event("v-on", "validator_joined_dz", true, 0.5),    // on-DZ
        validator_event("v-off", "validator_joined_solana", false, 0.5), // off-DZ
    ];
    let mut p = base_params();
    p.dz_filter = Some(DzFilter::OnDz);
    let on = filter_events(events.clone(), &p);
    assert_eq!(on.len(), 2);
    assert!(on.iter().any(|e| e.entity_pk == "v-on"));

    p.dz_filter = Some(DzFilter::OffDz);
    let off = filter_events(events, &p);
    assert_eq!(off.len(), 1);
    assert_eq!(off[0].entity_pk, "v-off");
}

#[test]
fn min_stake_filter_applies_to_validators_only() {
    let events = vec![
        link_event("LAX-DEN", 2.0),
        validator_event("whale", "validator_joined_solana", false, 2.0),
        validator_event("shrimp", "validator_joined_solana", false, 0.01),
    ];
    let mut p = base_params();
    p.min_stake_pct = Some(1.0);
    let kept = filter_events(events, &p);
    assert_eq!(kept.len(), 2);
    assert!(kept.iter().any(|e| e.entity_pk == "whale"));
    assert!(kept.iter().all(|e| e.entity_pk != "shrimp"));
}

#[test]
fn severity_filter_is_exact() {
    let events = vec![link_event("A-B", 2.0), link_event("C-D", 0.5)];
    let mut p = base_params();
    p.severity = Some(EventSeverity::Critical);
    let kept = filter_events(events, &p);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].entity_code, "A-B");
}
