//! Unified timeline engine: runs the source producers concurrently, then
//! groups, sorts, walks, dedups, filters, histograms and paginates the merged
//! stream.

pub mod event;
pub mod search;
pub mod sources;
pub mod walk;

use std::sync::Arc;

use clickhouse::Row;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::columnar::ColumnarClient;
use crate::error::Result;
use event::{
    ActionCategory, EntityType, EventDetails, EventSeverity, GroupedInterfaceDetails,
    TimelineEvent,
};
use search::{event_matches_search, parse_search};
use walk::{apply_dz_total_walk, dedup_validator_events, WalkAnchor};

/// Concurrent producers in flight at once.
const PRODUCER_CONCURRENCY: usize = 10;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 500;
pub const DEFAULT_RANGE_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    /// Unix seconds, inclusive.
    pub start: i64,
    /// Unix seconds, exclusive.
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DzFilter {
    OnDz,
    OffDz,
}

impl DzFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_dz" => Some(Self::OnDz),
            "off_dz" => Some(Self::OffDz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineParams {
    pub window: TimeWindow,
    pub entity_type: Option<EntityType>,
    pub severity: Option<EventSeverity>,
    pub category: Option<ActionCategory>,
    pub dz_filter: Option<DzFilter>,
    pub min_stake_pct: Option<f64>,
    pub search: Option<String>,
    pub include_internal: bool,
    pub limit: usize,
    pub offset: usize,
}

impl TimelineParams {
    pub fn defaults(now: i64) -> Self {
        Self {
            window: TimeWindow::new(now - DEFAULT_RANGE_SECS, now),
            entity_type: None,
            severity: None,
            category: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: false,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    /// True when the request matches the cached default parameter set
    /// exactly; only the window endpoints may differ.
    pub fn is_default_shape(&self) -> bool {
        self.entity_type.is_none()
            && self.severity.is_none()
            && self.category.is_none()
            && self.dz_filter.is_none()
            && self.min_stake_pct.is_none()
            && self.search.is_none()
            && !self.include_internal
            && self.limit == DEFAULT_LIMIT
            && self.offset == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramBucket {
    pub timestamp: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineResponse {
    pub events: Vec<TimelineEvent>,
    pub total: usize,
    pub histogram: Vec<HistogramBucket>,
    pub window: TimeWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Row, Deserialize)]
pub struct TimelineBounds {
    pub earliest: i64,
    pub latest: i64,
}

// ---------------------------------------------------------------------------
// Pure pipeline
// ---------------------------------------------------------------------------

/// Histogram bucket width adapted to the window span.
pub fn histogram_bucket_secs(window: TimeWindow) -> i64 {
    let span = window.duration_secs();
    if span <= 2 * 3600 {
        300
    } else if span <= 12 * 3600 {
        900
    } else if span <= 24 * 3600 {
        1800
    } else if span <= 3 * 24 * 3600 {
        7200
    } else {
        21600
    }
}

pub fn build_histogram(events: &[TimelineEvent], window: TimeWindow) -> Vec<HistogramBucket> {
    let bucket = histogram_bucket_secs(window);
    if window.duration_secs() <= 0 {
        return Vec::new();
    }
    let first = window.start - window.start.rem_euclid(bucket);
    let mut counts: FxHashMap<i64, u64> = FxHashMap::default();
    for event in events {
        if event.timestamp < window.start || event.timestamp >= window.end {
            continue;
        }
        let slot = event.timestamp - event.timestamp.rem_euclid(bucket);
        *counts.entry(slot).or_insert(0) += 1;
    }
    let mut buckets = Vec::new();
    let mut ts = first;
    while ts < window.end {
        buckets.push(HistogramBucket {
            timestamp: ts,
            count: counts.get(&ts).copied().unwrap_or(0),
        });
        ts += bucket;
    }
    buckets
}

/// Collapses interface events sharing `(device_pk, event_type, timestamp)`
/// into one grouped event listing the interfaces sorted by name. Events with
/// different timestamps never merge; single-interface events keep their
/// original form.
pub fn group_interface_events(events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut groups: FxHashMap<(String, String, i64), Vec<usize>> = FxHashMap::default();
    for (idx, event) in events.iter().enumerate() {
        if let EventDetails::Interface(details) = &event.details {
            groups
                .entry((
                    details.device_pk.clone(),
                    event.event_type.clone(),
                    event.timestamp,
                ))
                .or_default()
                .push(idx);
        }
    }

    let mut grouped_members: FxHashMap<usize, (String, String, i64)> = FxHashMap::default();
    for (key, members) in &groups {
        if members.len() > 1 {
            for &idx in members {
                grouped_members.insert(idx, key.clone());
            }
        }
    }
    if grouped_members.is_empty() {
        return events;
    }

    let mut emitted: FxHashMap<(String, String, i64), GroupedInterfaceDetails> =
        FxHashMap::default();
    let mut out = Vec::with_capacity(events.len());
    let mut order: Vec<(String, String, i64)> = Vec::new();
    let mut severities: FxHashMap<(String, String, i64), EventSeverity> = FxHashMap::default();
    for (idx, event) in events.into_iter().enumerate() {
        match grouped_members.get(&idx) {
            None => out.push(event),
            Some(key) => {
                let EventDetails::Interface(details) = &event.details else {
                    continue;
                };
                let entry = emitted.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    GroupedInterfaceDetails {
                        device_pk: details.device_pk.clone(),
                        device_code: details.device_code.clone(),
                        interfaces: Vec::new(),
                    }
                });
                entry.interfaces.push(details.interface.clone());
                let sev = severities.entry(key.clone()).or_insert(event.severity);
                *sev = (*sev).max(event.severity);
            }
        }
    }
    for key in order {
        let (device_pk, event_type, timestamp) = key.clone();
        let Some(mut details) = emitted.remove(&key) else {
            continue;
        };
        details.interfaces.sort();
        details.interfaces.dedup();
        let kind = event_type.trim_start_matches("interface_").replace('_', " ");
        let title = format!(
            "{kind} on {} interfaces on {}",
            details.interfaces.len(),
            details.device_code
        );
        let severity = severities
            .get(&key)
            .copied()
            .unwrap_or(EventSeverity::Warning);
        let device_code = details.device_code.clone();
        out.push(TimelineEvent::new(
            &format!("{device_pk}|grouped"),
            &event_type,
            timestamp,
            severity,
            title,
            EntityType::Device,
            device_pk,
            device_code,
            EventDetails::GroupedInterface(details),
        ));
    }
    out
}

fn is_on_dz(event: &TimelineEvent) -> bool {
    match &event.details {
        EventDetails::Validator(details) => {
            details.on_dz
                || !details.owner_pubkey.is_empty()
                || matches!(
                    event.event_type.as_str(),
                    "validator_joined_dz" | "validator_left_dz" | "validator_stake_changed"
                )
                || event.event_type.ends_with("left_solana")
        }
        // fabric entities are the overlay itself
        _ => true,
    }
}

fn passes_min_stake(event: &TimelineEvent, min_pct: f64) -> bool {
    match &event.details {
        EventDetails::Validator(details) => {
            details.stake_share_pct >= min_pct
                || details
                    .stake_share_change_pct
                    .is_some_and(|change| change.abs() >= min_pct)
        }
        _ => true,
    }
}

/// Filter order: entity type, severity, action category, dz, search,
/// min-stake. Runs after the walk so attribution rewrites are visible.
pub fn filter_events(events: Vec<TimelineEvent>, params: &TimelineParams) -> Vec<TimelineEvent> {
    let terms = params.search.as_deref().map(parse_search);
    events
        .into_iter()
        .filter(|event| {
            if let Some(entity_type) = params.entity_type {
                if event.entity_type != entity_type {
                    return false;
                }
            }
            if let Some(severity) = params.severity {
                if event.severity != severity {
                    return false;
                }
            }
            if let Some(category) = params.category {
                if event.category != category {
                    return false;
                }
            }
            if let Some(dz) = params.dz_filter {
                let on = is_on_dz(event);
                if (dz == DzFilter::OnDz) != on {
                    return false;
                }
            }
            if let Some(terms) = &terms {
                if !event_matches_search(event, terms) {
                    return false;
                }
            }
            if let Some(min_pct) = params.min_stake_pct {
                if matches!(
                    event.entity_type,
                    EntityType::Validator | EntityType::Gossip
                ) && !passes_min_stake(event, min_pct)
                {
                    return false;
                }
            }
            true
        })
        .collect()
}

pub fn paginate(events: Vec<TimelineEvent>, limit: usize, offset: usize) -> Vec<TimelineEvent> {
    let limit = limit.clamp(1, MAX_LIMIT);
    let offset = offset.min(events.len());
    events.into_iter().skip(offset).take(limit).collect()
}

/// The full post-merge pipeline over an already collected event set.
pub fn assemble(
    mut events: Vec<TimelineEvent>,
    params: &TimelineParams,
    anchor: WalkAnchor,
) -> TimelineResponse {
    events = group_interface_events(events);
    event::sort_events(&mut events);
    apply_dz_total_walk(&mut events, anchor);
    let events = dedup_validator_events(events);
    let filtered = filter_events(events, params);
    let histogram = build_histogram(&filtered, params.window);
    let total = filtered.len();
    let events = paginate(filtered, params.limit, params.offset);
    TimelineResponse {
        events,
        total,
        histogram,
        window: params.window,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const BOUNDS_SQL: &str = "\
    SELECT min(earliest) AS earliest, max(latest) AS latest FROM ( \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))) AS earliest, \
               max(toInt64(toUnixTimestamp(snapshot_ts))) AS latest \
        FROM dim_devices_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_links_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_metros_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_contributors_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_users_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_solana_gossip_nodes_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(snapshot_ts))), max(toInt64(toUnixTimestamp(snapshot_ts))) \
        FROM dim_solana_vote_accounts_history \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(event_ts))), max(toInt64(toUnixTimestamp(event_ts))) \
        FROM fact_dz_device_link_latency \
        UNION ALL \
        SELECT min(toInt64(toUnixTimestamp(event_ts))), max(toInt64(toUnixTimestamp(event_ts))) \
        FROM fact_dz_device_interface_counters \
    )";

pub struct TimelineEngine {
    store: ColumnarClient,
    internal_owners: Vec<String>,
}

impl TimelineEngine {
    pub fn new(store: ColumnarClient, internal_owners: Vec<String>) -> Self {
        Self {
            store,
            internal_owners,
        }
    }

    pub async fn bounds(&self) -> Result<TimelineBounds> {
        self.store
            .fetch_one::<TimelineBounds>("timeline_bounds", self.store.query(BOUNDS_SQL))
            .await
    }

    pub async fn build(&self, params: &TimelineParams) -> Result<TimelineResponse> {
        let anchor = match sources::stake_anchor(&self.store).await {
            Ok(row) => WalkAnchor {
                current_dz_total_pct: if row.total_stake > 0 {
                    row.dz_stake as f64 * 100.0 / row.total_stake as f64
                } else {
                    0.0
                },
                total_network_stake_lamports: row.total_stake,
            },
            Err(err) => {
                warn!(%err, "stake anchor unavailable, walk runs from zero");
                WalkAnchor::default()
            }
        };

        let (events, failures) = self
            .collect(params, anchor.total_network_stake_lamports)
            .await;
        let mut response = assemble(events, params, anchor);
        if failures > 0 {
            response.error = Some(format!("{failures} timeline sources unavailable"));
        }
        Ok(response)
    }

    /// Runs all producers concurrently, appending into a shared buffer under
    /// a lock. A failed producer is logged and contributes nothing.
    async fn collect(&self, params: &TimelineParams, total_stake: i64) -> (Vec<TimelineEvent>, usize) {
        type Producer = std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Vec<TimelineEvent>>> + Send>,
        >;

        let window = params.window;
        let include_internal = params.include_internal;
        let store = self.store.clone();
        let owners = self.internal_owners.clone();

        let producers: Vec<(&'static str, Producer)> = vec![
            ("device_cdc", {
                let s = store.clone();
                Box::pin(async move { sources::device_changes(&s, window).await })
            }),
            ("link_cdc", {
                let s = store.clone();
                Box::pin(async move { sources::link_changes(&s, window).await })
            }),
            ("metro_cdc", {
                let s = store.clone();
                Box::pin(async move { sources::metro_changes(&s, window).await })
            }),
            ("contributor_cdc", {
                let s = store.clone();
                Box::pin(async move { sources::contributor_changes(&s, window).await })
            }),
            ("user_cdc", {
                let s = store.clone();
                Box::pin(async move {
                    sources::user_changes(&s, window, include_internal, &owners).await
                })
            }),
            ("packet_loss", {
                let s = store.clone();
                Box::pin(async move { sources::packet_loss_transitions(&s, window).await })
            }),
            ("interfaces", {
                let s = store.clone();
                Box::pin(async move { sources::interface_transitions(&s, window).await })
            }),
            ("dz_membership", {
                let s = store.clone();
                Box::pin(async move {
                    sources::dz_membership_changes(&s, window, total_stake).await
                })
            }),
            ("gossip_offline", {
                let s = store.clone();
                Box::pin(async move { sources::gossip_offline(&s, window).await })
            }),
            ("vote_accounts", {
                let s = store.clone();
                Box::pin(async move {
                    sources::vote_account_changes(&s, window, total_stake).await
                })
            }),
            ("stake_changes", {
                let s = store.clone();
                Box::pin(async move { sources::stake_changes(&s, window, total_stake).await })
            }),
            ("dz_stake", {
                let s = store.clone();
                Box::pin(async move {
                    sources::dz_stake_attribution(&s, window, total_stake).await
                })
            }),
        ];

        let merged: Arc<Mutex<Vec<TimelineEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(0usize));
        let semaphore = Arc::new(Semaphore::new(PRODUCER_CONCURRENCY));
        let mut join_set = JoinSet::new();
        for (name, producer) in producers {
            let merged = Arc::clone(&merged);
            let failures = Arc::clone(&failures);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                match producer.await {
                    Ok(mut events) => merged.lock().append(&mut events),
                    Err(err) => {
                        warn!(source = name, %err, "timeline source failed");
                        *failures.lock() += 1;
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        let events = std::mem::take(&mut *merged.lock());
        let failed = *failures.lock();
        (events, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::event::{EntityChangeDetails, InterfaceDetails, PacketLossDetails};

    fn interface_event(device: &str, intf: &str, ts: i64, event_type: &str) -> TimelineEvent {
        TimelineEvent::new(
            &format!("{device}:{intf}"),
            event_type,
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
                errors_delta: 3,
                discards_delta: 0,
                carrier_transitions_delta: 0,
            }),
        )
    }

    #[test]
    fn interface_grouping_merges_same_triple_only() {
        let events = vec![
            interface_event("dev-a", "et-0/0/1", 100, "interface_errors_started"),
            interface_event("dev-a", "et-0/0/2", 100, "interface_errors_started"),
            interface_event("dev-a", "et-0/0/3", 200, "interface_errors_started"),
            interface_event("dev-b", "et-0/0/1", 100, "interface_errors_started"),
        ];
        let grouped = group_interface_events(events);
        assert_eq!(grouped.len(), 3);
        let group = grouped
            .iter()
            .find(|e| matches!(e.details, EventDetails::GroupedInterface(_)))
            .unwrap();
        let EventDetails::GroupedInterface(details) = &group.details else {
            unreachable!()
        };
        assert_eq!(details.interfaces, vec!["et-0/0/1", "et-0/0/2"]);
        assert_eq!(group.title, "errors started on 2 interfaces on DEV-A");
        assert_eq!(group.event_type, "interface_errors_started");
    }

    fn loss_event(link: &str, ts: i64, loss: f64) -> TimelineEvent {
        TimelineEvent::new(
            link,
            "packet_loss_started",
            ts,
            if loss >= 1.0 {
                EventSeverity::Critical
            } else {
                EventSeverity::Warning
            },
            format!("packet loss started on {link}"),
            EntityType::Link,
            link.to_string(),
            link.to_uppercase(),
            EventDetails::PacketLoss(PacketLossDetails {
                link_pk: link.to_string(),
                link_code: link.to_uppercase(),
                loss_pct: loss,
                previous_loss_pct: 0.0,
            }),
        )
    }

    fn change_event(pk: &str, ts: i64) -> TimelineEvent {
        TimelineEvent::new(
            pk,
            "device_updated",
            ts,
            EventSeverity::Info,
            format!("device {pk} updated"),
            EntityType::Device,
            pk.to_string(),
            pk.to_uppercase(),
            EventDetails::EntityChange(EntityChangeDetails {
                changed_fields: vec!["status".into()],
                is_deleted: false,
            }),
        )
    }

    fn params(window: TimeWindow) -> TimelineParams {
        TimelineParams {
            window,
            entity_type: None,
            severity: None,
            category: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: false,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    #[test]
    fn histogram_buckets_adapt_and_zero_fill() {
        let window = TimeWindow::new(0, 3600);
        assert_eq!(histogram_bucket_secs(window), 300);
        let events = vec![loss_event("l1", 100, 2.0), loss_event("l2", 3599, 0.5)];
        let buckets = build_histogram(&events, window);
        assert_eq!(buckets.len(), 12);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[11].count, 1);
        assert!(buckets[1..11].iter().all(|b| b.count == 0));

        assert_eq!(histogram_bucket_secs(TimeWindow::new(0, 12 * 3600)), 900);
        assert_eq!(histogram_bucket_secs(TimeWindow::new(0, 24 * 3600)), 1800);
        assert_eq!(
            histogram_bucket_secs(TimeWindow::new(0, 3 * 24 * 3600)),
            7200
        );
        assert_eq!(
            histogram_bucket_secs(TimeWindow::new(0, 7 * 24 * 3600)),
            21600
        );
    }

    #[test]
    fn filters_apply_in_order() {
        let window = TimeWindow::new(0, 1000);
        let events = vec![
            loss_event("lnk-1", 100, 2.0),
            change_event("dev-1", 200),
            loss_event("lnk-2", 300, 0.5),
        ];

        let mut p = params(window);
        p.entity_type = Some(EntityType::Link);
        assert_eq!(filter_events(events.clone(), &p).len(), 2);

        let mut p = params(window);
        p.severity = Some(EventSeverity::Critical);
        assert_eq!(filter_events(events.clone(), &p).len(), 1);

        let mut p = params(window);
        p.category = Some(ActionCategory::Alerting);
        assert_eq!(filter_events(events.clone(), &p).len(), 2);

        let mut p = params(window);
        p.search = Some("link:lnk-1".into());
        let hits = filter_events(events, &p);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_pk, "lnk-1");
    }

    #[test]
    fn pagination_clamps() {
        let window = TimeWindow::new(0, 1000);
        let events: Vec<_> = (0..20).map(|i| change_event("d", i)).collect();
        assert_eq!(paginate(events.clone(), 5, 0).len(), 5);
        assert_eq!(paginate(events.clone(), 5, 18).len(), 2);
        assert_eq!(paginate(events.clone(), 5, 999).len(), 0);
        assert_eq!(paginate(events.clone(), 9999, 0).len(), 20);
        let _ = window;
    }

    #[test]
    fn assemble_sorts_and_counts_before_pagination() {
        let window = TimeWindow::new(0, 1000);
        let events = vec![
            change_event("a", 100),
            change_event("b", 300),
            change_event("c", 200),
        ];
        let mut p = params(window);
        p.limit = 2;
        let response = assemble(events, &p, WalkAnchor::default());
        assert_eq!(response.total, 3);
        assert_eq!(response.events.len(), 2);
        assert_eq!(response.events[0].timestamp, 300);
        assert_eq!(response.events[1].timestamp, 200);
        assert!(!response.histogram.is_empty());
    }
}
