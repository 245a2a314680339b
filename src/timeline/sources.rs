//! Timeline source producers.
//!
//! Each producer is one parameterized query against the columnar store that
//! yields `TimelineEvent`s for a time window. Producers are independent and
//! run concurrently; a failing producer contributes nothing and is logged by
//! the orchestrator.
//!
//! CDC producers share a shape: walk a `dim_*_history` table ordered by
//! `(snapshot_ts, ingested_at)` per entity, emit a row whenever `attrs_hash`
//! changes, the row is a deletion, or the row is the entity's first. Rows
//! that are both first for their entity and at the table's earliest snapshot
//! are initial ingestion, not real creations, and are excluded.

use clickhouse::Row;
use serde::Deserialize;

use crate::columnar::ColumnarClient;
use crate::error::Result;
use crate::timeline::event::{
    EntityChangeDetails, EntityType, EventDetails, EventSeverity, InterfaceDetails,
    PacketLossDetails, TimelineEvent, ValidatorDetails,
};
use crate::timeline::TimeWindow;

pub const LAMPORTS_PER_SOL: i64 = 1_000_000_000;

/// Stake-change attribution floor: 10k SOL absolute or 5% relative.
const STAKE_CHANGE_FLOOR_LAMPORTS: i64 = 10_000 * LAMPORTS_PER_SOL;
const STAKE_CHANGE_FLOOR_RATIO: f64 = 0.05;

/// Packet-loss transition boundary in percent.
const LOSS_TRANSITION_PCT: f64 = 0.1;

pub fn short_pubkey(pubkey: &str) -> String {
    if pubkey.len() <= 12 {
        pubkey.to_string()
    } else {
        format!("{}..{}", &pubkey[..4], &pubkey[pubkey.len() - 4..])
    }
}

fn stake_share_pct(stake: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        stake as f64 * 100.0 / total as f64
    }
}

// ---------------------------------------------------------------------------
// Entity CDC
// ---------------------------------------------------------------------------

#[derive(Debug, Row, Deserialize)]
struct CdcRow {
    entity_id: String,
    ts: i64,
    code: String,
    is_deleted: u8,
    is_created: u8,
    changed_fields: Vec<String>,
}

fn cdc_sql(table: &str, tracked: &[(&str, &str)], extra_where: &str) -> String {
    // tracked: (column, display-name) pairs compared against their lag.
    let names = tracked
        .iter()
        .map(|(_, name)| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let flags = tracked
        .iter()
        .map(|(col, _)| format!("{col} != lagInFrame({col}) OVER w"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "WITH rows AS ( \
            SELECT \
                entity_id, \
                toInt64(toUnixTimestamp(snapshot_ts)) AS ts, \
                code, \
                is_deleted, \
                attrs_hash, \
                lagInFrame(attrs_hash) OVER w AS prev_hash, \
                row_number() OVER w AS row_num, \
                snapshot_ts = min(snapshot_ts) OVER () AS at_table_min, \
                arrayFilter((name, changed) -> changed, [{names}], [{flags}]) AS changed_fields \
            FROM {table} \
            WHERE 1 = 1 {extra_where} \
            WINDOW w AS (PARTITION BY entity_id ORDER BY snapshot_ts, ingested_at) \
        ) \
        SELECT entity_id, ts, code, is_deleted, row_num = 1 AS is_created, changed_fields \
        FROM rows \
        WHERE ts >= ? AND ts < ? \
          AND (is_deleted OR row_num = 1 OR attrs_hash != prev_hash) \
          AND NOT (row_num = 1 AND at_table_min) \
        ORDER BY ts"
    )
}

fn cdc_events(rows: Vec<CdcRow>, entity_type: EntityType, noun: &str) -> Vec<TimelineEvent> {
    rows.into_iter()
        .map(|row| {
            let (suffix, severity) = if row.is_deleted != 0 {
                ("deleted", EventSeverity::Warning)
            } else if row.is_created != 0 {
                ("created", EventSeverity::Info)
            } else if row.changed_fields.iter().any(|f| f == "status") {
                ("updated", EventSeverity::Warning)
            } else {
                ("updated", EventSeverity::Info)
            };
            let event_type = format!("{noun}_{suffix}");
            let label = if row.code.is_empty() {
                short_pubkey(&row.entity_id)
            } else {
                row.code.clone()
            };
            let title = if suffix == "updated" && !row.changed_fields.is_empty() {
                format!("{noun} {label} updated ({})", row.changed_fields.join(", "))
            } else {
                format!("{noun} {label} {suffix}")
            };
            TimelineEvent::new(
                &row.entity_id,
                &event_type,
                row.ts,
                severity,
                title,
                entity_type,
                row.entity_id.clone(),
                row.code,
                EventDetails::EntityChange(EntityChangeDetails {
                    changed_fields: row.changed_fields,
                    is_deleted: row.is_deleted != 0,
                }),
            )
        })
        .collect()
}

pub async fn device_changes(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let sql = cdc_sql(
        "dim_devices_history",
        &[
            ("status", "status"),
            ("device_type", "device_type"),
            ("public_ip", "public_ip"),
            ("metro_pk", "metro"),
            ("max_users", "max_users"),
        ],
        "",
    );
    let rows = store
        .fetch_all::<CdcRow>(
            "timeline_device_cdc",
            store.query(&sql).bind(window.start).bind(window.end),
        )
        .await?;
    Ok(cdc_events(rows, EntityType::Device, "device"))
}

pub async fn link_changes(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let sql = cdc_sql(
        "dim_links_history",
        &[
            ("status", "status"),
            ("link_type", "link_type"),
            ("bandwidth_bps", "bandwidth"),
            ("committed_rtt_ns", "committed_rtt"),
            ("isis_delay_override_ns", "delay_override"),
        ],
        "",
    );
    let rows = store
        .fetch_all::<CdcRow>(
            "timeline_link_cdc",
            store.query(&sql).bind(window.start).bind(window.end),
        )
        .await?;
    Ok(cdc_events(rows, EntityType::Link, "link"))
}

pub async fn metro_changes(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let sql = cdc_sql("dim_metros_history", &[("name", "name")], "");
    let rows = store
        .fetch_all::<CdcRow>(
            "timeline_metro_cdc",
            store.query(&sql).bind(window.start).bind(window.end),
        )
        .await?;
    Ok(cdc_events(rows, EntityType::Metro, "metro"))
}

pub async fn contributor_changes(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let sql = cdc_sql("dim_contributors_history", &[("name", "name")], "");
    let rows = store
        .fetch_all::<CdcRow>(
            "timeline_contributor_cdc",
            store.query(&sql).bind(window.start).bind(window.end),
        )
        .await?;
    Ok(cdc_events(rows, EntityType::Contributor, "contributor"))
}

/// User CDC. Validator/gossip-kind users are covered by the DZ join/leave
/// producer and excluded here; internal owner pubkeys are excluded unless
/// the caller opted in.
pub async fn user_changes(
    store: &ColumnarClient,
    window: TimeWindow,
    include_internal: bool,
    internal_owners: &[String],
) -> Result<Vec<TimelineEvent>> {
    let mut extra = " AND user_type NOT IN ('validator', 'gossip')".to_string();
    if !include_internal && !internal_owners.is_empty() {
        extra.push_str(" AND owner_pubkey NOT IN ?");
    }
    let sql = cdc_sql(
        "dim_users_history",
        &[("status", "status"), ("dz_ip", "dz_ip")],
        &extra,
    );
    let mut query = store.query(&sql);
    if !include_internal && !internal_owners.is_empty() {
        query = query.bind(internal_owners);
    }
    let rows = store
        .fetch_all::<CdcRow>(
            "timeline_user_cdc",
            query.bind(window.start).bind(window.end),
        )
        .await?;
    Ok(cdc_events(rows, EntityType::User, "user"))
}

// ---------------------------------------------------------------------------
// Packet-loss transitions
// ---------------------------------------------------------------------------

const PACKET_LOSS_SQL: &str = "\
    WITH hourly AS ( \
        SELECT \
            link_pk, \
            toStartOfInterval(event_ts, INTERVAL 1 HOUR) AS bucket, \
            ifNotFinite(countIf(loss) * 100 / count(), 0) AS loss_pct \
        FROM fact_dz_device_link_latency \
        WHERE event_ts >= toDateTime(?) - INTERVAL 1 HOUR AND event_ts < toDateTime(?) \
        GROUP BY link_pk, bucket \
    ), \
    trans AS ( \
        SELECT \
            link_pk, \
            toInt64(toUnixTimestamp(bucket)) AS ts, \
            loss_pct, \
            lagInFrame(loss_pct, 1, 0.) OVER (PARTITION BY link_pk ORDER BY bucket) AS prev_loss_pct \
        FROM hourly \
    ) \
    SELECT t.link_pk AS link_pk, l.code AS link_code, t.ts AS ts, \
           t.loss_pct AS loss_pct, t.prev_loss_pct AS prev_loss_pct \
    FROM trans AS t \
    LEFT JOIN dz_links_current AS l ON l.pk = t.link_pk \
    WHERE t.ts >= ? AND (t.loss_pct >= ?) != (t.prev_loss_pct >= ?) \
    ORDER BY t.ts";

#[derive(Debug, Row, Deserialize)]
struct PacketLossRow {
    link_pk: String,
    link_code: String,
    ts: i64,
    loss_pct: f64,
    prev_loss_pct: f64,
}

pub async fn packet_loss_transitions(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<PacketLossRow>(
            "timeline_packet_loss",
            store
                .query(PACKET_LOSS_SQL)
                .bind(window.start)
                .bind(window.end)
                .bind(window.start)
                .bind(LOSS_TRANSITION_PCT)
                .bind(LOSS_TRANSITION_PCT),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let started = row.loss_pct >= LOSS_TRANSITION_PCT;
            let (event_type, severity, title) = if started {
                (
                    "packet_loss_started",
                    if row.loss_pct >= 1.0 {
                        EventSeverity::Critical
                    } else {
                        EventSeverity::Warning
                    },
                    format!("packet loss started on {} ({:.1}%)", row.link_code, row.loss_pct),
                )
            } else {
                (
                    "packet_loss_recovered",
                    EventSeverity::Info,
                    format!("packet loss recovered on {}", row.link_code),
                )
            };
            TimelineEvent::new(
                &row.link_pk.clone(),
                event_type,
                row.ts,
                severity,
                title,
                EntityType::Link,
                row.link_pk.clone(),
                row.link_code.clone(),
                EventDetails::PacketLoss(PacketLossDetails {
                    link_pk: row.link_pk,
                    link_code: row.link_code,
                    loss_pct: row.loss_pct,
                    previous_loss_pct: row.prev_loss_pct,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Interface transitions
// ---------------------------------------------------------------------------

// Deltas are floored at zero before aggregation to tolerate counter resets.
const INTERFACE_SQL: &str = "\
    WITH hourly AS ( \
        SELECT \
            device_pk, \
            intf, \
            any(link_pk) AS link_pk, \
            toStartOfInterval(event_ts, INTERVAL 1 HOUR) AS bucket, \
            sum(greatest(in_errors_delta, 0) + greatest(out_errors_delta, 0)) AS errors, \
            sum(greatest(in_discards_delta, 0) + greatest(out_discards_delta, 0)) AS discards, \
            sum(greatest(carrier_transitions_delta, 0)) AS carrier \
        FROM fact_dz_device_interface_counters \
        WHERE event_ts >= toDateTime(?) - INTERVAL 1 HOUR AND event_ts < toDateTime(?) \
        GROUP BY device_pk, intf, bucket \
    ), \
    trans AS ( \
        SELECT \
            device_pk, \
            intf, \
            link_pk, \
            toInt64(toUnixTimestamp(bucket)) AS ts, \
            errors, discards, carrier, \
            lagInFrame(errors, 1, 0) OVER w AS prev_errors, \
            lagInFrame(discards, 1, 0) OVER w AS prev_discards, \
            lagInFrame(carrier, 1, 0) OVER w AS prev_carrier \
        FROM hourly \
        WINDOW w AS (PARTITION BY device_pk, intf ORDER BY bucket) \
    ) \
    SELECT t.device_pk AS device_pk, d.code AS device_code, t.intf AS intf, \
           t.link_pk AS link_pk, l.code AS link_code, t.ts AS ts, \
           t.errors AS errors, t.discards AS discards, t.carrier AS carrier, \
           t.prev_errors AS prev_errors, t.prev_discards AS prev_discards, t.prev_carrier AS prev_carrier \
    FROM trans AS t \
    LEFT JOIN dz_devices_current AS d ON d.pk = t.device_pk \
    LEFT JOIN dz_links_current AS l ON l.pk = t.link_pk \
    WHERE t.ts >= ? \
      AND ((t.errors > 0) != (t.prev_errors > 0) \
        OR (t.discards > 0) != (t.prev_discards > 0) \
        OR (t.carrier > 0) != (t.prev_carrier > 0)) \
    ORDER BY t.ts";

#[derive(Debug, Row, Deserialize)]
struct InterfaceRow {
    device_pk: String,
    device_code: String,
    intf: String,
    link_pk: String,
    link_code: String,
    ts: i64,
    errors: i64,
    discards: i64,
    carrier: i64,
    prev_errors: i64,
    prev_discards: i64,
    prev_carrier: i64,
}

pub async fn interface_transitions(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<InterfaceRow>(
            "timeline_interfaces",
            store
                .query(INTERFACE_SQL)
                .bind(window.start)
                .bind(window.end)
                .bind(window.start),
        )
        .await?;
    let mut events = Vec::new();
    for row in rows {
        let transitions: [(&str, i64, i64); 3] = [
            ("interface_errors", row.errors, row.prev_errors),
            ("interface_discards", row.discards, row.prev_discards),
            ("interface_carrier", row.carrier, row.prev_carrier),
        ];
        for (kind, now, prev) in transitions {
            if (now > 0) == (prev > 0) {
                continue;
            }
            let started = now > 0;
            let suffix = if started { "started" } else { "stopped" };
            let event_type = format!("{kind}_{suffix}");
            let noun = kind.trim_start_matches("interface_").replace('_', " ");
            let title = format!("{noun} {suffix} on {} {}", row.device_code, row.intf);
            let severity = if started {
                EventSeverity::Warning
            } else {
                EventSeverity::Info
            };
            let entity_id = format!("{}:{}", row.device_pk, row.intf);
            events.push(TimelineEvent::new(
                &entity_id,
                &event_type,
                row.ts,
                severity,
                title,
                EntityType::Device,
                row.device_pk.clone(),
                row.device_code.clone(),
                EventDetails::Interface(InterfaceDetails {
                    device_pk: row.device_pk.clone(),
                    device_code: row.device_code.clone(),
                    interface: row.intf.clone(),
                    link_pk: row.link_pk.clone(),
                    link_code: row.link_code.clone(),
                    errors_delta: row.errors.max(0),
                    discards_delta: row.discards.max(0),
                    carrier_transitions_delta: row.carrier.max(0),
                }),
            ));
        }
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Validator / gossip DZ membership
// ---------------------------------------------------------------------------

// Detected from user activation transitions, joined to gossip and
// vote-account data by IP. A matching vote account makes it a validator
// event, otherwise gossip-only.
const DZ_MEMBERSHIP_SQL: &str = "\
    WITH trans AS ( \
        SELECT \
            entity_id AS user_pk, \
            toInt64(toUnixTimestamp(snapshot_ts)) AS ts, \
            owner_pubkey, \
            dz_ip, \
            status, \
            lagInFrame(status, 1, '') OVER w AS prev_status, \
            row_number() OVER w AS row_num, \
            snapshot_ts = min(snapshot_ts) OVER () AS at_table_min \
        FROM dim_users_history \
        WHERE user_type IN ('validator', 'gossip') \
        WINDOW w AS (PARTITION BY entity_id ORDER BY snapshot_ts, ingested_at) \
    ) \
    SELECT t.user_pk AS user_pk, t.ts AS ts, t.owner_pubkey AS owner_pubkey, \
           t.dz_ip AS dz_ip, t.status = 'activated' AS joined, \
           g.pubkey AS node_pubkey, v.vote_pubkey AS vote_pubkey, \
           v.activated_stake AS stake_lamports \
    FROM trans AS t \
    LEFT JOIN solana_gossip_nodes_current AS g ON g.gossip_ip = t.dz_ip \
    LEFT JOIN solana_vote_accounts_current AS v ON v.node_pubkey = g.pubkey \
    WHERE t.ts >= ? AND t.ts < ? \
      AND (t.status = 'activated') != (t.prev_status = 'activated') \
      AND NOT (t.row_num = 1 AND t.at_table_min) \
    ORDER BY t.ts";

#[derive(Debug, Row, Deserialize)]
struct DzMembershipRow {
    user_pk: String,
    ts: i64,
    owner_pubkey: String,
    dz_ip: String,
    joined: u8,
    node_pubkey: String,
    vote_pubkey: String,
    stake_lamports: i64,
}

pub async fn dz_membership_changes(
    store: &ColumnarClient,
    window: TimeWindow,
    total_network_stake: i64,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<DzMembershipRow>(
            "timeline_dz_membership",
            store
                .query(DZ_MEMBERSHIP_SQL)
                .bind(window.start)
                .bind(window.end),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let is_validator = !row.vote_pubkey.is_empty();
            let joined = row.joined != 0;
            let (noun, entity_type) = if is_validator {
                ("validator", EntityType::Validator)
            } else {
                ("gossip", EntityType::Gossip)
            };
            let suffix = if joined { "joined_dz" } else { "left_dz" };
            let event_type = format!("{noun}_{suffix}");
            let identity = if is_validator {
                row.vote_pubkey.clone()
            } else {
                row.node_pubkey.clone()
            };
            let label = short_pubkey(if identity.is_empty() {
                &row.user_pk
            } else {
                &identity
            });
            let verb = if joined { "joined" } else { "left" };
            let title = if is_validator {
                format!("validator {label} {verb} DZ")
            } else {
                format!("gossip node {label} {verb} DZ")
            };
            let severity = if joined {
                EventSeverity::Info
            } else {
                EventSeverity::Warning
            };
            TimelineEvent::new(
                &format!("{}|{}", row.user_pk, identity),
                &event_type,
                row.ts,
                severity,
                title,
                entity_type,
                if identity.is_empty() {
                    row.user_pk.clone()
                } else {
                    identity.clone()
                },
                label,
                EventDetails::Validator(ValidatorDetails {
                    vote_pubkey: row.vote_pubkey,
                    node_pubkey: row.node_pubkey,
                    owner_pubkey: row.owner_pubkey,
                    gossip_ip: row.dz_ip,
                    stake_lamports: row.stake_lamports,
                    stake_share_pct: stake_share_pct(row.stake_lamports, total_network_stake),
                    stake_share_change_pct: None,
                    contribution_change_lamports: 0,
                    dz_total_stake_share_pct: 0.0,
                    on_dz: joined,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Gossip-network offline
// ---------------------------------------------------------------------------

const GOSSIP_OFFLINE_SQL: &str = "\
    SELECT \
        h.pubkey AS pubkey, \
        any(h.gossip_ip) AS gossip_ip, \
        max(toInt64(toUnixTimestamp(h.snapshot_ts))) AS last_seen \
    FROM dim_solana_gossip_nodes_history AS h \
    LEFT ANTI JOIN solana_gossip_nodes_current AS c ON c.pubkey = h.pubkey \
    GROUP BY h.pubkey \
    HAVING last_seen >= ? AND last_seen < ? \
    ORDER BY last_seen";

#[derive(Debug, Row, Deserialize)]
struct GossipOfflineRow {
    pubkey: String,
    gossip_ip: String,
    last_seen: i64,
}

pub async fn gossip_offline(
    store: &ColumnarClient,
    window: TimeWindow,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<GossipOfflineRow>(
            "timeline_gossip_offline",
            store
                .query(GOSSIP_OFFLINE_SQL)
                .bind(window.start)
                .bind(window.end),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let label = short_pubkey(&row.pubkey);
            TimelineEvent::new(
                &row.pubkey.clone(),
                "gossip_left_solana",
                row.last_seen,
                EventSeverity::Info,
                format!("gossip node {label} went offline"),
                EntityType::Gossip,
                row.pubkey.clone(),
                label,
                EventDetails::Validator(ValidatorDetails {
                    vote_pubkey: String::new(),
                    node_pubkey: row.pubkey,
                    owner_pubkey: String::new(),
                    gossip_ip: row.gossip_ip,
                    stake_lamports: 0,
                    stake_share_pct: 0.0,
                    stake_share_change_pct: None,
                    contribution_change_lamports: 0,
                    dz_total_stake_share_pct: 0.0,
                    on_dz: false,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Vote-account join/leave (Solana-network level)
// ---------------------------------------------------------------------------

const VOTE_ACCOUNT_SQL: &str = "\
    WITH rows AS ( \
        SELECT \
            entity_id AS vote_pubkey, \
            node_pubkey, \
            activated_stake, \
            toInt64(toUnixTimestamp(snapshot_ts)) AS ts, \
            is_deleted, \
            row_number() OVER w AS row_num, \
            snapshot_ts = min(snapshot_ts) OVER () AS at_table_min \
        FROM dim_solana_vote_accounts_history \
        WINDOW w AS (PARTITION BY entity_id ORDER BY snapshot_ts, ingested_at) \
    ) \
    SELECT vote_pubkey, node_pubkey, activated_stake, ts, is_deleted, row_num = 1 AS is_first \
    FROM rows \
    WHERE ts >= ? AND ts < ? \
      AND (is_deleted OR row_num = 1) \
      AND NOT (row_num = 1 AND at_table_min) \
    ORDER BY ts";

#[derive(Debug, Row, Deserialize)]
struct VoteAccountRow {
    vote_pubkey: String,
    node_pubkey: String,
    activated_stake: i64,
    ts: i64,
    is_deleted: u8,
    #[allow(dead_code)]
    is_first: u8,
}

pub async fn vote_account_changes(
    store: &ColumnarClient,
    window: TimeWindow,
    total_network_stake: i64,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<VoteAccountRow>(
            "timeline_vote_accounts",
            store
                .query(VOTE_ACCOUNT_SQL)
                .bind(window.start)
                .bind(window.end),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let left = row.is_deleted != 0;
            let (event_type, severity, verb) = if left {
                ("validator_left_solana", EventSeverity::Warning, "left")
            } else {
                ("validator_joined_solana", EventSeverity::Info, "joined")
            };
            let label = short_pubkey(&row.vote_pubkey);
            TimelineEvent::new(
                &row.vote_pubkey.clone(),
                event_type,
                row.ts,
                severity,
                format!("validator {label} {verb} Solana"),
                EntityType::Validator,
                row.vote_pubkey.clone(),
                label,
                EventDetails::Validator(ValidatorDetails {
                    vote_pubkey: row.vote_pubkey,
                    node_pubkey: row.node_pubkey,
                    owner_pubkey: String::new(),
                    gossip_ip: String::new(),
                    stake_lamports: row.activated_stake,
                    stake_share_pct: stake_share_pct(row.activated_stake, total_network_stake),
                    stake_share_change_pct: None,
                    contribution_change_lamports: 0,
                    dz_total_stake_share_pct: 0.0,
                    on_dz: false,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Stake-change attribution (Solana-network level)
// ---------------------------------------------------------------------------

const STAKE_CHANGE_SQL: &str = "\
    WITH rows AS ( \
        SELECT \
            entity_id AS vote_pubkey, \
            node_pubkey, \
            activated_stake, \
            toInt64(toUnixTimestamp(snapshot_ts)) AS ts, \
            lagInFrame(activated_stake, 1, 0) OVER w AS prev_stake, \
            row_number() OVER w AS row_num \
        FROM dim_solana_vote_accounts_history \
        WHERE is_deleted = 0 \
        WINDOW w AS (PARTITION BY entity_id ORDER BY snapshot_ts, ingested_at) \
    ) \
    SELECT r.vote_pubkey AS vote_pubkey, r.node_pubkey AS node_pubkey, \
           r.activated_stake AS activated_stake, r.prev_stake AS prev_stake, r.ts AS ts, \
           u.pk != '' AS on_dz, g.gossip_ip AS gossip_ip \
    FROM rows AS r \
    LEFT JOIN solana_gossip_nodes_current AS g ON g.pubkey = r.node_pubkey \
    LEFT JOIN dz_users_current AS u ON u.dz_ip = g.gossip_ip AND u.status = 'activated' \
    WHERE r.row_num > 1 AND r.ts >= ? AND r.ts < ? \
      AND (abs(r.activated_stake - r.prev_stake) >= ? \
        OR (r.prev_stake > 0 AND abs(r.activated_stake - r.prev_stake) >= r.prev_stake * ?)) \
    ORDER BY r.ts";

#[derive(Debug, Row, Deserialize)]
struct StakeChangeRow {
    vote_pubkey: String,
    node_pubkey: String,
    activated_stake: i64,
    prev_stake: i64,
    ts: i64,
    on_dz: u8,
    gossip_ip: String,
}

pub async fn stake_changes(
    store: &ColumnarClient,
    window: TimeWindow,
    total_network_stake: i64,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<StakeChangeRow>(
            "timeline_stake_changes",
            store
                .query(STAKE_CHANGE_SQL)
                .bind(window.start)
                .bind(window.end)
                .bind(STAKE_CHANGE_FLOOR_LAMPORTS)
                .bind(STAKE_CHANGE_FLOOR_RATIO),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let delta = row.activated_stake - row.prev_stake;
            let (event_type, verb) = if delta >= 0 {
                ("validator_stake_increased", "increased")
            } else {
                ("validator_stake_decreased", "decreased")
            };
            let on_dz = row.on_dz != 0;
            let label = short_pubkey(&row.vote_pubkey);
            let sol = delta.abs() / LAMPORTS_PER_SOL;
            let prefix = if on_dz { "DZ validator" } else { "validator" };
            let title = format!("{prefix} {label} stake {verb} by {sol} SOL");
            TimelineEvent::new(
                &row.vote_pubkey.clone(),
                event_type,
                row.ts,
                EventSeverity::Info,
                title,
                EntityType::Validator,
                row.vote_pubkey.clone(),
                label,
                EventDetails::Validator(ValidatorDetails {
                    vote_pubkey: row.vote_pubkey,
                    node_pubkey: row.node_pubkey,
                    owner_pubkey: String::new(),
                    gossip_ip: row.gossip_ip,
                    stake_lamports: row.activated_stake,
                    stake_share_pct: stake_share_pct(row.activated_stake, total_network_stake),
                    stake_share_change_pct: Some(stake_share_pct(delta, total_network_stake)),
                    contribution_change_lamports: 0,
                    dz_total_stake_share_pct: 0.0,
                    on_dz,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// DZ-stake attribution
// ---------------------------------------------------------------------------

// Per snapshot pair where a validator's DZ contribution changed: joined DZ,
// left DZ, or stake changed while on DZ. These are the only events that
// carry a non-zero contribution change and thus advance the DZ-total walk.
const DZ_STAKE_SQL: &str = "\
    WITH contributions AS ( \
        SELECT \
            v.entity_id AS vote_pubkey, \
            v.node_pubkey AS node_pubkey, \
            v.snapshot_ts AS snapshot_ts, \
            v.ingested_at AS ingested_at, \
            v.activated_stake AS stake, \
            if(u.entity_id != '' AND u.status = 'activated', v.activated_stake, 0) AS dz_contribution \
        FROM dim_solana_vote_accounts_history AS v \
        LEFT JOIN solana_gossip_nodes_current AS g ON g.pubkey = v.node_pubkey \
        ASOF LEFT JOIN ( \
            SELECT entity_id, dz_ip, status, snapshot_ts \
            FROM dim_users_history \
            WHERE user_type = 'validator' \
        ) AS u ON u.dz_ip = g.gossip_ip AND u.snapshot_ts <= v.snapshot_ts \
        WHERE v.is_deleted = 0 \
    ), \
    deltas AS ( \
        SELECT \
            vote_pubkey, \
            node_pubkey, \
            toInt64(toUnixTimestamp(snapshot_ts)) AS ts, \
            stake, \
            dz_contribution, \
            lagInFrame(dz_contribution, 1, 0) OVER w AS prev_contribution, \
            row_number() OVER w AS row_num \
        FROM contributions \
        WINDOW w AS (PARTITION BY vote_pubkey ORDER BY snapshot_ts, ingested_at) \
    ) \
    SELECT vote_pubkey, node_pubkey, ts, stake, dz_contribution, prev_contribution \
    FROM deltas \
    WHERE row_num > 1 AND ts >= ? AND ts < ? AND dz_contribution != prev_contribution \
    ORDER BY ts";

#[derive(Debug, Row, Deserialize)]
struct DzStakeRow {
    vote_pubkey: String,
    node_pubkey: String,
    ts: i64,
    stake: i64,
    dz_contribution: i64,
    prev_contribution: i64,
}

pub async fn dz_stake_attribution(
    store: &ColumnarClient,
    window: TimeWindow,
    total_network_stake: i64,
) -> Result<Vec<TimelineEvent>> {
    let rows = store
        .fetch_all::<DzStakeRow>(
            "timeline_dz_stake",
            store
                .query(DZ_STAKE_SQL)
                .bind(window.start)
                .bind(window.end),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let change = row.dz_contribution - row.prev_contribution;
            let (event_type, title_verb) = if row.prev_contribution == 0 {
                ("validator_joined_dz", "joined DZ")
            } else if row.dz_contribution == 0 {
                ("validator_left_dz", "left DZ")
            } else {
                ("validator_stake_changed", "stake changed on DZ")
            };
            let label = short_pubkey(&row.vote_pubkey);
            TimelineEvent::new(
                &row.vote_pubkey.clone(),
                event_type,
                row.ts,
                EventSeverity::Info,
                format!("validator {label} {title_verb}"),
                EntityType::Validator,
                row.vote_pubkey.clone(),
                label,
                EventDetails::Validator(ValidatorDetails {
                    vote_pubkey: row.vote_pubkey,
                    node_pubkey: row.node_pubkey,
                    owner_pubkey: String::new(),
                    gossip_ip: String::new(),
                    stake_lamports: row.stake,
                    stake_share_pct: stake_share_pct(row.stake, total_network_stake),
                    stake_share_change_pct: None,
                    contribution_change_lamports: change,
                    dz_total_stake_share_pct: 0.0,
                    on_dz: row.dz_contribution > 0,
                }),
            )
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Walk anchor
// ---------------------------------------------------------------------------

const ANCHOR_SQL: &str = "\
    SELECT \
        sum(v.activated_stake) AS total_stake, \
        sumIf(v.activated_stake, u.pk != '') AS dz_stake \
    FROM solana_vote_accounts_current AS v \
    LEFT JOIN solana_gossip_nodes_current AS g ON g.pubkey = v.node_pubkey \
    LEFT JOIN dz_users_current AS u ON u.dz_ip = g.gossip_ip AND u.status = 'activated'";

#[derive(Debug, Row, Deserialize)]
pub struct StakeAnchorRow {
    pub total_stake: i64,
    pub dz_stake: i64,
}

/// Reads the walk anchor: total network stake and the DZ share of it right
/// now. Total-network-stake comes from the current vote-account table at
/// walk time, so transient shifts inside the window are not reconstructed.
pub async fn stake_anchor(store: &ColumnarClient) -> Result<StakeAnchorRow> {
    store
        .fetch_one::<StakeAnchorRow>("timeline_stake_anchor", store.query(ANCHOR_SQL))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_pubkey_keeps_small_ids() {
        assert_eq!(short_pubkey("abc"), "abc");
        assert_eq!(
            short_pubkey("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"),
            "9WzD..AWWM"
        );
    }

    #[test]
    fn stake_share_guards_zero_total() {
        assert_eq!(stake_share_pct(500, 0), 0.0);
        assert!((stake_share_pct(5, 1_000) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cdc_sql_embeds_tracked_fields() {
        let sql = cdc_sql("dim_devices_history", &[("status", "status")], "");
        assert!(sql.contains("dim_devices_history"));
        assert!(sql.contains("'status'"));
        assert!(sql.contains("lagInFrame(status)"));
        assert!(sql.contains("row_num = 1 AND at_table_min"));
    }

    #[test]
    fn cdc_events_classify_rows() {
        let rows = vec![
            CdcRow {
                entity_id: "d1".into(),
                ts: 100,
                code: "LAX01".into(),
                is_deleted: 0,
                is_created: 1,
                changed_fields: vec![],
            },
            CdcRow {
                entity_id: "d1".into(),
                ts: 200,
                code: "LAX01".into(),
                is_deleted: 0,
                is_created: 0,
                changed_fields: vec!["status".into()],
            },
            CdcRow {
                entity_id: "d1".into(),
                ts: 300,
                code: "LAX01".into(),
                is_deleted: 1,
                is_created: 0,
                changed_fields: vec![],
            },
        ];
        let events = cdc_events(rows, EntityType::Device, "device");
        assert_eq!(events[0].event_type, "device_created");
        assert_eq!(events[0].severity, EventSeverity::Info);
        assert_eq!(events[1].event_type, "device_updated");
        assert_eq!(events[1].severity, EventSeverity::Warning);
        assert_eq!(events[1].title, "device LAX01 updated (status)");
        assert_eq!(events[2].event_type, "device_deleted");
        assert_eq!(events[2].severity, EventSeverity::Warning);
    }
}
