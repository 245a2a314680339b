//! Composite status snapshot: concurrent fan-out across the analytical
//! queries, SLA classification, thresholded issue selection and issue-start
//! derivation. A failed sub-query leaves its slot zeroed and is recorded in
//! the document's `error`; the snapshot itself always materializes.

use std::sync::Arc;

use clickhouse::Row;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::columnar::{finite, ColumnarClient};
use crate::error::Result;
use crate::graph::GraphClient;
use crate::model::{classify_sla, latency_overage_pct, HealthState, SOFT_DRAIN_DELAY_OVERRIDE_NS};

/// Packet-loss issue threshold; also the "healthy hour" boundary for
/// issue-start derivation.
const LOSS_ISSUE_PCT: f64 = 1.0;
const LATENCY_ISSUE_PCT: f64 = 20.0;
const HIGH_UTILIZATION_PCT: f64 = 80.0;

const ISSUE_LIMIT: usize = 10;
const ALERT_LIMIT: usize = 50;
const INTERFACE_LIMIT: usize = 20;
const UTILIZATION_LIMIT: usize = 100;

/// Seconds added to a silent link's last sample to mark the no-data start.
const NO_DATA_GRACE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemHealth {
    pub columnar_ok: bool,
    pub graph_ok: bool,
    pub latest_telemetry_ts: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkSummary {
    pub users: i64,
    pub devices: i64,
    pub links: i64,
    pub contributors: i64,
    pub metros: i64,
    pub activated_bandwidth_bps: i64,
    pub user_inbound_bps: i64,
    pub validators_on_dz: i64,
    pub total_stake_sol: f64,
    pub stake_share_pct: f64,
    pub stake_share_delta_24h_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkIssueKind {
    PacketLoss,
    HighLatency,
    Disabled,
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkIssue {
    pub link_pk: String,
    pub link_code: String,
    pub kind: LinkIssueKind,
    pub severity: &'static str,
    pub loss_pct: f64,
    pub latency_overage_pct: f64,
    /// Derived issue start, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkUtilization {
    pub link_pk: String,
    pub link_code: String,
    pub bandwidth_bps: i64,
    pub bps: i64,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub disabled: usize,
    pub avg_loss_pct: f64,
    pub issues: Vec<LinkIssue>,
    pub top_utilization: Vec<LinkUtilization>,
    pub high_utilization: Vec<LinkUtilization>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceIssue {
    pub device_pk: String,
    pub device_code: String,
    pub interface: String,
    pub errors: i64,
    pub discards: i64,
    pub carrier_transitions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEntry {
    pub entity: &'static str,
    pub pk: String,
    pub code: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerformanceSummary {
    pub avg_rtt_ms: f64,
    pub avg_jitter_ms: f64,
    pub avg_loss_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceUtilization {
    pub device_pk: String,
    pub device_code: String,
    pub current_users: i64,
    pub max_users: i64,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub generated_at: i64,
    pub overall: HealthState,
    pub system: SystemHealth,
    pub network: NetworkSummary,
    pub links: LinkHealthSummary,
    pub interfaces: Vec<InterfaceIssue>,
    pub alerts: Vec<AlertEntry>,
    pub performance: PerformanceSummary,
    pub top_devices: Vec<DeviceUtilization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

const LATEST_TELEMETRY_SQL: &str = "\
    SELECT toInt64(max(toUnixTimestamp(event_ts))) AS value \
    FROM fact_dz_device_link_latency";

const COUNTS_SQL: &str = "\
    SELECT \
        (SELECT toInt64(count()) FROM dz_users_current) AS users, \
        (SELECT toInt64(count()) FROM dz_devices_current) AS devices, \
        (SELECT toInt64(count()) FROM dz_links_current) AS links, \
        (SELECT toInt64(count()) FROM dz_contributors_current) AS contributors, \
        (SELECT toInt64(count()) FROM dz_metros_current) AS metros, \
        (SELECT toInt64(sum(bandwidth_bps)) FROM dz_links_current WHERE status = 'activated') AS activated_bandwidth_bps";

const USER_INBOUND_SQL: &str = "\
    SELECT toInt64(sum(greatest(in_octets_delta, 0)) * 8 / 3600) AS value \
    FROM fact_dz_device_interface_counters \
    WHERE event_ts >= now() - INTERVAL 1 HOUR AND isNotNull(user_tunnel_id)";

const DZ_STAKE_SQL: &str = "\
    SELECT \
        toInt64(countIf(u.pk != '')) AS validators_on_dz, \
        toInt64(sumIf(v.activated_stake, u.pk != '')) AS dz_stake, \
        toInt64(sum(v.activated_stake)) AS total_stake \
    FROM solana_vote_accounts_current AS v \
    LEFT JOIN solana_gossip_nodes_current AS g ON g.pubkey = v.node_pubkey \
    LEFT JOIN dz_users_current AS u ON u.dz_ip = g.gossip_ip AND u.status = 'activated'";

// DZ/total stake as of 24 hours ago, from the dimensional history.
const DZ_STAKE_24H_SQL: &str = "\
    WITH past AS ( \
        SELECT entity_id, argMax(activated_stake, snapshot_ts) AS stake, \
               argMax(node_pubkey, snapshot_ts) AS node_pubkey, \
               argMax(is_deleted, snapshot_ts) AS is_deleted \
        FROM dim_solana_vote_accounts_history \
        WHERE snapshot_ts <= now() - INTERVAL 24 HOUR \
        GROUP BY entity_id \
    ) \
    SELECT \
        toInt64(sumIf(p.stake, u.pk != '')) AS dz_stake, \
        toInt64(sum(p.stake)) AS total_stake \
    FROM past AS p \
    LEFT JOIN solana_gossip_nodes_current AS g ON g.pubkey = p.node_pubkey \
    LEFT JOIN dz_users_current AS u ON u.dz_ip = g.gossip_ip AND u.status = 'activated' \
    WHERE p.is_deleted = 0";

const LINK_HEALTH_SQL: &str = "\
    SELECT \
        l.pk AS pk, \
        l.code AS code, \
        l.link_type AS link_type, \
        l.committed_rtt_ns AS committed_rtt_ns, \
        da.metro_pk AS metro_a, \
        dz.metro_pk AS metro_z, \
        ifNotFinite(avg(f.rtt_us), 0) AS avg_rtt_us, \
        ifNotFinite(countIf(f.loss) * 100 / count(f.event_ts), 0) AS loss_pct, \
        toInt64(count(f.event_ts)) AS samples \
    FROM dz_links_current AS l \
    LEFT JOIN fact_dz_device_link_latency AS f \
        ON f.link_pk = l.pk AND f.event_ts >= now() - INTERVAL 1 HOUR \
    LEFT JOIN dz_devices_current AS da ON da.pk = l.side_a_pk \
    LEFT JOIN dz_devices_current AS dz ON dz.pk = l.side_z_pk \
    WHERE l.status = 'activated' \
    GROUP BY pk, code, link_type, committed_rtt_ns, metro_a, metro_z";

const LINK_UTILIZATION_SQL: &str = "\
    SELECT \
        l.pk AS pk, \
        l.code AS code, \
        l.bandwidth_bps AS bandwidth_bps, \
        toInt64(sum(greatest(c.in_octets_delta, 0) + greatest(c.out_octets_delta, 0)) * 8 / 3600) AS bps \
    FROM fact_dz_device_interface_counters AS c \
    INNER JOIN dz_links_current AS l ON l.pk = c.link_pk \
    WHERE c.event_ts >= now() - INTERVAL 1 HOUR AND l.status = 'activated' \
    GROUP BY pk, code, bandwidth_bps \
    ORDER BY ifNotFinite(bps / bandwidth_bps, 0) DESC \
    LIMIT ?";

const INTERFACE_ISSUES_SQL: &str = "\
    SELECT \
        c.device_pk AS device_pk, \
        d.code AS device_code, \
        c.intf AS intf, \
        toInt64(sum(greatest(c.in_errors_delta, 0) + greatest(c.out_errors_delta, 0))) AS errors, \
        toInt64(sum(greatest(c.in_discards_delta, 0) + greatest(c.out_discards_delta, 0))) AS discards, \
        toInt64(sum(greatest(c.carrier_transitions_delta, 0))) AS carrier_transitions \
    FROM fact_dz_device_interface_counters AS c \
    LEFT JOIN dz_devices_current AS d ON d.pk = c.device_pk \
    WHERE c.event_ts >= now() - INTERVAL 1 HOUR \
    GROUP BY device_pk, device_code, intf \
    HAVING errors + discards + carrier_transitions > 0 \
    ORDER BY errors + discards + carrier_transitions DESC \
    LIMIT ?";

const DEVICE_ALERTS_SQL: &str = "\
    SELECT pk, code, status FROM dz_devices_current \
    WHERE status != 'activated' \
    ORDER BY code \
    LIMIT ?";

const LINK_ALERTS_SQL: &str = "\
    SELECT pk, code, \
           if(isis_delay_override_ns = ?, 'soft-drained', status) AS status \
    FROM dz_links_current \
    WHERE status != 'activated' OR isis_delay_override_ns = ? \
    ORDER BY code \
    LIMIT ?";

const PERFORMANCE_SQL: &str = "\
    SELECT \
        ifNotFinite(avg(f.rtt_us) / 1000, 0) AS avg_rtt_ms, \
        ifNotFinite(avg(f.ipdv_us) / 1000, 0) AS avg_jitter_ms, \
        ifNotFinite(countIf(f.loss) * 100 / count(), 0) AS avg_loss_pct \
    FROM fact_dz_device_link_latency AS f \
    INNER JOIN dz_links_current AS l ON l.pk = f.link_pk \
    WHERE l.status = 'activated' AND l.link_type = 'wan' \
      AND f.event_ts >= now() - INTERVAL 3 HOUR";

const DEVICE_UTILIZATION_SQL: &str = "\
    SELECT \
        d.pk AS pk, \
        d.code AS code, \
        toInt64(count(u.pk)) AS current_users, \
        d.max_users AS max_users \
    FROM dz_devices_current AS d \
    LEFT JOIN dz_users_current AS u ON u.device_pk = d.pk AND u.status = 'activated' \
    WHERE d.max_users > 0 \
    GROUP BY pk, code, max_users \
    ORDER BY ifNotFinite(current_users / max_users, 0) DESC \
    LIMIT ?";

const HOURLY_LOSS_SQL: &str = "\
    SELECT \
        link_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(event_ts, INTERVAL 1 HOUR))) AS hour_ts, \
        ifNotFinite(countIf(loss) * 100 / count(), 0) AS loss_pct \
    FROM fact_dz_device_link_latency \
    WHERE link_pk IN ? AND event_ts >= now() - INTERVAL 7 DAY \
    GROUP BY link_pk, hour_ts \
    ORDER BY link_pk, hour_ts";

const NO_DATA_SQL: &str = "\
    SELECT \
        l.pk AS pk, \
        l.code AS code, \
        max(toInt64(toUnixTimestamp(f.event_ts))) AS last_seen \
    FROM dz_links_current AS l \
    INNER JOIN fact_dz_device_link_latency AS f ON f.link_pk = l.pk \
    WHERE l.status = 'activated' AND l.isis_delay_override_ns != ? \
      AND f.event_ts >= now() - INTERVAL 30 DAY \
    GROUP BY pk, code \
    HAVING last_seen < toInt64(toUnixTimestamp(now() - INTERVAL 15 MINUTE)) \
    ORDER BY last_seen \
    LIMIT ?";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Row, Deserialize)]
struct ScalarI64Row {
    value: i64,
}

#[derive(Debug, Row, Deserialize)]
struct CountsRow {
    users: i64,
    devices: i64,
    links: i64,
    contributors: i64,
    metros: i64,
    activated_bandwidth_bps: i64,
}

#[derive(Debug, Row, Deserialize)]
struct DzStakeRow {
    validators_on_dz: i64,
    dz_stake: i64,
    total_stake: i64,
}

#[derive(Debug, Row, Deserialize)]
struct PastStakeRow {
    dz_stake: i64,
    total_stake: i64,
}

#[derive(Debug, Row, Deserialize)]
struct LinkHealthRow {
    pk: String,
    code: String,
    link_type: String,
    committed_rtt_ns: i64,
    metro_a: String,
    metro_z: String,
    avg_rtt_us: f64,
    loss_pct: f64,
    samples: i64,
}

#[derive(Debug, Row, Deserialize)]
struct UtilizationRow {
    pk: String,
    code: String,
    bandwidth_bps: i64,
    bps: i64,
}

#[derive(Debug, Row, Deserialize)]
struct InterfaceIssueRow {
    device_pk: String,
    device_code: String,
    intf: String,
    errors: i64,
    discards: i64,
    carrier_transitions: i64,
}

#[derive(Debug, Row, Deserialize)]
struct AlertRow {
    pk: String,
    code: String,
    status: String,
}

#[derive(Debug, Row, Deserialize)]
struct PerformanceRow {
    avg_rtt_ms: f64,
    avg_jitter_ms: f64,
    avg_loss_pct: f64,
}

#[derive(Debug, Row, Deserialize)]
struct DeviceUtilizationRow {
    pk: String,
    code: String,
    current_users: i64,
    max_users: i64,
}

#[derive(Debug, Row, Deserialize)]
struct HourlyLossRow {
    link_pk: String,
    hour_ts: i64,
    loss_pct: f64,
}

#[derive(Debug, Row, Deserialize)]
struct NoDataRow {
    pk: String,
    code: String,
    last_seen: i64,
}

// ---------------------------------------------------------------------------
// Pure logic
// ---------------------------------------------------------------------------

/// Issue start from 7 days of hourly loss: the hour after the last healthy
/// one, else the first issue hour. `None` drops the issue (its computed
/// start is in the future, meaning the current hour is healthy).
pub fn derive_issue_start(hours: &[(i64, f64)], now: i64) -> Option<i64> {
    if hours.is_empty() {
        return None;
    }
    let mut last_healthy: Option<i64> = None;
    let mut first_issue: Option<i64> = None;
    for &(hour_ts, loss_pct) in hours {
        if loss_pct < LOSS_ISSUE_PCT {
            last_healthy = Some(hour_ts);
        } else if first_issue.is_none() {
            first_issue = Some(hour_ts);
        }
    }
    let start = match last_healthy {
        Some(healthy) => healthy + 3600,
        None => first_issue?,
    };
    if start > now {
        None
    } else {
        Some(start)
    }
}

/// Overall roll-up per the snapshot rules.
pub fn overall_status(
    columnar_ok: bool,
    total: usize,
    degraded: usize,
    unhealthy: usize,
    avg_loss_pct: f64,
) -> HealthState {
    let pct = |n: usize| {
        if total == 0 {
            0.0
        } else {
            n as f64 * 100.0 / total as f64
        }
    };
    if !columnar_ok || pct(unhealthy) > 10.0 || avg_loss_pct >= 10.0 {
        HealthState::Unhealthy
    } else if pct(degraded) > 20.0 || unhealthy > 0 || avg_loss_pct >= 1.0 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

fn classify_health_row(row: &LinkHealthRow) -> (HealthState, f64) {
    let eligible = row.link_type == "wan"
        && !row.metro_a.is_empty()
        && !row.metro_z.is_empty()
        && row.metro_a != row.metro_z
        && row.committed_rtt_ns > 0;
    let overage = latency_overage_pct(
        finite(row.avg_rtt_us),
        row.committed_rtt_ns as f64 / 1_000.0,
        eligible,
    );
    (classify_sla(finite(row.loss_pct), overage), overage)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct StatusBuilder {
    graph: Arc<GraphClient>,
    columnar: ColumnarClient,
}

impl StatusBuilder {
    pub fn new(graph: Arc<GraphClient>, columnar: ColumnarClient) -> Self {
        Self { graph, columnar }
    }

    /// Assembles the snapshot. Sub-query failures zero their slot and set
    /// `error`; only that.
    pub async fn build(&self) -> StatusDocument {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut failures: Vec<&'static str> = Vec::new();

        let (
            columnar_ok,
            graph_ok,
            latest_ts,
            counts,
            inbound,
            stake,
            past_stake,
            health_rows,
            utilization,
            interfaces,
            alerts,
            performance,
            top_devices,
            no_data,
        ) = tokio::join!(
            self.columnar.ping(),
            self.ping_graph(),
            self.latest_telemetry(),
            self.counts(),
            self.user_inbound(),
            self.dz_stake(),
            self.dz_stake_24h(),
            self.link_health_rows(),
            self.link_utilization(),
            self.interface_issues(),
            self.alerts(),
            self.performance(),
            self.device_utilization(),
            self.no_data_links(),
        );

        let system = SystemHealth {
            columnar_ok,
            graph_ok,
            latest_telemetry_ts: unwrap_or_zero(latest_ts, "latest_telemetry", &mut failures),
        };

        let mut network = NetworkSummary::default();
        if let Some(row) = unwrap_or_log(counts, "status_counts", &mut failures) {
            network.users = row.users;
            network.devices = row.devices;
            network.links = row.links;
            network.contributors = row.contributors;
            network.metros = row.metros;
            network.activated_bandwidth_bps = row.activated_bandwidth_bps;
        }
        network.user_inbound_bps = unwrap_or_zero(inbound, "user_inbound", &mut failures);
        let mut current_share = 0.0;
        if let Some(row) = unwrap_or_log(stake, "dz_stake", &mut failures) {
            network.validators_on_dz = row.validators_on_dz;
            network.total_stake_sol = row.dz_stake as f64 / 1e9;
            if row.total_stake > 0 {
                current_share = row.dz_stake as f64 * 100.0 / row.total_stake as f64;
            }
            network.stake_share_pct = current_share;
        }
        if let Some(row) = unwrap_or_log(past_stake, "dz_stake_24h", &mut failures) {
            // delta only when the historical denominator exists
            if row.total_stake > 0 {
                let past_share = row.dz_stake as f64 * 100.0 / row.total_stake as f64;
                network.stake_share_delta_24h_pct = current_share - past_share;
            }
        }

        let mut links = LinkHealthSummary::default();
        let mut loss_flagged: Vec<String> = Vec::new();
        if let Some(rows) = unwrap_or_log(health_rows, "link_health", &mut failures) {
            links.total = rows.len();
            let mut loss_sum = 0.0;
            for row in &rows {
                let (state, overage) = classify_health_row(row);
                loss_sum += finite(row.loss_pct);
                match state {
                    HealthState::Healthy | HealthState::NoData => links.healthy += 1,
                    HealthState::Degraded => links.degraded += 1,
                    HealthState::Unhealthy => links.unhealthy += 1,
                    HealthState::Disabled => links.disabled += 1,
                }
                if state == HealthState::Disabled {
                    push_issue(
                        &mut links.issues,
                        row,
                        LinkIssueKind::Disabled,
                        "critical",
                        overage,
                    );
                } else {
                    if row.samples > 0 && finite(row.loss_pct) >= LOSS_ISSUE_PCT {
                        push_issue(
                            &mut links.issues,
                            row,
                            LinkIssueKind::PacketLoss,
                            if finite(row.loss_pct) >= 10.0 {
                                "critical"
                            } else {
                                "warning"
                            },
                            overage,
                        );
                        loss_flagged.push(row.pk.clone());
                    }
                    if overage >= LATENCY_ISSUE_PCT {
                        push_issue(
                            &mut links.issues,
                            row,
                            LinkIssueKind::HighLatency,
                            if overage >= 50.0 { "critical" } else { "warning" },
                            overage,
                        );
                    }
                }
            }
            if links.total > 0 {
                links.avg_loss_pct = loss_sum / links.total as f64;
            }
        }

        // issue start enrichment is additive; failures only drop `since`
        if !loss_flagged.is_empty() {
            match self.issue_starts(loss_flagged, now).await {
                Ok(starts) => {
                    links.issues.retain_mut(|issue| {
                        if issue.kind != LinkIssueKind::PacketLoss {
                            return true;
                        }
                        match starts.get(&issue.link_pk) {
                            Some(Some(start)) => {
                                issue.since = Some(*start);
                                true
                            }
                            // current hour healthy: suppressed
                            Some(None) => false,
                            None => true,
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "issue start enrichment failed");
                    failures.push("issue_starts");
                }
            }
        }

        if let Some(rows) = unwrap_or_log(no_data, "no_data_links", &mut failures) {
            for row in rows {
                links.issues.push(LinkIssue {
                    link_pk: row.pk,
                    link_code: row.code,
                    kind: LinkIssueKind::NoData,
                    severity: "warning",
                    loss_pct: 0.0,
                    latency_overage_pct: 0.0,
                    since: Some(row.last_seen + NO_DATA_GRACE_SECS),
                });
            }
        }

        if let Some(rows) = unwrap_or_log(utilization, "link_utilization", &mut failures) {
            for row in rows {
                let utilization_pct = if row.bandwidth_bps > 0 {
                    finite(row.bps as f64 * 100.0 / row.bandwidth_bps as f64)
                } else {
                    0.0
                };
                let entry = LinkUtilization {
                    link_pk: row.pk,
                    link_code: row.code,
                    bandwidth_bps: row.bandwidth_bps,
                    bps: row.bps,
                    utilization_pct,
                };
                if utilization_pct >= HIGH_UTILIZATION_PCT
                    && links.high_utilization.len() < ISSUE_LIMIT
                {
                    links.high_utilization.push(entry.clone());
                }
                links.top_utilization.push(entry);
            }
        }

        let interfaces = unwrap_or_log(interfaces, "interface_issues", &mut failures)
            .unwrap_or_default()
            .into_iter()
            .map(|row| InterfaceIssue {
                device_pk: row.device_pk,
                device_code: row.device_code,
                interface: row.intf,
                errors: row.errors,
                discards: row.discards,
                carrier_transitions: row.carrier_transitions,
            })
            .collect();

        let alerts = unwrap_or_log(alerts, "alerts", &mut failures).unwrap_or_default();

        let performance = unwrap_or_log(performance, "performance", &mut failures)
            .map(|row| PerformanceSummary {
                avg_rtt_ms: finite(row.avg_rtt_ms),
                avg_jitter_ms: finite(row.avg_jitter_ms),
                avg_loss_pct: finite(row.avg_loss_pct),
            })
            .unwrap_or_default();

        let top_devices = unwrap_or_log(top_devices, "device_utilization", &mut failures)
            .unwrap_or_default()
            .into_iter()
            .map(|row| DeviceUtilization {
                utilization_pct: if row.max_users > 0 {
                    finite(row.current_users as f64 * 100.0 / row.max_users as f64)
                } else {
                    0.0
                },
                device_pk: row.pk,
                device_code: row.code,
                current_users: row.current_users,
                max_users: row.max_users,
            })
            .collect();

        let overall = overall_status(
            columnar_ok,
            links.total,
            links.degraded,
            links.unhealthy,
            links.avg_loss_pct,
        );

        StatusDocument {
            generated_at: now,
            overall,
            system,
            network,
            links,
            interfaces,
            alerts,
            performance,
            top_devices,
            error: if failures.is_empty() {
                None
            } else {
                Some(format!("degraded status: {}", failures.join(", ")))
            },
        }
    }

    async fn ping_graph(&self) -> bool {
        self.graph.ping().await
    }

    async fn latest_telemetry(&self) -> Result<i64> {
        let row = self
            .columnar
            .fetch_one::<ScalarI64Row>(
                "status_latest_telemetry",
                self.columnar.query(LATEST_TELEMETRY_SQL),
            )
            .await?;
        Ok(row.value)
    }

    async fn counts(&self) -> Result<CountsRow> {
        self.columnar
            .fetch_one("status_counts", self.columnar.query(COUNTS_SQL))
            .await
    }

    async fn user_inbound(&self) -> Result<i64> {
        let row = self
            .columnar
            .fetch_one::<ScalarI64Row>(
                "status_user_inbound",
                self.columnar.query(USER_INBOUND_SQL),
            )
            .await?;
        Ok(row.value)
    }

    async fn dz_stake(&self) -> Result<DzStakeRow> {
        self.columnar
            .fetch_one("status_dz_stake", self.columnar.query(DZ_STAKE_SQL))
            .await
    }

    async fn dz_stake_24h(&self) -> Result<PastStakeRow> {
        self.columnar
            .fetch_one("status_dz_stake_24h", self.columnar.query(DZ_STAKE_24H_SQL))
            .await
    }

    async fn link_health_rows(&self) -> Result<Vec<LinkHealthRow>> {
        self.columnar
            .fetch_all("status_link_health", self.columnar.query(LINK_HEALTH_SQL))
            .await
    }

    async fn link_utilization(&self) -> Result<Vec<UtilizationRow>> {
        self.columnar
            .fetch_all(
                "status_link_utilization",
                self.columnar
                    .query(LINK_UTILIZATION_SQL)
                    .bind(UTILIZATION_LIMIT as u64),
            )
            .await
    }

    async fn interface_issues(&self) -> Result<Vec<InterfaceIssueRow>> {
        self.columnar
            .fetch_all(
                "status_interfaces",
                self.columnar
                    .query(INTERFACE_ISSUES_SQL)
                    .bind(INTERFACE_LIMIT as u64),
            )
            .await
    }

    async fn alerts(&self) -> Result<Vec<AlertEntry>> {
        let devices = self
            .columnar
            .fetch_all::<AlertRow>(
                "status_device_alerts",
                self.columnar
                    .query(DEVICE_ALERTS_SQL)
                    .bind(ALERT_LIMIT as u64),
            )
            .await?;
        let links = self
            .columnar
            .fetch_all::<AlertRow>(
                "status_link_alerts",
                self.columnar
                    .query(LINK_ALERTS_SQL)
                    .bind(SOFT_DRAIN_DELAY_OVERRIDE_NS)
                    .bind(SOFT_DRAIN_DELAY_OVERRIDE_NS)
                    .bind(ALERT_LIMIT as u64),
            )
            .await?;
        let mut alerts: Vec<AlertEntry> = devices
            .into_iter()
            .map(|row| AlertEntry {
                entity: "device",
                pk: row.pk,
                code: row.code,
                status: row.status,
            })
            .chain(links.into_iter().map(|row| AlertEntry {
                entity: "link",
                pk: row.pk,
                code: row.code,
                status: row.status,
            }))
            .collect();
        alerts.truncate(ALERT_LIMIT);
        Ok(alerts)
    }

    async fn performance(&self) -> Result<PerformanceRow> {
        self.columnar
            .fetch_one("status_performance", self.columnar.query(PERFORMANCE_SQL))
            .await
    }

    async fn device_utilization(&self) -> Result<Vec<DeviceUtilizationRow>> {
        self.columnar
            .fetch_all(
                "status_device_utilization",
                self.columnar
                    .query(DEVICE_UTILIZATION_SQL)
                    .bind(UTILIZATION_LIMIT as u64),
            )
            .await
    }

    async fn no_data_links(&self) -> Result<Vec<NoDataRow>> {
        self.columnar
            .fetch_all(
                "status_no_data",
                self.columnar
                    .query(NO_DATA_SQL)
                    .bind(SOFT_DRAIN_DELAY_OVERRIDE_NS)
                    .bind(ISSUE_LIMIT as u64),
            )
            .await
    }

    /// Per-link issue start over 7 days of hourly loss. `Some(None)` means
    /// the issue should be suppressed.
    async fn issue_starts(
        &self,
        link_pks: Vec<String>,
        now: i64,
    ) -> Result<std::collections::HashMap<String, Option<i64>>> {
        let rows = self
            .columnar
            .fetch_all::<HourlyLossRow>(
                "status_issue_starts",
                self.columnar.query(HOURLY_LOSS_SQL).bind(&link_pks),
            )
            .await?;
        let mut by_link: std::collections::HashMap<String, Vec<(i64, f64)>> =
            std::collections::HashMap::new();
        for row in rows {
            by_link
                .entry(row.link_pk)
                .or_default()
                .push((row.hour_ts, finite(row.loss_pct)));
        }
        Ok(link_pks
            .into_iter()
            .map(|pk| {
                let start = by_link
                    .get(&pk)
                    .map(|hours| derive_issue_start(hours, now))
                    .unwrap_or(None);
                (pk, start)
            })
            .collect())
    }
}

fn push_issue(
    issues: &mut Vec<LinkIssue>,
    row: &LinkHealthRow,
    kind: LinkIssueKind,
    severity: &'static str,
    overage: f64,
) {
    if issues.iter().filter(|i| i.kind == kind).count() >= ISSUE_LIMIT {
        return;
    }
    issues.push(LinkIssue {
        link_pk: row.pk.clone(),
        link_code: row.code.clone(),
        kind,
        severity,
        loss_pct: finite(row.loss_pct),
        latency_overage_pct: overage,
        since: None,
    });
}

fn unwrap_or_log<T>(
    result: Result<T>,
    name: &'static str,
    failures: &mut Vec<&'static str>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(query = name, %err, "status sub-query failed");
            failures.push(name);
            None
        }
    }
}

fn unwrap_or_zero(result: Result<i64>, name: &'static str, failures: &mut Vec<&'static str>) -> i64 {
    unwrap_or_log(result, name, failures).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_start_is_hour_after_last_healthy() {
        let hours = vec![
            (1_000_000, 0.0),
            (1_003_600, 0.2),
            (1_007_200, 5.0),
            (1_010_800, 8.0),
        ];
        assert_eq!(derive_issue_start(&hours, 1_020_000), Some(1_007_200));
    }

    #[test]
    fn issue_start_falls_back_to_first_issue_hour() {
        let hours = vec![(1_000_000, 3.0), (1_003_600, 4.0)];
        assert_eq!(derive_issue_start(&hours, 1_020_000), Some(1_000_000));
    }

    #[test]
    fn issue_suppressed_when_current_hour_healthy() {
        // last healthy hour is the newest sample: start lands in the future
        let hours = vec![(1_000_000, 5.0), (1_003_600, 0.0)];
        assert_eq!(derive_issue_start(&hours, 1_004_000), None);
    }

    #[test]
    fn no_hours_no_issue_start() {
        assert_eq!(derive_issue_start(&[], 1_000), None);
    }

    #[test]
    fn overall_status_rules() {
        use HealthState::*;
        assert_eq!(overall_status(false, 100, 0, 0, 0.0), Unhealthy);
        assert_eq!(overall_status(true, 100, 0, 11, 0.0), Unhealthy);
        assert_eq!(overall_status(true, 100, 0, 0, 10.0), Unhealthy);
        assert_eq!(overall_status(true, 100, 21, 0, 0.0), Degraded);
        assert_eq!(overall_status(true, 100, 0, 1, 0.0), Degraded);
        assert_eq!(overall_status(true, 100, 0, 0, 1.0), Degraded);
        assert_eq!(overall_status(true, 100, 5, 0, 0.1), Healthy);
        assert_eq!(overall_status(true, 0, 0, 0, 0.0), Healthy);
    }

    fn health_row(link_type: &str, committed_ns: i64, rtt_us: f64, loss: f64) -> LinkHealthRow {
        LinkHealthRow {
            pk: "lnk".into(),
            code: "LNK".into(),
            link_type: link_type.into(),
            committed_rtt_ns: committed_ns,
            metro_a: "m1".into(),
            metro_z: "m2".into(),
            avg_rtt_us: rtt_us,
            loss_pct: loss,
            samples: 60,
        }
    }

    #[test]
    fn classification_requires_wan_inter_metro_committed_rtt() {
        // 1500us vs 1000us committed: 50% overage when eligible
        let (state, overage) = classify_health_row(&health_row("wan", 1_000_000, 1_500.0, 0.0));
        assert_eq!(state, HealthState::Unhealthy);
        assert!((overage - 50.0).abs() < 1e-9);

        // same numbers on a lan link: overage zeroed
        let (state, overage) = classify_health_row(&health_row("lan", 1_000_000, 1_500.0, 0.0));
        assert_eq!(state, HealthState::Healthy);
        assert_eq!(overage, 0.0);

        let mut intra = health_row("wan", 1_000_000, 1_500.0, 0.0);
        intra.metro_z = intra.metro_a.clone();
        let (state, _) = classify_health_row(&intra);
        assert_eq!(state, HealthState::Healthy);
    }

    #[test]
    fn health_counts_sum_to_total() {
        let rows = vec![
            health_row("wan", 1_000_000, 900.0, 0.0),
            health_row("wan", 1_000_000, 900.0, 2.0),
            health_row("wan", 1_000_000, 900.0, 50.0),
            health_row("wan", 1_000_000, 900.0, 96.0),
        ];
        let mut counts = [0usize; 4];
        for row in &rows {
            match classify_health_row(row).0 {
                HealthState::Healthy | HealthState::NoData => counts[0] += 1,
                HealthState::Degraded => counts[1] += 1,
                HealthState::Unhealthy => counts[2] += 1,
                HealthState::Disabled => counts[3] += 1,
            }
        }
        assert_eq!(counts.iter().sum::<usize>(), rows.len());
        assert_eq!(counts, [1, 1, 1, 1]);
    }
}
