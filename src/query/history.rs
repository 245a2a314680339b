//! Per-entity history bucketization: link, device and device-interface
//! timelines with per-side aggregation, historical status overlay and
//! post-hoc extended-loss run detection.

use clickhouse::Row;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::columnar::{finite, ColumnarClient};
use crate::error::{FabricError, Result};
use crate::model::{
    classify_sla, is_drained_status, latency_overage_pct, HealthState,
    SOFT_DRAIN_DELAY_OVERRIDE_NS,
};

pub const MIN_BUCKETS: usize = 12;
pub const MAX_BUCKETS: usize = 168;
pub const DEFAULT_BUCKETS: usize = 72;

/// A contiguous run of at least this many minutes at total loss relabels to
/// disabled.
const EXTENDED_LOSS_RUN_MINUTES: i64 = 120;
const EXTENDED_LOSS_PCT: f64 = 99.9;

const LOSS_REASON_PCT: f64 = 1.0;
const LATENCY_REASON_PCT: f64 = 20.0;

/// Device-counter classification bounds.
const DEVICE_UNHEALTHY_COUNT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRange {
    H1,
    H3,
    H6,
    H12,
    H24,
    D3,
    D7,
}

impl HistoryRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Self::H1),
            "3h" => Some(Self::H3),
            "6h" => Some(Self::H6),
            "12h" => Some(Self::H12),
            "24h" | "" => Some(Self::H24),
            "3d" => Some(Self::D3),
            "7d" => Some(Self::D7),
            _ => None,
        }
    }

    pub fn hours(&self) -> i64 {
        match self {
            Self::H1 => 1,
            Self::H3 => 3,
            Self::H6 => 6,
            Self::H12 => 12,
            Self::H24 => 24,
            Self::D3 => 72,
            Self::D7 => 168,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H3 => "3h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::H24 => "24h",
            Self::D3 => "3d",
            Self::D7 => "7d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketSpec {
    pub range: HistoryRange,
    pub bucket_minutes: i64,
    pub bucket_count: usize,
}

impl BucketSpec {
    pub fn new(range: HistoryRange, requested_buckets: usize) -> Self {
        let requested = requested_buckets.clamp(MIN_BUCKETS, MAX_BUCKETS) as i64;
        let total_minutes = range.hours() * 60;
        let bucket_minutes = (total_minutes / requested).max(5);
        let bucket_count = (total_minutes / bucket_minutes) as usize;
        Self {
            range,
            bucket_minutes,
            bucket_count,
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_minutes * 60
    }

    /// Bucket timestamps oldest first; index `bucket_count - 1 - i`
    /// corresponds to `now - i * bucket_duration`.
    pub fn bucket_timestamps(&self, now: i64) -> Vec<i64> {
        let aligned = now - now.rem_euclid(self.bucket_secs());
        (0..self.bucket_count)
            .map(|j| aligned - (self.bucket_count - 1 - j) as i64 * self.bucket_secs())
            .collect()
    }

    pub fn window_start(&self, now: i64) -> i64 {
        let aligned = now - now.rem_euclid(self.bucket_secs());
        aligned - (self.bucket_count as i64 - 1) * self.bucket_secs()
    }

    /// Oldest-first index for a bucket-aligned timestamp, if in window.
    pub fn index_of(&self, now: i64, bucket_ts: i64) -> Option<usize> {
        let start = self.window_start(now);
        if bucket_ts < start {
            return None;
        }
        let idx = ((bucket_ts - start) / self.bucket_secs()) as usize;
        if idx < self.bucket_count {
            Some(idx)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueReason {
    CarrierTransitions,
    Discards,
    Drained,
    ExtendedLoss,
    HighLatency,
    InterfaceErrors,
    NoData,
    PacketLoss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketStats {
    pub avg_rtt_us: f64,
    pub loss_pct: f64,
    pub samples: i64,
}

impl BucketStats {
    /// Sample-weighted fold of the two directions.
    pub fn fold(a: Option<BucketStats>, z: Option<BucketStats>) -> Option<BucketStats> {
        match (a, z) {
            (None, None) => None,
            (Some(s), None) | (None, Some(s)) => Some(s),
            (Some(a), Some(z)) => {
                let samples = a.samples + z.samples;
                if samples == 0 {
                    return Some(BucketStats::default());
                }
                let weight = |s: &BucketStats| s.samples as f64;
                Some(BucketStats {
                    avg_rtt_us: (a.avg_rtt_us * weight(&a) + z.avg_rtt_us * weight(&z))
                        / samples as f64,
                    loss_pct: (a.loss_pct * weight(&a) + z.loss_pct * weight(&z))
                        / samples as f64,
                    samples,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterTotals {
    pub errors: i64,
    pub discards: i64,
    pub carrier_transitions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryBucket {
    pub timestamp: i64,
    pub state: HealthState,
    pub avg_rtt_ms: f64,
    pub loss_pct: f64,
    pub samples: i64,
    pub errors: i64,
    pub discards: i64,
    pub carrier_transitions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkHistory {
    pub link_pk: String,
    pub link_code: String,
    pub status: String,
    pub side_a_pk: String,
    pub side_a_code: String,
    pub side_z_pk: String,
    pub side_z_code: String,
    pub buckets: Vec<HistoryBucket>,
    pub issue_reasons: Vec<IssueReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceHistory {
    pub device_pk: String,
    pub device_code: String,
    pub status: String,
    pub buckets: Vec<HistoryBucket>,
    pub issue_reasons: Vec<IssueReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceHistory {
    pub device_pk: String,
    pub device_code: String,
    pub interface: String,
    pub link_pk: String,
    pub link_code: String,
    pub buckets: Vec<HistoryBucket>,
    pub issue_reasons: Vec<IssueReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse<T> {
    pub range: HistoryRange,
    pub bucket_minutes: i64,
    pub bucket_count: usize,
    pub generated_at: i64,
    pub entries: Vec<T>,
}

// ---------------------------------------------------------------------------
// Pure bucket assembly
// ---------------------------------------------------------------------------

/// Per-link inputs indexed oldest-first, each of length `bucket_count`.
#[derive(Debug, Clone)]
pub struct LinkBucketInputs {
    pub stats: Vec<Option<BucketStats>>,
    pub counters: Vec<CounterTotals>,
    pub drained: Vec<bool>,
    /// Committed RTT in microseconds; zero when the link carries no SLA.
    pub committed_rtt_us: f64,
    /// Latency-overage eligibility (inter-metro WAN with committed RTT).
    pub sla_eligible: bool,
}

pub fn build_link_buckets(
    spec: &BucketSpec,
    now: i64,
    inputs: &LinkBucketInputs,
) -> (Vec<HistoryBucket>, Vec<IssueReason>) {
    let timestamps = spec.bucket_timestamps(now);
    let mut reasons: Vec<IssueReason> = Vec::new();
    let mut buckets: Vec<HistoryBucket> = Vec::with_capacity(spec.bucket_count);
    let last_index = spec.bucket_count.saturating_sub(1);

    for (idx, &timestamp) in timestamps.iter().enumerate() {
        let stats = inputs.stats.get(idx).copied().flatten();
        let counters = inputs.counters.get(idx).copied().unwrap_or_default();
        let drained = inputs.drained.get(idx).copied().unwrap_or(false);

        let (state, stats) = if drained {
            reasons.push(IssueReason::Drained);
            (HealthState::Disabled, stats.unwrap_or_default())
        } else {
            match stats {
                None => {
                    // telemetry for the newest bucket may still be arriving
                    if idx != last_index {
                        reasons.push(IssueReason::NoData);
                    }
                    (HealthState::NoData, BucketStats::default())
                }
                Some(stats) => {
                    let overage = latency_overage_pct(
                        finite(stats.avg_rtt_us),
                        inputs.committed_rtt_us,
                        inputs.sla_eligible,
                    );
                    let mut state = classify_sla(finite(stats.loss_pct), overage);
                    if finite(stats.loss_pct) >= LOSS_REASON_PCT {
                        reasons.push(IssueReason::PacketLoss);
                    }
                    if overage >= LATENCY_REASON_PCT {
                        reasons.push(IssueReason::HighLatency);
                    }
                    if state == HealthState::Healthy {
                        if counters.carrier_transitions > 0 {
                            state = HealthState::Unhealthy;
                            reasons.push(IssueReason::CarrierTransitions);
                        } else if counters.errors > 0 || counters.discards > 0 {
                            state = HealthState::Degraded;
                            if counters.errors > 0 {
                                reasons.push(IssueReason::InterfaceErrors);
                            }
                            if counters.discards > 0 {
                                reasons.push(IssueReason::Discards);
                            }
                        }
                    }
                    (state, stats)
                }
            }
        };

        buckets.push(HistoryBucket {
            timestamp,
            state,
            avg_rtt_ms: finite(stats.avg_rtt_us) / 1_000.0,
            loss_pct: finite(stats.loss_pct),
            samples: stats.samples,
            errors: counters.errors,
            discards: counters.discards,
            carrier_transitions: counters.carrier_transitions,
        });
    }

    apply_extended_loss_runs(spec, &mut buckets, &mut reasons);

    reasons.sort();
    reasons.dedup();
    (buckets, reasons)
}

/// Relabels contiguous runs of total loss spanning at least two hours as
/// disabled. When every lossy bucket was swallowed, packet loss disappears
/// from the reasons in favor of extended loss.
fn apply_extended_loss_runs(
    spec: &BucketSpec,
    buckets: &mut [HistoryBucket],
    reasons: &mut Vec<IssueReason>,
) {
    let min_run = ((EXTENDED_LOSS_RUN_MINUTES + spec.bucket_minutes - 1) / spec.bucket_minutes)
        .max(1) as usize;
    let mut relabeled = false;
    let mut run_start: Option<usize> = None;
    for idx in 0..=buckets.len() {
        let in_run = idx < buckets.len()
            && buckets[idx].loss_pct >= EXTENDED_LOSS_PCT
            && buckets[idx].state != HealthState::Disabled;
        match (run_start, in_run) {
            (None, true) => run_start = Some(idx),
            (Some(start), false) => {
                if idx - start >= min_run {
                    for bucket in &mut buckets[start..idx] {
                        bucket.state = HealthState::Disabled;
                    }
                    relabeled = true;
                }
                run_start = None;
            }
            _ => {}
        }
    }
    if !relabeled {
        return;
    }
    reasons.push(IssueReason::ExtendedLoss);
    let loss_outside_disabled = buckets.iter().any(|b| {
        b.state != HealthState::Disabled && b.loss_pct >= LOSS_REASON_PCT
    });
    if !loss_outside_disabled {
        reasons.retain(|r| *r != IssueReason::PacketLoss);
    }
}

/// Counter-only classification used for devices and interfaces.
pub fn classify_counters(totals: CounterTotals) -> HealthState {
    let worst = totals
        .errors
        .max(totals.discards)
        .max(totals.carrier_transitions);
    if worst >= DEVICE_UNHEALTHY_COUNT {
        HealthState::Unhealthy
    } else if worst > 0 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

pub fn build_counter_buckets(
    spec: &BucketSpec,
    now: i64,
    counters: &[CounterTotals],
    disabled: &[bool],
) -> (Vec<HistoryBucket>, Vec<IssueReason>) {
    let timestamps = spec.bucket_timestamps(now);
    let mut reasons = Vec::new();
    let mut buckets = Vec::with_capacity(spec.bucket_count);
    for (idx, &timestamp) in timestamps.iter().enumerate() {
        let totals = counters.get(idx).copied().unwrap_or_default();
        let state = if disabled.get(idx).copied().unwrap_or(false) {
            reasons.push(IssueReason::Drained);
            HealthState::Disabled
        } else {
            let state = classify_counters(totals);
            if state != HealthState::Healthy {
                if totals.errors > 0 {
                    reasons.push(IssueReason::InterfaceErrors);
                }
                if totals.discards > 0 {
                    reasons.push(IssueReason::Discards);
                }
                if totals.carrier_transitions > 0 {
                    reasons.push(IssueReason::CarrierTransitions);
                }
            }
            state
        };
        buckets.push(HistoryBucket {
            timestamp,
            state,
            avg_rtt_ms: 0.0,
            loss_pct: 0.0,
            samples: 0,
            errors: totals.errors,
            discards: totals.discards,
            carrier_transitions: totals.carrier_transitions,
        });
    }
    reasons.sort();
    reasons.dedup();
    (buckets, reasons)
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

const LINK_META_SQL: &str = "\
    SELECT \
        l.pk AS pk, l.code AS code, l.status AS status, l.link_type AS link_type, \
        l.committed_rtt_ns AS committed_rtt_ns, \
        l.side_a_pk AS side_a_pk, l.side_z_pk AS side_z_pk, \
        da.code AS side_a_code, dz.code AS side_z_code, \
        da.metro_pk AS metro_a, dz.metro_pk AS metro_z \
    FROM dz_links_current AS l \
    LEFT JOIN dz_devices_current AS da ON da.pk = l.side_a_pk \
    LEFT JOIN dz_devices_current AS dz ON dz.pk = l.side_z_pk \
    WHERE l.status IN ('activated', 'soft-drained', 'hard-drained') \
    ORDER BY code";

const LINK_LATENCY_SQL: &str = "\
    SELECT \
        f.link_pk AS link_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(f.event_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        if(f.origin_device_pk = l.side_a_pk, 'A', 'Z') AS direction, \
        ifNotFinite(avg(f.rtt_us), 0) AS avg_rtt_us, \
        ifNotFinite(countIf(f.loss) * 100 / count(), 0) AS loss_pct, \
        toInt64(count()) AS samples \
    FROM fact_dz_device_link_latency AS f \
    INNER JOIN dz_links_current AS l ON l.pk = f.link_pk \
    WHERE f.event_ts >= toDateTime(?) \
    GROUP BY link_pk, bucket_ts, direction";

const LINK_COUNTERS_SQL: &str = "\
    SELECT \
        link_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(event_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        toInt64(sum(greatest(in_errors_delta, 0) + greatest(out_errors_delta, 0))) AS errors, \
        toInt64(sum(greatest(in_discards_delta, 0) + greatest(out_discards_delta, 0))) AS discards, \
        toInt64(sum(greatest(carrier_transitions_delta, 0))) AS carrier_transitions \
    FROM fact_dz_device_interface_counters \
    WHERE event_ts >= toDateTime(?) AND link_pk != '' \
    GROUP BY link_pk, bucket_ts";

const LINK_STATUS_OVERLAY_SQL: &str = "\
    SELECT \
        entity_id AS link_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(snapshot_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        argMax(status, snapshot_ts) AS status, \
        argMax(isis_delay_override_ns, snapshot_ts) AS delay_override \
    FROM dim_links_history \
    WHERE snapshot_ts >= toDateTime(?) \
    GROUP BY link_pk, bucket_ts";

const LINK_STATUS_BASELINE_SQL: &str = "\
    SELECT \
        entity_id AS link_pk, \
        argMax(status, snapshot_ts) AS status, \
        argMax(isis_delay_override_ns, snapshot_ts) AS delay_override \
    FROM dim_links_history \
    WHERE snapshot_ts < toDateTime(?) \
    GROUP BY link_pk";

const DEVICE_META_SQL: &str = "\
    SELECT pk, code, status FROM dz_devices_current \
    WHERE status = 'activated' \
    ORDER BY code";

const DEVICE_COUNTERS_SQL: &str = "\
    SELECT \
        device_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(event_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        toInt64(sum(greatest(in_errors_delta, 0) + greatest(out_errors_delta, 0))) AS errors, \
        toInt64(sum(greatest(in_discards_delta, 0) + greatest(out_discards_delta, 0))) AS discards, \
        toInt64(sum(greatest(carrier_transitions_delta, 0))) AS carrier_transitions \
    FROM fact_dz_device_interface_counters \
    WHERE event_ts >= toDateTime(?) \
    GROUP BY device_pk, bucket_ts";

const DEVICE_STATUS_OVERLAY_SQL: &str = "\
    SELECT \
        entity_id AS device_pk, \
        toInt64(toUnixTimestamp(toStartOfInterval(snapshot_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        argMax(status, snapshot_ts) AS status \
    FROM dim_devices_history \
    WHERE snapshot_ts >= toDateTime(?) \
    GROUP BY device_pk, bucket_ts";

const INTERFACE_META_SQL: &str = "\
    SELECT pk, code, status FROM dz_devices_current WHERE pk = ?";

const INTERFACE_COUNTERS_SQL: &str = "\
    SELECT \
        c.intf AS intf, \
        c.link_pk AS link_pk, \
        l.code AS link_code, \
        toInt64(toUnixTimestamp(toStartOfInterval(c.event_ts, INTERVAL ? MINUTE))) AS bucket_ts, \
        toInt64(sum(greatest(c.in_errors_delta, 0) + greatest(c.out_errors_delta, 0))) AS errors, \
        toInt64(sum(greatest(c.in_discards_delta, 0) + greatest(c.out_discards_delta, 0))) AS discards, \
        toInt64(sum(greatest(c.carrier_transitions_delta, 0))) AS carrier_transitions \
    FROM fact_dz_device_interface_counters AS c \
    LEFT JOIN dz_links_current AS l ON l.pk = c.link_pk \
    WHERE c.device_pk = ? AND c.event_ts >= toDateTime(?) \
    GROUP BY intf, link_pk, link_code, bucket_ts";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Row, Deserialize)]
struct LinkMetaRow {
    pk: String,
    code: String,
    status: String,
    link_type: String,
    committed_rtt_ns: i64,
    side_a_pk: String,
    side_z_pk: String,
    side_a_code: String,
    side_z_code: String,
    metro_a: String,
    metro_z: String,
}

#[derive(Debug, Row, Deserialize)]
struct LatencyBucketRow {
    link_pk: String,
    bucket_ts: i64,
    direction: String,
    avg_rtt_us: f64,
    loss_pct: f64,
    samples: i64,
}

#[derive(Debug, Row, Deserialize)]
struct CounterBucketRow {
    entity_pk: String,
    bucket_ts: i64,
    errors: i64,
    discards: i64,
    carrier_transitions: i64,
}

#[derive(Debug, Row, Deserialize)]
struct StatusOverlayRow {
    entity_pk: String,
    bucket_ts: i64,
    status: String,
    delay_override: i64,
}

#[derive(Debug, Row, Deserialize)]
struct DeviceStatusOverlayRow {
    entity_pk: String,
    bucket_ts: i64,
    status: String,
}

#[derive(Debug, Row, Deserialize)]
struct StatusBaselineRow {
    entity_pk: String,
    status: String,
    delay_override: i64,
}

#[derive(Debug, Row, Deserialize)]
struct DeviceMetaRow {
    pk: String,
    code: String,
    status: String,
}

#[derive(Debug, Row, Deserialize)]
struct InterfaceCounterRow {
    intf: String,
    link_pk: String,
    link_code: String,
    bucket_ts: i64,
    errors: i64,
    discards: i64,
    carrier_transitions: i64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct HistoryEngine {
    columnar: ColumnarClient,
}

impl HistoryEngine {
    pub fn new(columnar: ColumnarClient) -> Self {
        Self { columnar }
    }

    pub async fn link_history(&self, spec: BucketSpec) -> Result<HistoryResponse<LinkHistory>> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let start = spec.window_start(now);

        // first-stage listing failure fails the composite
        let meta = self
            .columnar
            .fetch_all::<LinkMetaRow>("history_link_meta", self.columnar.query(LINK_META_SQL))
            .await?;

        let latency = self
            .columnar
            .fetch_all::<LatencyBucketRow>(
                "history_link_latency",
                self.columnar
                    .query(LINK_LATENCY_SQL)
                    .bind(spec.bucket_minutes)
                    .bind(start),
            )
            .await?;

        // counter and drain overlays degrade to empty on failure
        let counters = self
            .fetch_counters(LINK_COUNTERS_SQL, "history_link_counters", spec, start, now)
            .await;
        let overlay = self.link_drain_overlay(spec, start, now).await;

        // fold per-direction rows into per-bucket aggregates
        let mut per_link_stats: FxHashMap<String, Vec<Option<BucketStats>>> = FxHashMap::default();
        let mut sides: FxHashMap<(String, usize), (Option<BucketStats>, Option<BucketStats>)> =
            FxHashMap::default();
        for row in latency {
            let Some(idx) = spec.index_of(now, row.bucket_ts) else {
                continue;
            };
            let slot = sides.entry((row.link_pk.clone(), idx)).or_default();
            let stats = BucketStats {
                avg_rtt_us: finite(row.avg_rtt_us),
                loss_pct: finite(row.loss_pct),
                samples: row.samples,
            };
            if row.direction == "A" {
                slot.0 = Some(stats);
            } else {
                slot.1 = Some(stats);
            }
        }
        for ((link_pk, idx), (a, z)) in sides {
            let entry = per_link_stats
                .entry(link_pk)
                .or_insert_with(|| vec![None; spec.bucket_count]);
            entry[idx] = BucketStats::fold(a, z);
        }

        let mut entries = Vec::with_capacity(meta.len());
        for link in meta {
            let stats = per_link_stats
                .remove(&link.pk)
                .unwrap_or_else(|| vec![None; spec.bucket_count]);
            let link_counters = counters
                .get(&link.pk)
                .cloned()
                .unwrap_or_else(|| vec![CounterTotals::default(); spec.bucket_count]);
            let drained = overlay
                .get(&link.pk)
                .cloned()
                .unwrap_or_else(|| vec![false; spec.bucket_count]);
            let sla_eligible = link.link_type == "wan"
                && !link.metro_a.is_empty()
                && !link.metro_z.is_empty()
                && link.metro_a != link.metro_z
                && link.committed_rtt_ns > 0;
            let inputs = LinkBucketInputs {
                stats,
                counters: link_counters,
                drained,
                committed_rtt_us: link.committed_rtt_ns as f64 / 1_000.0,
                sla_eligible,
            };
            let (buckets, issue_reasons) = build_link_buckets(&spec, now, &inputs);
            entries.push(LinkHistory {
                link_pk: link.pk,
                link_code: link.code,
                status: link.status,
                side_a_pk: link.side_a_pk,
                side_a_code: link.side_a_code,
                side_z_pk: link.side_z_pk,
                side_z_code: link.side_z_code,
                buckets,
                issue_reasons,
            });
        }

        Ok(HistoryResponse {
            range: spec.range,
            bucket_minutes: spec.bucket_minutes,
            bucket_count: spec.bucket_count,
            generated_at: now,
            entries,
        })
    }

    pub async fn device_history(&self, spec: BucketSpec) -> Result<HistoryResponse<DeviceHistory>> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let start = spec.window_start(now);

        let meta = self
            .columnar
            .fetch_all::<DeviceMetaRow>("history_device_meta", self.columnar.query(DEVICE_META_SQL))
            .await?;

        let counters = self
            .fetch_counters(DEVICE_COUNTERS_SQL, "history_device_counters", spec, start, now)
            .await;
        let overlay = self.device_status_overlay(spec, start, now).await;

        let mut entries = Vec::with_capacity(meta.len());
        for device in meta {
            let device_counters = counters
                .get(&device.pk)
                .cloned()
                .unwrap_or_else(|| vec![CounterTotals::default(); spec.bucket_count]);
            let disabled = overlay
                .get(&device.pk)
                .cloned()
                .unwrap_or_else(|| vec![false; spec.bucket_count]);
            let (buckets, issue_reasons) =
                build_counter_buckets(&spec, now, &device_counters, &disabled);
            entries.push(DeviceHistory {
                device_pk: device.pk,
                device_code: device.code,
                status: device.status,
                buckets,
                issue_reasons,
            });
        }

        Ok(HistoryResponse {
            range: spec.range,
            bucket_minutes: spec.bucket_minutes,
            bucket_count: spec.bucket_count,
            generated_at: now,
            entries,
        })
    }

    pub async fn device_interface_history(
        &self,
        device_pk: &str,
        spec: BucketSpec,
    ) -> Result<HistoryResponse<InterfaceHistory>> {
        if device_pk.is_empty() {
            return Err(FabricError::InvalidArgument("device pk is required".into()));
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let start = spec.window_start(now);

        let device = self
            .columnar
            .fetch_optional::<DeviceMetaRow>(
                "history_interface_device",
                self.columnar.query(INTERFACE_META_SQL).bind(device_pk),
            )
            .await?
            .ok_or(FabricError::NotFound("device"))?;

        let rows = self
            .columnar
            .fetch_all::<InterfaceCounterRow>(
                "history_interface_counters",
                self.columnar
                    .query(INTERFACE_COUNTERS_SQL)
                    .bind(spec.bucket_minutes)
                    .bind(device_pk)
                    .bind(start),
            )
            .await?;

        let mut per_interface: FxHashMap<String, (String, String, Vec<CounterTotals>)> =
            FxHashMap::default();
        for row in rows {
            let Some(idx) = spec.index_of(now, row.bucket_ts) else {
                continue;
            };
            let entry = per_interface.entry(row.intf.clone()).or_insert_with(|| {
                (
                    row.link_pk.clone(),
                    row.link_code.clone(),
                    vec![CounterTotals::default(); spec.bucket_count],
                )
            });
            entry.2[idx] = CounterTotals {
                errors: row.errors,
                discards: row.discards,
                carrier_transitions: row.carrier_transitions,
            };
        }

        let disabled = vec![false; spec.bucket_count];
        let mut entries: Vec<InterfaceHistory> = per_interface
            .into_iter()
            .map(|(intf, (link_pk, link_code, counters))| {
                let (buckets, issue_reasons) =
                    build_counter_buckets(&spec, now, &counters, &disabled);
                InterfaceHistory {
                    device_pk: device.pk.clone(),
                    device_code: device.code.clone(),
                    interface: intf,
                    link_pk,
                    link_code,
                    buckets,
                    issue_reasons,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.interface.cmp(&b.interface));

        Ok(HistoryResponse {
            range: spec.range,
            bucket_minutes: spec.bucket_minutes,
            bucket_count: spec.bucket_count,
            generated_at: now,
            entries,
        })
    }

    async fn fetch_counters(
        &self,
        sql: &str,
        name: &'static str,
        spec: BucketSpec,
        start: i64,
        now: i64,
    ) -> FxHashMap<String, Vec<CounterTotals>> {
        let rows = match self
            .columnar
            .fetch_all::<CounterBucketRow>(
                name,
                self.columnar.query(sql).bind(spec.bucket_minutes).bind(start),
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(query = name, %err, "counter overlay unavailable");
                return FxHashMap::default();
            }
        };
        let mut map: FxHashMap<String, Vec<CounterTotals>> = FxHashMap::default();
        for row in rows {
            let Some(idx) = spec.index_of(now, row.bucket_ts) else {
                continue;
            };
            let entry = map
                .entry(row.entity_pk)
                .or_insert_with(|| vec![CounterTotals::default(); spec.bucket_count]);
            entry[idx] = CounterTotals {
                errors: row.errors,
                discards: row.discards,
                carrier_transitions: row.carrier_transitions,
            };
        }
        map
    }

    /// Per-bucket drain flags from the links history, carried forward from a
    /// baseline at window start.
    async fn link_drain_overlay(
        &self,
        spec: BucketSpec,
        start: i64,
        now: i64,
    ) -> FxHashMap<String, Vec<bool>> {
        let baseline = self
            .columnar
            .fetch_all::<StatusBaselineRow>(
                "history_link_baseline",
                self.columnar.query(LINK_STATUS_BASELINE_SQL).bind(start),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "link status baseline unavailable");
                Vec::new()
            });
        let overlay = self
            .columnar
            .fetch_all::<StatusOverlayRow>(
                "history_link_overlay",
                self.columnar
                    .query(LINK_STATUS_OVERLAY_SQL)
                    .bind(spec.bucket_minutes)
                    .bind(start),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "link status overlay unavailable");
                Vec::new()
            });

        let drained_of = |status: &str, delay_override: i64| {
            is_drained_status(status) || delay_override == SOFT_DRAIN_DELAY_OVERRIDE_NS
        };

        let baselines: FxHashMap<String, bool> = baseline
            .into_iter()
            .map(|row| {
                let flag = drained_of(&row.status, row.delay_override);
                (row.entity_pk, flag)
            })
            .collect();

        let mut per_bucket: FxHashMap<String, Vec<Option<bool>>> = FxHashMap::default();
        for row in overlay {
            let Some(idx) = spec.index_of(now, row.bucket_ts) else {
                continue;
            };
            let entry = per_bucket
                .entry(row.entity_pk)
                .or_insert_with(|| vec![None; spec.bucket_count]);
            entry[idx] = Some(drained_of(&row.status, row.delay_override));
        }
        for pk in baselines.keys() {
            per_bucket
                .entry(pk.clone())
                .or_insert_with(|| vec![None; spec.bucket_count]);
        }

        per_bucket
            .into_iter()
            .map(|(pk, slots)| {
                let mut carried = baselines.get(&pk).copied().unwrap_or(false);
                let flags = slots
                    .into_iter()
                    .map(|slot| {
                        if let Some(flag) = slot {
                            carried = flag;
                        }
                        carried
                    })
                    .collect();
                (pk, flags)
            })
            .collect()
    }

    async fn device_status_overlay(
        &self,
        spec: BucketSpec,
        start: i64,
        now: i64,
    ) -> FxHashMap<String, Vec<bool>> {
        let rows = self
            .columnar
            .fetch_all::<DeviceStatusOverlayRow>(
                "history_device_overlay",
                self.columnar
                    .query(DEVICE_STATUS_OVERLAY_SQL)
                    .bind(spec.bucket_minutes)
                    .bind(start),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "device status overlay unavailable");
                Vec::new()
            });
        let mut per_bucket: FxHashMap<String, Vec<Option<bool>>> = FxHashMap::default();
        for row in rows {
            let Some(idx) = spec.index_of(now, row.bucket_ts) else {
                continue;
            };
            let entry = per_bucket
                .entry(row.entity_pk)
                .or_insert_with(|| vec![None; spec.bucket_count]);
            entry[idx] = Some(row.status != "activated");
        }
        per_bucket
            .into_iter()
            .map(|(pk, slots)| {
                let mut carried = false;
                let flags = slots
                    .into_iter()
                    .map(|slot| {
                        if let Some(flag) = slot {
                            carried = flag;
                        }
                        carried
                    })
                    .collect();
                (pk, flags)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_spec_math() {
        let spec = BucketSpec::new(HistoryRange::H24, 72);
        assert_eq!(spec.bucket_minutes, 20);
        assert_eq!(spec.bucket_count, 72);

        // a fine-grained request hits the 5-minute floor
        let spec = BucketSpec::new(HistoryRange::H1, 72);
        assert_eq!(spec.bucket_minutes, 5);
        assert_eq!(spec.bucket_count, 12);

        // requested buckets clamp into [12, 168]
        let spec = BucketSpec::new(HistoryRange::D7, 1000);
        assert_eq!(spec.bucket_minutes, 60);
        assert_eq!(spec.bucket_count, 168);

        let spec = BucketSpec::new(HistoryRange::H24, 1);
        assert_eq!(spec.bucket_minutes, 120);
        assert_eq!(spec.bucket_count, 12);
    }

    #[test]
    fn timestamps_exact_count_strictly_ascending() {
        for range in [
            HistoryRange::H1,
            HistoryRange::H3,
            HistoryRange::H6,
            HistoryRange::H12,
            HistoryRange::H24,
            HistoryRange::D3,
            HistoryRange::D7,
        ] {
            let spec = BucketSpec::new(range, 72);
            let timestamps = spec.bucket_timestamps(1_700_000_123);
            assert_eq!(timestamps.len(), spec.bucket_count);
            assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn index_of_roundtrips() {
        let spec = BucketSpec::new(HistoryRange::H6, 36);
        let now = 1_700_000_000;
        for (idx, ts) in spec.bucket_timestamps(now).iter().enumerate() {
            assert_eq!(spec.index_of(now, *ts), Some(idx));
        }
        assert_eq!(spec.index_of(now, spec.window_start(now) - 1), None);
    }

    #[test]
    fn direction_fold_is_sample_weighted() {
        let a = BucketStats {
            avg_rtt_us: 1_000.0,
            loss_pct: 0.0,
            samples: 30,
        };
        let z = BucketStats {
            avg_rtt_us: 2_000.0,
            loss_pct: 10.0,
            samples: 10,
        };
        let folded = BucketStats::fold(Some(a), Some(z)).unwrap();
        assert_eq!(folded.samples, 40);
        assert!((folded.avg_rtt_us - 1_250.0).abs() < 1e-9);
        assert!((folded.loss_pct - 2.5).abs() < 1e-9);

        assert_eq!(BucketStats::fold(Some(a), None).unwrap(), a);
        assert_eq!(BucketStats::fold(None, None), None);
    }

    fn inputs(spec: &BucketSpec) -> LinkBucketInputs {
        LinkBucketInputs {
            stats: vec![None; spec.bucket_count],
            counters: vec![CounterTotals::default(); spec.bucket_count],
            drained: vec![false; spec.bucket_count],
            committed_rtt_us: 1_000.0,
            sla_eligible: true,
        }
    }

    fn clean(avg_rtt_us: f64, loss_pct: f64) -> Option<BucketStats> {
        Some(BucketStats {
            avg_rtt_us,
            loss_pct,
            samples: 50,
        })
    }

    #[test]
    fn extended_loss_run_relabels_disabled() {
        // 30-minute buckets: four contiguous buckets of total loss span 2h
        let spec = BucketSpec::new(HistoryRange::H6, 12);
        assert_eq!(spec.bucket_minutes, 30);
        let mut input = inputs(&spec);
        for idx in 0..spec.bucket_count {
            input.stats[idx] = clean(900.0, 0.0);
        }
        for idx in 4..8 {
            input.stats[idx] = clean(900.0, 100.0);
        }
        let (buckets, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        for bucket in &buckets[4..8] {
            assert_eq!(bucket.state, HealthState::Disabled);
        }
        assert!(reasons.contains(&IssueReason::ExtendedLoss));
        // every lossy bucket was swallowed into disabled
        assert!(!reasons.contains(&IssueReason::PacketLoss));
    }

    #[test]
    fn short_total_loss_run_stays_disabled_only_by_sla() {
        let spec = BucketSpec::new(HistoryRange::H6, 12);
        let mut input = inputs(&spec);
        for idx in 0..spec.bucket_count {
            input.stats[idx] = clean(900.0, 0.0);
        }
        // 3 buckets = 90 minutes, below the run threshold
        for idx in 4..7 {
            input.stats[idx] = clean(900.0, 100.0);
        }
        let (_, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        assert!(!reasons.contains(&IssueReason::ExtendedLoss));
        assert!(reasons.contains(&IssueReason::PacketLoss));
    }

    #[test]
    fn packet_loss_reason_survives_when_loss_outside_run() {
        let spec = BucketSpec::new(HistoryRange::H6, 12);
        let mut input = inputs(&spec);
        for idx in 0..spec.bucket_count {
            input.stats[idx] = clean(900.0, 0.0);
        }
        for idx in 4..8 {
            input.stats[idx] = clean(900.0, 100.0);
        }
        // separate moderate-loss bucket outside the run
        input.stats[0] = clean(900.0, 5.0);
        let (_, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        assert!(reasons.contains(&IssueReason::ExtendedLoss));
        assert!(reasons.contains(&IssueReason::PacketLoss));
    }

    #[test]
    fn drained_buckets_are_disabled() {
        let spec = BucketSpec::new(HistoryRange::H3, 12);
        let mut input = inputs(&spec);
        input.drained[2] = true;
        input.stats[2] = clean(900.0, 0.0);
        let (buckets, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        assert_eq!(buckets[2].state, HealthState::Disabled);
        assert!(reasons.contains(&IssueReason::Drained));
    }

    #[test]
    fn most_recent_bucket_exempt_from_no_data() {
        let spec = BucketSpec::new(HistoryRange::H3, 12);
        let mut input = inputs(&spec);
        for idx in 0..spec.bucket_count - 1 {
            input.stats[idx] = clean(900.0, 0.0);
        }
        // newest bucket has no samples
        let (buckets, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        assert_eq!(buckets.last().unwrap().state, HealthState::NoData);
        assert!(!reasons.contains(&IssueReason::NoData));

        // but an older silent bucket does raise the reason
        let mut input2 = inputs(&spec);
        for idx in 0..spec.bucket_count {
            input2.stats[idx] = clean(900.0, 0.0);
        }
        input2.stats[3] = None;
        let (_, reasons) = build_link_buckets(&spec, 1_700_000_000, &input2);
        assert!(reasons.contains(&IssueReason::NoData));
    }

    #[test]
    fn interface_upgrades_from_healthy() {
        let spec = BucketSpec::new(HistoryRange::H3, 12);
        let mut input = inputs(&spec);
        for idx in 0..spec.bucket_count {
            input.stats[idx] = clean(900.0, 0.0);
        }
        input.counters[1] = CounterTotals {
            errors: 5,
            discards: 0,
            carrier_transitions: 0,
        };
        input.counters[2] = CounterTotals {
            errors: 0,
            discards: 0,
            carrier_transitions: 2,
        };
        // unhealthy bucket is not upgraded further
        input.stats[3] = clean(900.0, 50.0);
        input.counters[3] = CounterTotals {
            errors: 9,
            discards: 0,
            carrier_transitions: 0,
        };
        let (buckets, reasons) = build_link_buckets(&spec, 1_700_000_000, &input);
        assert_eq!(buckets[1].state, HealthState::Degraded);
        assert_eq!(buckets[2].state, HealthState::Unhealthy);
        assert_eq!(buckets[3].state, HealthState::Unhealthy);
        assert!(reasons.contains(&IssueReason::InterfaceErrors));
        assert!(reasons.contains(&IssueReason::CarrierTransitions));
    }

    #[test]
    fn counter_classification_thresholds() {
        assert_eq!(
            classify_counters(CounterTotals::default()),
            HealthState::Healthy
        );
        assert_eq!(
            classify_counters(CounterTotals {
                errors: 1,
                ..Default::default()
            }),
            HealthState::Degraded
        );
        assert_eq!(
            classify_counters(CounterTotals {
                discards: 100,
                ..Default::default()
            }),
            HealthState::Unhealthy
        );
    }

    #[test]
    fn counter_buckets_have_exact_count() {
        let spec = BucketSpec::new(HistoryRange::H24, 48);
        let (buckets, _) = build_counter_buckets(
            &spec,
            1_700_000_000,
            &vec![CounterTotals::default(); spec.bucket_count],
            &vec![false; spec.bucket_count],
        );
        assert_eq!(buckets.len(), spec.bucket_count);
        assert!(buckets.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn range_parsing() {
        assert_eq!(HistoryRange::parse("1h"), Some(HistoryRange::H1));
        assert_eq!(HistoryRange::parse(""), Some(HistoryRange::H24));
        assert_eq!(HistoryRange::parse("7d"), Some(HistoryRange::D7));
        assert_eq!(HistoryRange::parse("2w"), None);
    }
}
