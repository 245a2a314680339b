//! Path engine: shortest and K-shortest paths over the IS-IS adjacency
//! graph, plus measured-latency enrichment from recent telemetry.

use clickhouse::Row;
use neo4rs::query;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::columnar::ColumnarClient;
use crate::error::{FabricError, Result};
use crate::graph::GraphClient;

pub const MAX_K: usize = 10;
pub const DEFAULT_K: usize = 5;
/// Candidate paths considered before dedup and the final top-k cut.
const K_SHORTEST_CANDIDATES: i64 = 50;
/// Enrichment looks back this far.
const ENRICH_WINDOW_HOURS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    Hops,
    Latency,
}

impl PathMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hops" | "" => Some(Self::Hops),
            "latency" => Some(Self::Latency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PathHop {
    pub device_pk: String,
    pub device_code: String,
    pub status: String,
    pub device_type: String,
    /// Edge metrics for the segment arriving at this hop; zero on the first
    /// hop and on segments with no recent telemetry.
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DevicePath {
    pub hops: Vec<PathHop>,
    pub total_metric: i64,
    pub hop_count: usize,
    pub measured_latency_ms: f64,
    /// Minimum sample count across enriched segments.
    pub total_samples: i64,
}

impl DevicePath {
    pub fn device_sequence(&self) -> Vec<&str> {
        self.hops.iter().map(|h| h.device_pk.as_str()).collect()
    }
}

/// Aggregated per-link telemetry keyed by ordered device-pk pair, both
/// directions present.
pub type LinkMetricsMap = FxHashMap<(String, String), LinkMetrics>;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkMetrics {
    pub avg_rtt_ms: f64,
    pub avg_jitter_ms: f64,
    pub loss_pct: f64,
    pub samples: i64,
}

const SHORTEST_HOPS_CYPHER: &str = "\
    MATCH (a:Device {pk: $from}), (b:Device {pk: $to}), \
          p = shortestPath((a)-[:ISIS_ADJACENT*..20]-(b)) \
    RETURN [n IN nodes(p) | {pk: n.pk, code: n.code, status: n.status, device_type: n.device_type}] AS hops, \
           reduce(total = 0, r IN relationships(p) | total + r.metric) AS total_metric";

const SHORTEST_LATENCY_CYPHER: &str = "\
    MATCH (a:Device {pk: $from}), (b:Device {pk: $to}) \
    CALL apoc.algo.dijkstra(a, b, 'ISIS_ADJACENT', 'metric') YIELD path, weight \
    RETURN [n IN nodes(path) | {pk: n.pk, code: n.code, status: n.status, device_type: n.device_type}] AS hops, \
           toInteger(weight) AS total_metric";

const ALL_SHORTEST_CYPHER: &str = "\
    MATCH (a:Device {pk: $from}), (b:Device {pk: $to}), \
          p = allShortestPaths((a)-[:ISIS_ADJACENT*..20]-(b)) \
    RETURN [n IN nodes(p) | {pk: n.pk, code: n.code, status: n.status, device_type: n.device_type}] AS hops, \
           reduce(total = 0, r IN relationships(p) | total + r.metric) AS total_metric \
    LIMIT $limit";

const ENRICH_SQL: &str = "\
    WITH recent AS ( \
        SELECT \
            link_pk, \
            ifNotFinite(avg(rtt_us) / 1000, 0) AS avg_rtt_ms, \
            ifNotFinite(avg(ipdv_us) / 1000, 0) AS avg_jitter_ms, \
            ifNotFinite(countIf(loss) * 100 / count(), 0) AS loss_pct, \
            toInt64(count()) AS samples \
        FROM fact_dz_device_link_latency \
        WHERE event_ts >= now() - INTERVAL ? HOUR \
        GROUP BY link_pk \
    ) \
    SELECT l.side_a_pk AS from_pk, l.side_z_pk AS to_pk, \
           r.avg_rtt_ms AS avg_rtt_ms, r.avg_jitter_ms AS avg_jitter_ms, \
           r.loss_pct AS loss_pct, r.samples AS samples \
    FROM recent AS r \
    INNER JOIN dz_links_current AS l ON l.pk = r.link_pk \
    UNION ALL \
    SELECT l.side_z_pk AS from_pk, l.side_a_pk AS to_pk, \
           r.avg_rtt_ms, r.avg_jitter_ms, r.loss_pct, r.samples \
    FROM recent AS r \
    INNER JOIN dz_links_current AS l ON l.pk = r.link_pk";

#[derive(Debug, Row, Deserialize)]
struct EnrichRow {
    from_pk: String,
    to_pk: String,
    avg_rtt_ms: f64,
    avg_jitter_ms: f64,
    loss_pct: f64,
    samples: i64,
}

pub struct PathEngine {
    graph: std::sync::Arc<GraphClient>,
    columnar: ColumnarClient,
}

impl PathEngine {
    pub fn new(graph: std::sync::Arc<GraphClient>, columnar: ColumnarClient) -> Self {
        Self { graph, columnar }
    }

    fn validate_endpoints(from: &str, to: &str) -> Result<()> {
        if from.is_empty() || to.is_empty() {
            return Err(FabricError::InvalidArgument(
                "both from and to device pks are required".into(),
            ));
        }
        if from == to {
            return Err(FabricError::InvalidArgument(
                "from and to must be distinct devices".into(),
            ));
        }
        Ok(())
    }

    pub async fn shortest_path(
        &self,
        from: &str,
        to: &str,
        mode: PathMode,
    ) -> Result<DevicePath> {
        Self::validate_endpoints(from, to)?;
        let (name, cypher) = match mode {
            PathMode::Hops => ("shortest_path_hops", SHORTEST_HOPS_CYPHER),
            PathMode::Latency => ("shortest_path_latency", SHORTEST_LATENCY_CYPHER),
        };
        let records = self
            .graph
            .run_with_retry(
                name,
                || query(cypher).param("from", from).param("to", to),
                &["hops", "total_metric"],
            )
            .await?;
        let record = records.first().ok_or(FabricError::NotFound("path"))?;
        let mut path = path_from_record(record.hops("hops"), record.i64("total_metric"));
        if mode == PathMode::Latency {
            let metrics = self.link_metrics().await?;
            apply_link_metrics(std::slice::from_mut(&mut path), &metrics);
        }
        Ok(path)
    }

    pub async fn k_shortest_paths(
        &self,
        from: &str,
        to: &str,
        k: usize,
        mode: PathMode,
    ) -> Result<Vec<DevicePath>> {
        Self::validate_endpoints(from, to)?;
        let k = k.clamp(1, MAX_K);
        let records = self
            .graph
            .run_with_retry(
                "k_shortest_paths",
                || {
                    query(ALL_SHORTEST_CYPHER)
                        .param("from", from)
                        .param("to", to)
                        .param("limit", K_SHORTEST_CANDIDATES)
                },
                &["hops", "total_metric"],
            )
            .await?;
        let mut paths: Vec<DevicePath> = records
            .iter()
            .map(|r| path_from_record(r.hops("hops"), r.i64("total_metric")))
            .filter(|p| !p.hops.is_empty())
            .collect();
        paths = dedup_paths(paths);
        if mode == PathMode::Latency {
            let metrics = self.link_metrics().await?;
            apply_link_metrics(&mut paths, &metrics);
        }
        sort_paths(&mut paths, mode);
        paths.truncate(k);
        Ok(paths)
    }

    /// Bare per-pair path with an explicit deadline and no enrichment; the
    /// metro fan-out issues many of these against fresh sessions.
    pub async fn pair_path(
        &self,
        from: &str,
        to: &str,
        mode: PathMode,
        deadline: std::time::Duration,
    ) -> Result<DevicePath> {
        let (name, cypher) = match mode {
            PathMode::Hops => ("pair_path_hops", SHORTEST_HOPS_CYPHER),
            PathMode::Latency => ("pair_path_latency", SHORTEST_LATENCY_CYPHER),
        };
        let records = self
            .graph
            .run_with_deadline(
                name,
                query(cypher).param("from", from).param("to", to),
                &["hops", "total_metric"],
                deadline,
            )
            .await?;
        let record = records.first().ok_or(FabricError::NotFound("path"))?;
        Ok(path_from_record(
            record.hops("hops"),
            record.i64("total_metric"),
        ))
    }

    /// One batched query covering every link, used by all enrichment sites.
    pub async fn link_metrics(&self) -> Result<LinkMetricsMap> {
        let rows = self
            .columnar
            .fetch_all::<EnrichRow>(
                "path_link_metrics",
                self.columnar.query(ENRICH_SQL).bind(ENRICH_WINDOW_HOURS),
            )
            .await?;
        let mut map = LinkMetricsMap::default();
        for row in rows {
            map.insert(
                (row.from_pk, row.to_pk),
                LinkMetrics {
                    avg_rtt_ms: row.avg_rtt_ms,
                    avg_jitter_ms: row.avg_jitter_ms,
                    loss_pct: row.loss_pct,
                    samples: row.samples,
                },
            );
        }
        Ok(map)
    }
}

pub fn path_from_record(hops: Vec<crate::graph::value::RawHop>, total_metric: i64) -> DevicePath {
    let hop_count = hops.len().saturating_sub(1);
    DevicePath {
        hops: hops
            .into_iter()
            .map(|h| PathHop {
                device_pk: h.pk,
                device_code: h.code,
                status: h.status,
                device_type: h.device_type,
                rtt_ms: 0.0,
                jitter_ms: 0.0,
                loss_pct: 0.0,
            })
            .collect(),
        total_metric,
        hop_count,
        measured_latency_ms: 0.0,
        total_samples: 0,
    }
}

/// Drops candidates repeating an already seen device-pk sequence.
pub fn dedup_paths(paths: Vec<DevicePath>) -> Vec<DevicePath> {
    let mut seen: std::collections::HashSet<Vec<String>> = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|p| {
            seen.insert(
                p.device_sequence()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )
        })
        .collect()
}

/// Walks consecutive device pairs of each path, filling hop edge metrics and
/// accumulating measured latency. Paths with no matching links keep zero
/// measured fields.
pub fn apply_link_metrics(paths: &mut [DevicePath], metrics: &LinkMetricsMap) {
    for path in paths.iter_mut() {
        let mut measured = 0.0;
        let mut min_samples: Option<i64> = None;
        for i in 1..path.hops.len() {
            let key = (
                path.hops[i - 1].device_pk.clone(),
                path.hops[i].device_pk.clone(),
            );
            if let Some(link) = metrics.get(&key) {
                let hop = &mut path.hops[i];
                hop.rtt_ms = link.avg_rtt_ms;
                hop.jitter_ms = link.avg_jitter_ms;
                hop.loss_pct = link.loss_pct;
                measured += link.avg_rtt_ms;
                min_samples = Some(match min_samples {
                    Some(m) => m.min(link.samples),
                    None => link.samples,
                });
            }
        }
        path.measured_latency_ms = measured;
        path.total_samples = min_samples.unwrap_or(0);
    }
}

pub fn sort_paths(paths: &mut [DevicePath], mode: PathMode) {
    match mode {
        PathMode::Hops => paths.sort_by(|a, b| {
            a.hop_count
                .cmp(&b.hop_count)
                .then(a.total_metric.cmp(&b.total_metric))
        }),
        PathMode::Latency => paths.sort_by(|a, b| {
            a.measured_latency_ms
                .total_cmp(&b.measured_latency_ms)
                .then(a.total_metric.cmp(&b.total_metric))
        }),
    }
}

/// Effective latency used for cross-path comparisons: measured when any
/// segment was enriched, metric fallback otherwise.
pub fn effective_latency(path: &DevicePath) -> f64 {
    if path.measured_latency_ms > 0.0 {
        path.measured_latency_ms
    } else {
        path.total_metric as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::value::RawHop;

    fn raw(pk: &str) -> RawHop {
        RawHop {
            pk: pk.into(),
            code: pk.to_uppercase(),
            status: "activated".into(),
            device_type: "switch".into(),
        }
    }

    fn path(pks: &[&str], metric: i64) -> DevicePath {
        path_from_record(pks.iter().map(|pk| raw(pk)).collect(), metric)
    }

    #[test]
    fn hop_count_is_edges_not_nodes() {
        let p = path(&["a", "b", "c"], 20);
        assert_eq!(p.hop_count, 2);
        assert_eq!(p.total_metric, 20);
    }

    #[test]
    fn dedup_by_device_sequence() {
        let paths = vec![
            path(&["a", "b", "d"], 20),
            path(&["a", "b", "d"], 20),
            path(&["a", "c", "d"], 2),
        ];
        let deduped = dedup_paths(paths);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn k_shortest_dedup_collapses_identical_sequences() {
        // three candidates with the same device sequence leave exactly one
        let paths = vec![
            path(&["a", "b"], 10),
            path(&["a", "b"], 10),
            path(&["a", "b"], 10),
        ];
        let mut deduped = dedup_paths(paths);
        sort_paths(&mut deduped, PathMode::Hops);
        deduped.truncate(2);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn no_repeated_devices_along_shortest_paths() {
        let p = path(&["a", "b", "c", "d"], 5);
        let seq = p.device_sequence();
        let unique: std::collections::HashSet<_> = seq.iter().collect();
        assert_eq!(unique.len(), seq.len());
    }

    fn metrics_for(pairs: &[(&str, &str, f64, i64)]) -> LinkMetricsMap {
        let mut map = LinkMetricsMap::default();
        for (from, to, rtt, samples) in pairs {
            map.insert(
                (from.to_string(), to.to_string()),
                LinkMetrics {
                    avg_rtt_ms: *rtt,
                    avg_jitter_ms: 0.1,
                    loss_pct: 0.0,
                    samples: *samples,
                },
            );
        }
        map
    }

    #[test]
    fn enrichment_accumulates_and_takes_min_samples() {
        let mut paths = vec![path(&["a", "b", "c"], 20)];
        let metrics = metrics_for(&[("a", "b", 1.5, 100), ("b", "c", 2.5, 40)]);
        apply_link_metrics(&mut paths, &metrics);
        let p = &paths[0];
        assert!((p.measured_latency_ms - 4.0).abs() < 1e-9);
        assert_eq!(p.total_samples, 40);
        assert!((p.hops[1].rtt_ms - 1.5).abs() < 1e-9);
        assert!((p.hops[2].rtt_ms - 2.5).abs() < 1e-9);
        assert_eq!(p.hops[0].rtt_ms, 0.0);
    }

    #[test]
    fn unknown_links_leave_path_unmeasured_but_present() {
        let mut paths = vec![path(&["x", "y"], 9)];
        apply_link_metrics(&mut paths, &LinkMetricsMap::default());
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].measured_latency_ms, 0.0);
        assert_eq!(paths[0].total_samples, 0);
        assert_eq!(effective_latency(&paths[0]), 9.0);
    }

    #[test]
    fn sort_modes() {
        let mut short_heavy = path(&["a", "b"], 100);
        let mut long_light = path(&["a", "c", "b"], 2);
        let metrics = metrics_for(&[("a", "b", 9.0, 10), ("a", "c", 1.0, 10), ("c", "b", 1.0, 10)]);
        apply_link_metrics(std::slice::from_mut(&mut short_heavy), &metrics);
        apply_link_metrics(std::slice::from_mut(&mut long_light), &metrics);

        let mut by_hops = vec![long_light.clone(), short_heavy.clone()];
        sort_paths(&mut by_hops, PathMode::Hops);
        assert_eq!(by_hops[0].hop_count, 1);

        let mut by_latency = vec![short_heavy, long_light];
        sort_paths(&mut by_latency, PathMode::Latency);
        assert!((by_latency[0].measured_latency_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(PathMode::parse("hops"), Some(PathMode::Hops));
        assert_eq!(PathMode::parse(""), Some(PathMode::Hops));
        assert_eq!(PathMode::parse("latency"), Some(PathMode::Latency));
        assert_eq!(PathMode::parse("fastest"), None);
    }
}
