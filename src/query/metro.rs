//! Metro-level analytics: the connectivity matrix, all-pairs device paths
//! between two metros, and the per-metro-pair best-path latency view.

use std::sync::Arc;
use std::time::Duration;

use neo4rs::query;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{FabricError, Result};
use crate::graph::GraphClient;
use crate::query::paths::{
    apply_link_metrics, effective_latency, DevicePath, PathEngine, PathMode,
};

/// In-flight per-pair path queries; guards the driver's connection pool.
const PAIR_CONCURRENCY: usize = 10;
/// Deadline for one per-pair query.
const PAIR_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct MetroRef {
    pub pk: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroPairEntry {
    pub metro_a_pk: String,
    pub metro_a_code: String,
    pub metro_b_pk: String,
    pub metro_b_code: String,
    pub link_count: i64,
    pub min_metric: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroConnectivity {
    pub pairs: Vec<MetroPairEntry>,
    pub isolated_metros: Vec<MetroRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicePairPath {
    pub from_device_pk: String,
    pub from_device_code: String,
    pub to_device_pk: String,
    pub to_device_code: String,
    #[serde(flatten)]
    pub path: DevicePath,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PathSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub min_hops: usize,
    pub max_hops: usize,
    pub avg_hops: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroDevicePaths {
    pub from_metro: MetroRef,
    pub to_metro: MetroRef,
    pub pairs: Vec<DevicePairPath>,
    pub summary: PathSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroPathLatencyEntry {
    pub from_metro: MetroRef,
    pub to_metro: MetroRef,
    /// Best device pair for the metro pair, by effective latency.
    pub best: Option<DevicePairPath>,
    pub summary: PathSummary,
}

const METRO_CYPHER: &str = "\
    MATCH (m:Metro {pk: $metro}) \
    RETURN m.pk AS pk, m.code AS code";

const METRO_DEVICES_CYPHER: &str = "\
    MATCH (m:Metro {pk: $metro})<-[:LOCATED_IN]-(d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    RETURN d.pk AS pk, d.code AS code \
    ORDER BY d.code";

const ALL_METROS_CYPHER: &str = "\
    MATCH (m:Metro)<-[:LOCATED_IN]-(d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    RETURN DISTINCT m.pk AS pk, m.code AS code \
    ORDER BY m.code";

const CONNECTIVITY_CYPHER: &str = "\
    MATCH (a:Device)-[r:ISIS_ADJACENT]->(b:Device), \
          (a)-[:LOCATED_IN]->(ma:Metro), (b)-[:LOCATED_IN]->(mb:Metro) \
    WHERE ma.pk < mb.pk \
    RETURN ma.pk AS metro_a_pk, ma.code AS metro_a_code, \
           mb.pk AS metro_b_pk, mb.code AS metro_b_code, \
           count(r) AS link_count, min(r.metric) AS min_metric \
    ORDER BY metro_a_code, metro_b_code";

const ISOLATED_METROS_CYPHER: &str = "\
    MATCH (m:Metro)<-[:LOCATED_IN]-(d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    OPTIONAL MATCH (d)-[:ISIS_ADJACENT]-(:Device)-[:LOCATED_IN]->(other:Metro) \
    WHERE other.pk <> m.pk \
    WITH m, count(other) AS external_adjacencies \
    WHERE external_adjacencies = 0 \
    RETURN m.pk AS pk, m.code AS code \
    ORDER BY code";

pub struct MetroEngine {
    graph: Arc<GraphClient>,
    paths: Arc<PathEngine>,
}

impl MetroEngine {
    pub fn new(graph: Arc<GraphClient>, paths: Arc<PathEngine>) -> Self {
        Self { graph, paths }
    }

    pub async fn connectivity(&self) -> Result<MetroConnectivity> {
        let pair_records = self
            .graph
            .run_with_retry(
                "metro_connectivity",
                || query(CONNECTIVITY_CYPHER),
                &[
                    "metro_a_pk",
                    "metro_a_code",
                    "metro_b_pk",
                    "metro_b_code",
                    "link_count",
                    "min_metric",
                ],
            )
            .await?;
        let pairs = pair_records
            .iter()
            .map(|r| MetroPairEntry {
                metro_a_pk: r.str("metro_a_pk"),
                metro_a_code: r.str("metro_a_code"),
                metro_b_pk: r.str("metro_b_pk"),
                metro_b_code: r.str("metro_b_code"),
                link_count: r.i64("link_count"),
                min_metric: r.i64("min_metric"),
            })
            .collect();

        // isolation detection is additive; a failure degrades to an empty list
        let isolated_metros = match self
            .graph
            .run("metro_isolated", query(ISOLATED_METROS_CYPHER), &["pk", "code"])
            .await
        {
            Ok(records) => records
                .iter()
                .map(|r| MetroRef {
                    pk: r.str("pk"),
                    code: r.str("code"),
                })
                .collect(),
            Err(err) => {
                warn!(%err, "isolated-metro detection unavailable");
                Vec::new()
            }
        };

        Ok(MetroConnectivity {
            pairs,
            isolated_metros,
        })
    }

    async fn metro_ref(&self, metro_pk: &str) -> Result<MetroRef> {
        let records = self
            .graph
            .run("metro_lookup", query(METRO_CYPHER).param("metro", metro_pk), &["pk", "code"])
            .await?;
        let record = records.first().ok_or(FabricError::NotFound("metro"))?;
        Ok(MetroRef {
            pk: record.str("pk"),
            code: record.str("code"),
        })
    }

    async fn isis_devices(&self, metro_pk: &str) -> Result<Vec<(String, String)>> {
        let records = self
            .graph
            .run(
                "metro_devices",
                query(METRO_DEVICES_CYPHER).param("metro", metro_pk),
                &["pk", "code"],
            )
            .await?;
        Ok(records
            .iter()
            .map(|r| (r.str("pk"), r.str("code")))
            .collect())
    }

    /// Best path between every `(device_in_from, device_in_to)` pair, with a
    /// bounded fan-out. Per-pair failures are logged and skipped.
    pub async fn device_paths(
        &self,
        from_metro_pk: &str,
        to_metro_pk: &str,
        mode: PathMode,
    ) -> Result<MetroDevicePaths> {
        if from_metro_pk.is_empty() || to_metro_pk.is_empty() {
            return Err(FabricError::InvalidArgument(
                "both from and to metro pks are required".into(),
            ));
        }
        if from_metro_pk == to_metro_pk {
            return Err(FabricError::InvalidArgument(
                "from and to must be distinct metros".into(),
            ));
        }
        let from_metro = self.metro_ref(from_metro_pk).await?;
        let to_metro = self.metro_ref(to_metro_pk).await?;
        let from_devices = self.isis_devices(from_metro_pk).await?;
        let to_devices = self.isis_devices(to_metro_pk).await?;

        let attempted = from_devices.len() * to_devices.len();
        let semaphore = Arc::new(Semaphore::new(PAIR_CONCURRENCY));
        let mut join_set: JoinSet<Option<DevicePairPath>> = JoinSet::new();
        for (from_pk, from_code) in &from_devices {
            for (to_pk, to_code) in &to_devices {
                let semaphore = Arc::clone(&semaphore);
                let paths = Arc::clone(&self.paths);
                let (from_pk, from_code) = (from_pk.clone(), from_code.clone());
                let (to_pk, to_code) = (to_pk.clone(), to_code.clone());
                join_set.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    match paths.pair_path(&from_pk, &to_pk, mode, PAIR_DEADLINE).await {
                        Ok(path) => Some(DevicePairPath {
                            from_device_pk: from_pk,
                            from_device_code: from_code,
                            to_device_pk: to_pk,
                            to_device_code: to_code,
                            path,
                        }),
                        Err(err) => {
                            warn!(from = %from_pk, to = %to_pk, %err, "device pair path failed");
                            None
                        }
                    }
                });
            }
        }

        let mut pairs: Vec<DevicePairPath> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(pair)) = joined {
                pairs.push(pair);
            }
        }

        // enrichment is additive; without it paths compare on metric alone
        match self.paths.link_metrics().await {
            Ok(metrics) => {
                let mut path_views: Vec<DevicePath> =
                    pairs.iter().map(|p| p.path.clone()).collect();
                apply_link_metrics(&mut path_views, &metrics);
                for (pair, enriched) in pairs.iter_mut().zip(path_views) {
                    pair.path = enriched;
                }
            }
            Err(err) => warn!(%err, "path enrichment unavailable"),
        }
        pairs.sort_by(|a, b| {
            effective_latency(&a.path)
                .total_cmp(&effective_latency(&b.path))
                .then(a.path.total_metric.cmp(&b.path.total_metric))
        });

        let summary = summarize(&pairs, attempted);
        Ok(MetroDevicePaths {
            from_metro,
            to_metro,
            pairs,
            summary,
        })
    }

    /// Best path per metro pair across all metros with IS-IS devices.
    pub async fn path_latency_matrix(&self, mode: PathMode) -> Result<Vec<MetroPathLatencyEntry>> {
        let metro_records = self
            .graph
            .run_with_retry("all_metros", || query(ALL_METROS_CYPHER), &["pk", "code"])
            .await?;
        let metros: Vec<MetroRef> = metro_records
            .iter()
            .map(|r| MetroRef {
                pk: r.str("pk"),
                code: r.str("code"),
            })
            .collect();

        let mut entries = Vec::new();
        for i in 0..metros.len() {
            for j in (i + 1)..metros.len() {
                match self.device_paths(&metros[i].pk, &metros[j].pk, mode).await {
                    Ok(mut result) => {
                        let best = if result.pairs.is_empty() {
                            None
                        } else {
                            Some(result.pairs.remove(0))
                        };
                        entries.push(MetroPathLatencyEntry {
                            from_metro: metros[i].clone(),
                            to_metro: metros[j].clone(),
                            best,
                            summary: result.summary,
                        });
                    }
                    Err(err) => {
                        warn!(from = %metros[i].code, to = %metros[j].code, %err,
                              "metro pair latency unavailable");
                    }
                }
            }
        }
        Ok(entries)
    }
}

fn summarize(pairs: &[DevicePairPath], attempted: usize) -> PathSummary {
    if pairs.is_empty() {
        return PathSummary {
            attempted,
            ..PathSummary::default()
        };
    }
    let mut summary = PathSummary {
        attempted,
        succeeded: pairs.len(),
        min_hops: usize::MAX,
        max_hops: 0,
        avg_hops: 0.0,
        min_latency_ms: f64::MAX,
        max_latency_ms: 0.0,
        avg_latency_ms: 0.0,
    };
    let mut hop_total = 0usize;
    let mut latency_total = 0.0;
    for pair in pairs {
        let hops = pair.path.hop_count;
        let latency = effective_latency(&pair.path);
        summary.min_hops = summary.min_hops.min(hops);
        summary.max_hops = summary.max_hops.max(hops);
        summary.min_latency_ms = summary.min_latency_ms.min(latency);
        summary.max_latency_ms = summary.max_latency_ms.max(latency);
        hop_total += hops;
        latency_total += latency;
    }
    summary.avg_hops = hop_total as f64 / pairs.len() as f64;
    summary.avg_latency_ms = latency_total / pairs.len() as f64;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::value::RawHop;
    use crate::query::paths::path_from_record;

    fn pair(from: &str, to: &str, hops: &[&str], metric: i64) -> DevicePairPath {
        let raw: Vec<RawHop> = hops
            .iter()
            .map(|pk| RawHop {
                pk: (*pk).into(),
                code: pk.to_uppercase(),
                status: "activated".into(),
                device_type: "switch".into(),
            })
            .collect();
        DevicePairPath {
            from_device_pk: from.into(),
            from_device_code: from.to_uppercase(),
            to_device_pk: to.into(),
            to_device_code: to.to_uppercase(),
            path: path_from_record(raw, metric),
        }
    }

    #[test]
    fn summary_aggregates_min_max_avg() {
        let pairs = vec![
            pair("a1", "b1", &["a1", "x", "b1"], 20),
            pair("a2", "b1", &["a2", "b1"], 5),
        ];
        let summary = summarize(&pairs, 4);
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.min_hops, 1);
        assert_eq!(summary.max_hops, 2);
        assert!((summary.avg_hops - 1.5).abs() < 1e-9);
        assert!((summary.min_latency_ms - 5.0).abs() < 1e-9);
        assert!((summary.max_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_summary_keeps_attempted_count() {
        let summary = summarize(&[], 9);
        assert_eq!(summary.attempted, 9);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.min_hops, 0);
        assert_eq!(summary.min_latency_ms, 0.0);
    }
}
