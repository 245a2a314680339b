//! Impact analyses: single-device failure impact and batched maintenance
//! impact for sets of devices and links.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clickhouse::Row;
use neo4rs::query;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::columnar::ColumnarClient;
use crate::error::{FabricError, Result};
use crate::graph::GraphClient;

/// Affected-path output cap; candidate enumeration stops at twice this.
const AFFECTED_PATH_LIMIT: usize = 20;
const AFFECTED_METRO_LIMIT: usize = 50;

/// Reroute classification bounds.
const REROUTE_MAX_EXTRA_HOPS: i64 = 2;
const REROUTE_MAX_EXTRA_METRIC: i64 = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceRef {
    pub pk: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborPairImpact {
    pub n1: DeviceRef,
    pub n2: DeviceRef,
    /// metric(target, n1) + metric(target, n2)
    pub through_metric: i64,
    /// Best path avoiding the target; `None` when the pair disconnects.
    pub alt_metric: Option<i64>,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroImpact {
    pub metro_pk: String,
    pub metro_code: String,
    pub total_devices: usize,
    pub isolated_devices: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureImpact {
    pub device: DeviceRef,
    pub unreachable_devices: Vec<DeviceRef>,
    pub affected_paths: Vec<NeighborPairImpact>,
    pub metro_impact: Vec<MetroImpact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceRequest {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    Device,
    Link,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceItem {
    pub kind: MaintenanceKind,
    pub pk: String,
    pub code: String,
    pub neighbor_count: i64,
    pub critical: bool,
    /// Leaf neighbors that lose their only adjacency.
    pub isolated_leaves: Vec<String>,
    pub impact: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathOutcome {
    Rerouted,
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectedPath {
    pub n1: DeviceRef,
    pub n2: DeviceRef,
    pub current_metric: i64,
    pub current_hops: i64,
    pub alt_metric: Option<i64>,
    pub alt_hops: Option<i64>,
    pub outcome: PathOutcome,
    /// Offline devices the current path transits.
    pub via: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectedMetroPair {
    pub metro_a_pk: String,
    pub metro_a_code: String,
    pub metro_b_pk: String,
    pub metro_b_code: String,
    pub links: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceImpact {
    pub items: Vec<MaintenanceItem>,
    pub affected_paths: Vec<AffectedPath>,
    pub affected_metros: Vec<AffectedMetroPair>,
    /// Item pks ascending by estimated impact.
    pub recommended_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Cypher
// ---------------------------------------------------------------------------

const TARGET_CYPHER: &str = "\
    MATCH (d:Device {pk: $pk}) \
    RETURN d.pk AS pk, d.code AS code, d.isis_system_id AS isis_system_id";

const REFERENCE_CYPHER: &str = "\
    MATCH (d:Device)-[:ISIS_ADJACENT]-(n:Device) \
    WHERE d.pk <> $target AND d.isis_system_id IS NOT NULL \
    RETURN d.pk AS pk, count(DISTINCT n) AS degree \
    ORDER BY degree DESC, pk \
    LIMIT 1";

const REACHABLE_CYPHER: &str = "\
    MATCH p = (ref:Device {pk: $ref})-[:ISIS_ADJACENT*1..20]-(d:Device) \
    WHERE ALL(n IN nodes(p) WHERE n.pk <> $target) \
    RETURN DISTINCT d.pk AS pk";

const ALL_ISIS_CYPHER: &str = "\
    MATCH (d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    RETURN d.pk AS pk, d.code AS code";

const NEIGHBORS_CYPHER: &str = "\
    MATCH (t:Device {pk: $pk})-[r:ISIS_ADJACENT]->(n:Device) \
    RETURN n.pk AS pk, n.code AS code, r.metric AS metric \
    ORDER BY pk";

const ALTERNATE_CYPHER: &str = "\
    MATCH (a:Device {pk: $n1}), (b:Device {pk: $n2}) \
    OPTIONAL MATCH p = shortestPath((a)-[:ISIS_ADJACENT*..20]-(b)) \
    WHERE ALL(n IN nodes(p) WHERE n.pk <> $target) \
    RETURN CASE WHEN p IS NULL THEN -1 \
                ELSE reduce(total = 0, r IN relationships(p) | total + r.metric) END AS alt_metric";

const METRO_MEMBERS_CYPHER: &str = "\
    MATCH (m:Metro)<-[:LOCATED_IN]-(d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    RETURN m.pk AS pk, m.code AS code, collect(d.pk) AS device_pks";

const DEVICE_BATCH_CYPHER: &str = "\
    MATCH (d:Device) WHERE d.pk IN $pks \
    OPTIONAL MATCH (d)-[:ISIS_ADJACENT]-(n:Device) \
    WITH d, collect(DISTINCT n) AS neighbors \
    RETURN d.pk AS pk, d.code AS code, size(neighbors) AS neighbor_count, \
           [x IN neighbors WHERE size([(x)-[:ISIS_ADJACENT]-(y:Device) | y]) = 1 | x.code] AS isolated_leaves";

const DEGREE_BATCH_CYPHER: &str = "\
    MATCH (d:Device) WHERE d.pk IN $pks \
    OPTIONAL MATCH (d)-[:ISIS_ADJACENT]-(n:Device) \
    RETURN d.pk AS pk, count(DISTINCT n) AS degree";

const CANDIDATE_PAIRS_CYPHER: &str = "\
    MATCH (off:Device)-[:ISIS_ADJACENT*1..2]-(n:Device) \
    WHERE off.pk IN $offline AND NOT n.pk IN $offline \
    WITH collect(DISTINCT n) AS near \
    UNWIND near AS n1 \
    UNWIND near AS n2 \
    WITH n1, n2 WHERE n1.pk < n2.pk \
    MATCH p = shortestPath((n1)-[:ISIS_ADJACENT*..20]-(n2)) \
    WHERE any(x IN nodes(p) WHERE x.pk IN $offline) \
    RETURN n1.pk AS n1_pk, n1.code AS n1_code, n2.pk AS n2_pk, n2.code AS n2_code, \
           reduce(total = 0, r IN relationships(p) | total + r.metric) AS current_metric, \
           length(p) AS current_hops, \
           [x IN nodes(p) WHERE x.pk IN $offline | x.pk] AS via \
    LIMIT $limit";

const BATCH_ALTERNATE_CYPHER: &str = "\
    MATCH (a:Device {pk: $n1}), (b:Device {pk: $n2}) \
    OPTIONAL MATCH p = shortestPath((a)-[:ISIS_ADJACENT*..20]-(b)) \
    WHERE ALL(n IN nodes(p) WHERE NOT n.pk IN $offline) \
    RETURN CASE WHEN p IS NULL THEN -1 \
                ELSE reduce(total = 0, r IN relationships(p) | total + r.metric) END AS alt_metric, \
           CASE WHEN p IS NULL THEN -1 ELSE length(p) END AS alt_hops";

const OFFLINE_METRO_CYPHER: &str = "\
    MATCH (off:Device)-[:ISIS_ADJACENT]-(n:Device), \
          (off)-[:LOCATED_IN]->(mo:Metro), (n)-[:LOCATED_IN]->(mn:Metro) \
    WHERE off.pk IN $offline AND NOT n.pk IN $offline \
    OPTIONAL MATCH (off)-[:CONNECTS]-(l:Link)-[:CONNECTS]-(n) \
    RETURN mo.pk AS metro_a_pk, mo.code AS metro_a_code, \
           mn.pk AS metro_b_pk, mn.code AS metro_b_code, \
           collect(DISTINCT l.code) AS links";

const LINK_ENDPOINTS_SQL: &str = "\
    SELECT pk, code, side_a_pk, side_z_pk \
    FROM dz_links_current \
    WHERE pk IN ?";

#[derive(Debug, Row, Deserialize)]
struct LinkEndpointRow {
    pk: String,
    code: String,
    side_a_pk: String,
    side_z_pk: String,
}

// ---------------------------------------------------------------------------
// Pure selection logic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub n1: DeviceRef,
    pub n2: DeviceRef,
    pub through_metric: i64,
    pub alt_metric: Option<i64>,
}

/// A pair is affected when no alternate exists or the through-target metric
/// beats the alternate. Sorted by degradation (alt - through) descending,
/// disconnected pairs first, capped at the output limit.
pub fn select_affected_pairs(candidates: Vec<CandidatePair>) -> Vec<NeighborPairImpact> {
    let mut affected: Vec<NeighborPairImpact> = candidates
        .into_iter()
        .filter(|c| match c.alt_metric {
            None => true,
            Some(alt) => c.through_metric < alt,
        })
        .map(|c| NeighborPairImpact {
            disconnected: c.alt_metric.is_none(),
            n1: c.n1,
            n2: c.n2,
            through_metric: c.through_metric,
            alt_metric: c.alt_metric,
        })
        .collect();
    affected.sort_by_key(|p| {
        std::cmp::Reverse(match p.alt_metric {
            None => i64::MAX,
            Some(alt) => alt - p.through_metric,
        })
    });
    affected.truncate(AFFECTED_PATH_LIMIT);
    affected
}

pub fn classify_reroute(
    current_hops: i64,
    current_metric: i64,
    alt: Option<(i64, i64)>,
) -> PathOutcome {
    match alt {
        None => PathOutcome::Disconnected,
        Some((alt_hops, alt_metric)) => {
            if alt_hops - current_hops <= REROUTE_MAX_EXTRA_HOPS
                && alt_metric - current_metric <= REROUTE_MAX_EXTRA_METRIC
            {
                PathOutcome::Rerouted
            } else {
                PathOutcome::Degraded
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ImpactEngine {
    graph: Arc<GraphClient>,
    columnar: ColumnarClient,
}

impl ImpactEngine {
    pub fn new(graph: Arc<GraphClient>, columnar: ColumnarClient) -> Self {
        Self { graph, columnar }
    }

    pub async fn failure_impact(&self, target_pk: &str) -> Result<FailureImpact> {
        if target_pk.is_empty() {
            return Err(FabricError::InvalidArgument("device pk is required".into()));
        }
        let target_records = self
            .graph
            .run_with_retry(
                "impact_target",
                || query(TARGET_CYPHER).param("pk", target_pk),
                &["pk", "code", "isis_system_id"],
            )
            .await?;
        let target_record = target_records.first().ok_or(FabricError::NotFound("device"))?;
        let target = DeviceRef {
            pk: target_record.str("pk"),
            code: target_record.str("code"),
        };

        let all_records = self
            .graph
            .run("impact_all_isis", query(ALL_ISIS_CYPHER), &["pk", "code"])
            .await?;
        let all_devices: HashMap<String, String> = all_records
            .iter()
            .map(|r| (r.str("pk"), r.str("code")))
            .collect();

        let reference = self
            .graph
            .run(
                "impact_reference",
                query(REFERENCE_CYPHER).param("target", target_pk),
                &["pk", "degree"],
            )
            .await?
            .first()
            .map(|r| r.str("pk"));

        let mut unreachable: Vec<DeviceRef> = Vec::new();
        if let Some(reference_pk) = &reference {
            let reachable_records = self
                .graph
                .run(
                    "impact_reachable",
                    query(REACHABLE_CYPHER)
                        .param("ref", reference_pk.as_str())
                        .param("target", target_pk),
                    &["pk"],
                )
                .await?;
            let reachable: HashSet<String> =
                reachable_records.iter().map(|r| r.str("pk")).collect();
            for (pk, code) in &all_devices {
                if pk == target_pk || pk == reference_pk || reachable.contains(pk) {
                    continue;
                }
                unreachable.push(DeviceRef {
                    pk: pk.clone(),
                    code: code.clone(),
                });
            }
            unreachable.sort_by(|a, b| a.code.cmp(&b.code));
        }

        let mut error = None;

        let affected_paths = match self.neighbor_pair_impacts(target_pk).await {
            Ok(pairs) => pairs,
            Err(err) => {
                warn!(target = target_pk, %err, "affected-path analysis failed");
                error = Some("affected-path analysis unavailable".to_string());
                Vec::new()
            }
        };

        let metro_impact = match self.metro_impacts(target_pk, &unreachable).await {
            Ok(metros) => metros,
            Err(err) => {
                warn!(target = target_pk, %err, "metro impact analysis failed");
                error.get_or_insert_with(|| "metro impact unavailable".to_string());
                Vec::new()
            }
        };

        Ok(FailureImpact {
            device: target,
            unreachable_devices: unreachable,
            affected_paths,
            metro_impact,
            error,
        })
    }

    async fn neighbor_pair_impacts(&self, target_pk: &str) -> Result<Vec<NeighborPairImpact>> {
        let neighbor_records = self
            .graph
            .run(
                "impact_neighbors",
                query(NEIGHBORS_CYPHER).param("pk", target_pk),
                &["pk", "code", "metric"],
            )
            .await?;
        let neighbors: Vec<(DeviceRef, i64)> = neighbor_records
            .iter()
            .map(|r| {
                (
                    DeviceRef {
                        pk: r.str("pk"),
                        code: r.str("code"),
                    },
                    r.i64("metric"),
                )
            })
            .collect();

        let mut candidates = Vec::new();
        for i in 0..neighbors.len() {
            for j in (i + 1)..neighbors.len() {
                let (n1, m1) = &neighbors[i];
                let (n2, m2) = &neighbors[j];
                let alt = self
                    .graph
                    .run(
                        "impact_alternate",
                        query(ALTERNATE_CYPHER)
                            .param("n1", n1.pk.as_str())
                            .param("n2", n2.pk.as_str())
                            .param("target", target_pk),
                        &["alt_metric"],
                    )
                    .await;
                let alt_metric = match alt {
                    Ok(records) => {
                        let raw = records.first().map(|r| r.i64("alt_metric")).unwrap_or(-1);
                        if raw < 0 {
                            None
                        } else {
                            Some(raw)
                        }
                    }
                    Err(err) => {
                        warn!(n1 = %n1.pk, n2 = %n2.pk, %err, "alternate path query failed");
                        continue;
                    }
                };
                candidates.push(CandidatePair {
                    n1: n1.clone(),
                    n2: n2.clone(),
                    through_metric: m1 + m2,
                    alt_metric,
                });
            }
        }
        Ok(select_affected_pairs(candidates))
    }

    async fn metro_impacts(
        &self,
        target_pk: &str,
        unreachable: &[DeviceRef],
    ) -> Result<Vec<MetroImpact>> {
        let records = self
            .graph
            .run(
                "impact_metros",
                query(METRO_MEMBERS_CYPHER),
                &["pk", "code", "device_pks"],
            )
            .await?;
        let isolated: HashSet<&str> = unreachable
            .iter()
            .map(|d| d.pk.as_str())
            .chain(std::iter::once(target_pk))
            .collect();
        let mut impacts = Vec::new();
        for record in &records {
            let members = record.str_list("device_pks");
            let isolated_count = members
                .iter()
                .filter(|pk| isolated.contains(pk.as_str()))
                .count();
            if isolated_count == 0 {
                continue;
            }
            impacts.push(MetroImpact {
                metro_pk: record.str("pk"),
                metro_code: record.str("code"),
                total_devices: members.len(),
                isolated_devices: isolated_count,
            });
        }
        impacts.sort_by(|a, b| b.isolated_devices.cmp(&a.isolated_devices));
        Ok(impacts)
    }

    pub async fn maintenance_impact(
        &self,
        request: &MaintenanceRequest,
    ) -> Result<MaintenanceImpact> {
        if request.devices.is_empty() && request.links.is_empty() {
            return Err(FabricError::InvalidArgument(
                "at least one device or link is required".into(),
            ));
        }

        let mut items = Vec::new();
        let mut offline: Vec<String> = request.devices.clone();

        if !request.devices.is_empty() {
            let records = self
                .graph
                .run_with_retry(
                    "maintenance_devices",
                    || query(DEVICE_BATCH_CYPHER).param("pks", request.devices.clone()),
                    &["pk", "code", "neighbor_count", "isolated_leaves"],
                )
                .await?;
            for record in &records {
                let neighbor_count = record.i64("neighbor_count");
                let isolated_leaves = record.str_list("isolated_leaves");
                items.push(MaintenanceItem {
                    kind: MaintenanceKind::Device,
                    pk: record.str("pk"),
                    code: record.str("code"),
                    neighbor_count,
                    critical: !isolated_leaves.is_empty(),
                    isolated_leaves,
                    impact: neighbor_count * neighbor_count,
                });
            }
        }

        if !request.links.is_empty() {
            let endpoint_rows = self
                .columnar
                .fetch_all::<LinkEndpointRow>(
                    "maintenance_link_endpoints",
                    self.columnar
                        .query(LINK_ENDPOINTS_SQL)
                        .bind(&request.links),
                )
                .await?;
            let mut endpoint_pks: Vec<String> = Vec::new();
            for row in &endpoint_rows {
                endpoint_pks.push(row.side_a_pk.clone());
                endpoint_pks.push(row.side_z_pk.clone());
            }
            endpoint_pks.sort();
            endpoint_pks.dedup();

            let degree_records = self
                .graph
                .run_with_retry(
                    "maintenance_degrees",
                    || query(DEGREE_BATCH_CYPHER).param("pks", endpoint_pks.clone()),
                    &["pk", "degree"],
                )
                .await?;
            let degrees: HashMap<String, i64> = degree_records
                .iter()
                .map(|r| (r.str("pk"), r.i64("degree")))
                .collect();

            for row in endpoint_rows {
                let deg_a = degrees.get(&row.side_a_pk).copied().unwrap_or(0);
                let deg_z = degrees.get(&row.side_z_pk).copied().unwrap_or(0);
                items.push(MaintenanceItem {
                    kind: MaintenanceKind::Link,
                    pk: row.pk,
                    code: row.code,
                    neighbor_count: deg_a.min(deg_z),
                    critical: deg_a <= 1 || deg_z <= 1,
                    isolated_leaves: Vec::new(),
                    impact: (deg_a - 1).max(0) * (deg_z - 1).max(0),
                });
            }
        }

        let mut error = None;
        let mut affected_paths = Vec::new();
        if !offline.is_empty() {
            offline.sort();
            offline.dedup();
            match self.affected_paths_batch(&offline).await {
                Ok(paths) => affected_paths = paths,
                Err(err) => {
                    warn!(%err, "maintenance affected-path analysis failed");
                    error = Some("affected-path analysis unavailable".to_string());
                }
            }
        }

        // device impact estimates are replaced by the observed affected-path
        // count, capped per device
        if !affected_paths.is_empty() {
            let mut involvement: HashMap<&str, i64> = HashMap::new();
            for path in &affected_paths {
                for device in &path.via {
                    *involvement.entry(device.as_str()).or_insert(0) += 1;
                }
            }
            for item in items
                .iter_mut()
                .filter(|i| i.kind == MaintenanceKind::Device)
            {
                if let Some(&count) = involvement.get(item.pk.as_str()) {
                    item.impact = count.min(10);
                }
            }
        }

        let affected_metros = if offline.is_empty() {
            Vec::new()
        } else {
            match self.affected_metros(&offline).await {
                Ok(metros) => metros,
                Err(err) => {
                    warn!(%err, "maintenance metro grouping failed");
                    error.get_or_insert_with(|| "affected-metro analysis unavailable".to_string());
                    Vec::new()
                }
            }
        };

        let mut order: Vec<(i64, String)> =
            items.iter().map(|i| (i.impact, i.pk.clone())).collect();
        order.sort();
        let recommended_order = order.into_iter().map(|(_, pk)| pk).collect();

        Ok(MaintenanceImpact {
            items,
            affected_paths,
            affected_metros,
            recommended_order,
            error,
        })
    }

    async fn affected_paths_batch(&self, offline: &[String]) -> Result<Vec<AffectedPath>> {
        let candidate_records = self
            .graph
            .run(
                "maintenance_candidates",
                query(CANDIDATE_PAIRS_CYPHER)
                    .param("offline", offline.to_vec())
                    .param("limit", (AFFECTED_PATH_LIMIT * 2) as i64),
                &[
                    "n1_pk",
                    "n1_code",
                    "n2_pk",
                    "n2_code",
                    "current_metric",
                    "current_hops",
                    "via",
                ],
            )
            .await?;

        let mut affected = Vec::new();
        for record in &candidate_records {
            if affected.len() >= AFFECTED_PATH_LIMIT {
                break;
            }
            let n1 = DeviceRef {
                pk: record.str("n1_pk"),
                code: record.str("n1_code"),
            };
            let n2 = DeviceRef {
                pk: record.str("n2_pk"),
                code: record.str("n2_code"),
            };
            let current_metric = record.i64("current_metric");
            let current_hops = record.i64("current_hops");
            let alt_records = self
                .graph
                .run(
                    "maintenance_alternate",
                    query(BATCH_ALTERNATE_CYPHER)
                        .param("n1", n1.pk.as_str())
                        .param("n2", n2.pk.as_str())
                        .param("offline", offline.to_vec()),
                    &["alt_metric", "alt_hops"],
                )
                .await?;
            let (alt_metric, alt_hops) = alt_records
                .first()
                .map(|r| (r.i64("alt_metric"), r.i64("alt_hops")))
                .unwrap_or((-1, -1));
            let alt = if alt_metric < 0 {
                None
            } else {
                Some((alt_hops, alt_metric))
            };
            let outcome = classify_reroute(current_hops, current_metric, alt);
            affected.push(AffectedPath {
                n1,
                n2,
                current_metric,
                current_hops,
                alt_metric: alt.map(|(_, m)| m),
                alt_hops: alt.map(|(h, _)| h),
                outcome,
                via: record.str_list("via"),
            });
        }
        Ok(affected)
    }

    async fn affected_metros(&self, offline: &[String]) -> Result<Vec<AffectedMetroPair>> {
        let records = self
            .graph
            .run(
                "maintenance_metros",
                query(OFFLINE_METRO_CYPHER).param("offline", offline.to_vec()),
                &[
                    "metro_a_pk",
                    "metro_a_code",
                    "metro_b_pk",
                    "metro_b_code",
                    "links",
                ],
            )
            .await?;
        let mut grouped: HashMap<(String, String), AffectedMetroPair> = HashMap::new();
        for record in &records {
            let mut a = (record.str("metro_a_pk"), record.str("metro_a_code"));
            let mut b = (record.str("metro_b_pk"), record.str("metro_b_code"));
            if a.0 > b.0 {
                std::mem::swap(&mut a, &mut b);
            }
            let entry = grouped
                .entry((a.0.clone(), b.0.clone()))
                .or_insert_with(|| AffectedMetroPair {
                    metro_a_pk: a.0,
                    metro_a_code: a.1,
                    metro_b_pk: b.0,
                    metro_b_code: b.1,
                    links: Vec::new(),
                    status: "at_risk".to_string(),
                });
            for link in record.str_list("links") {
                if !entry.links.contains(&link) {
                    entry.links.push(link);
                }
            }
        }
        let mut metros: Vec<AffectedMetroPair> = grouped.into_values().collect();
        metros.sort_by(|a, b| {
            (&a.metro_a_code, &a.metro_b_code).cmp(&(&b.metro_a_code, &b.metro_b_code))
        });
        metros.truncate(AFFECTED_METRO_LIMIT);
        for metro in &mut metros {
            metro.links.sort();
        }
        Ok(metros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(pk: &str) -> DeviceRef {
        DeviceRef {
            pk: pk.into(),
            code: pk.to_uppercase(),
        }
    }

    #[test]
    fn affected_pair_selection_and_ordering() {
        let candidates = vec![
            // through 30 vs alt 50: degradation 20
            CandidatePair {
                n1: dev("a"),
                n2: dev("b"),
                through_metric: 30,
                alt_metric: Some(50),
            },
            // through 30 vs alt 130: degradation 100, listed first
            CandidatePair {
                n1: dev("c"),
                n2: dev("d"),
                through_metric: 30,
                alt_metric: Some(130),
            },
            // alternate is cheaper, excluded
            CandidatePair {
                n1: dev("e"),
                n2: dev("f"),
                through_metric: 90,
                alt_metric: Some(40),
            },
        ];
        let affected = select_affected_pairs(candidates);
        assert_eq!(affected.len(), 2);
        assert_eq!(affected[0].n1.pk, "c");
        assert_eq!(affected[1].n1.pk, "a");
    }

    #[test]
    fn disconnected_pairs_sort_first() {
        let candidates = vec![
            CandidatePair {
                n1: dev("a"),
                n2: dev("b"),
                through_metric: 10,
                alt_metric: Some(1000),
            },
            CandidatePair {
                n1: dev("x"),
                n2: dev("y"),
                through_metric: 10,
                alt_metric: None,
            },
        ];
        let affected = select_affected_pairs(candidates);
        assert!(affected[0].disconnected);
        assert_eq!(affected[0].n1.pk, "x");
    }

    #[test]
    fn selection_caps_output() {
        let candidates: Vec<CandidatePair> = (0..100)
            .map(|i| CandidatePair {
                n1: dev(&format!("a{i}")),
                n2: dev(&format!("b{i}")),
                through_metric: 10,
                alt_metric: None,
            })
            .collect();
        assert_eq!(select_affected_pairs(candidates).len(), AFFECTED_PATH_LIMIT);
    }

    #[test]
    fn reroute_classification_bounds() {
        assert_eq!(classify_reroute(3, 30, None), PathOutcome::Disconnected);
        assert_eq!(
            classify_reroute(3, 30, Some((5, 80))),
            PathOutcome::Rerouted
        );
        assert_eq!(
            classify_reroute(3, 30, Some((6, 40))),
            PathOutcome::Degraded
        );
        assert_eq!(
            classify_reroute(3, 30, Some((4, 81))),
            PathOutcome::Degraded
        );
    }
}
