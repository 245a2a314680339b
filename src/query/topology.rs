//! Topology document assembly and graph-versus-columnar inventory
//! reconciliation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use clickhouse::Row;
use neo4rs::query;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::columnar::ColumnarClient;
use crate::error::Result;
use crate::graph::GraphClient;

#[derive(Debug, Clone, Serialize)]
pub struct TopologyNode {
    pub pk: String,
    pub code: String,
    pub status: String,
    pub device_type: String,
    pub isis_system_id: String,
    pub isis_router_id: String,
    pub metro: String,
}

/// One undirected adjacency; metrics kept per direction.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyEdge {
    pub a_pk: String,
    pub b_pk: String,
    pub metric_ab: i64,
    pub metric_ba: i64,
    pub neighbor_addr: String,
    pub adj_sids: Vec<u32>,
    pub bandwidth_bps: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetroNodeCount {
    pub metro: String,
    pub devices: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyDocument {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
    pub node_count: usize,
    pub edge_count: usize,
    pub metros: Vec<MetroNodeCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInGraph,
    MissingInColumnar,
    EndpointMismatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub entity: &'static str,
    pub pk: String,
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareReport {
    pub discrepancies: Vec<Discrepancy>,
    pub graph_devices: usize,
    pub columnar_devices: usize,
    pub graph_links: usize,
    pub columnar_links: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const NODES_CYPHER: &str = "\
    MATCH (d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    OPTIONAL MATCH (d)-[:LOCATED_IN]->(m:Metro) \
    RETURN d.pk AS pk, d.code AS code, d.status AS status, d.device_type AS device_type, \
           d.isis_system_id AS isis_system_id, d.isis_router_id AS isis_router_id, \
           m.code AS metro \
    ORDER BY code";

const EDGES_CYPHER: &str = "\
    MATCH (a:Device)-[r:ISIS_ADJACENT]->(b:Device) \
    RETURN a.pk AS from_pk, b.pk AS to_pk, r.metric AS metric, \
           r.neighbor_addr AS neighbor_addr, r.adj_sids AS adj_sids, \
           r.bandwidth_bps AS bandwidth_bps";

const GRAPH_DEVICES_CYPHER: &str = "\
    MATCH (d:Device) RETURN d.pk AS pk, d.code AS code";

const GRAPH_LINKS_CYPHER: &str = "\
    MATCH (l:Link) \
    OPTIONAL MATCH (d:Device)-[:CONNECTS]-(l) \
    RETURN l.pk AS pk, l.code AS code, collect(d.pk) AS endpoints";

const COLUMNAR_DEVICES_SQL: &str = "SELECT pk, code FROM dz_devices_current";
const COLUMNAR_LINKS_SQL: &str =
    "SELECT pk, code, side_a_pk, side_z_pk FROM dz_links_current";

#[derive(Debug, Row, Deserialize)]
struct InventoryRow {
    pk: String,
    code: String,
}

#[derive(Debug, Row, Deserialize)]
struct LinkInventoryRow {
    pk: String,
    code: String,
    side_a_pk: String,
    side_z_pk: String,
}

/// Directed edge as returned by the store.
#[derive(Debug, Clone)]
pub struct DirectedEdge {
    pub from_pk: String,
    pub to_pk: String,
    pub metric: i64,
    pub neighbor_addr: String,
    pub adj_sids: Vec<u32>,
    pub bandwidth_bps: i64,
}

/// Collapses the two directed representations of each adjacency into one
/// edge per unordered pair, keeping both directions' metrics.
pub fn collapse_edges(directed: Vec<DirectedEdge>) -> Vec<TopologyEdge> {
    let mut merged: BTreeMap<(String, String), TopologyEdge> = BTreeMap::new();
    for edge in directed {
        let forward = edge.from_pk <= edge.to_pk;
        let key = if forward {
            (edge.from_pk.clone(), edge.to_pk.clone())
        } else {
            (edge.to_pk.clone(), edge.from_pk.clone())
        };
        let entry = merged.entry(key.clone()).or_insert_with(|| TopologyEdge {
            a_pk: key.0,
            b_pk: key.1,
            metric_ab: 0,
            metric_ba: 0,
            neighbor_addr: String::new(),
            adj_sids: Vec::new(),
            bandwidth_bps: 0,
        });
        if forward {
            entry.metric_ab = edge.metric;
        } else {
            entry.metric_ba = edge.metric;
        }
        if entry.neighbor_addr.is_empty() {
            entry.neighbor_addr = edge.neighbor_addr;
        }
        if entry.adj_sids.is_empty() {
            entry.adj_sids = edge.adj_sids;
        }
        if entry.bandwidth_bps == 0 {
            entry.bandwidth_bps = edge.bandwidth_bps;
        }
    }
    merged.into_values().collect()
}

pub struct TopologyEngine {
    graph: Arc<GraphClient>,
    columnar: ColumnarClient,
}

impl TopologyEngine {
    pub fn new(graph: Arc<GraphClient>, columnar: ColumnarClient) -> Self {
        Self { graph, columnar }
    }

    pub async fn topology(&self) -> Result<TopologyDocument> {
        let node_records = self
            .graph
            .run_with_retry(
                "topology_nodes",
                || query(NODES_CYPHER),
                &[
                    "pk",
                    "code",
                    "status",
                    "device_type",
                    "isis_system_id",
                    "isis_router_id",
                    "metro",
                ],
            )
            .await?;
        let nodes: Vec<TopologyNode> = node_records
            .iter()
            .map(|r| TopologyNode {
                pk: r.str("pk"),
                code: r.str("code"),
                status: r.str("status"),
                device_type: r.str("device_type"),
                isis_system_id: r.str("isis_system_id"),
                isis_router_id: r.str("isis_router_id"),
                metro: r.str("metro"),
            })
            .collect();

        let edge_records = self
            .graph
            .run_with_retry(
                "topology_edges",
                || query(EDGES_CYPHER),
                &[
                    "from_pk",
                    "to_pk",
                    "metric",
                    "neighbor_addr",
                    "adj_sids",
                    "bandwidth_bps",
                ],
            )
            .await?;
        let directed: Vec<DirectedEdge> = edge_records
            .iter()
            .map(|r| DirectedEdge {
                from_pk: r.str("from_pk"),
                to_pk: r.str("to_pk"),
                metric: r.i64("metric"),
                neighbor_addr: r.str("neighbor_addr"),
                adj_sids: r.u32_list("adj_sids"),
                bandwidth_bps: r.i64("bandwidth_bps"),
            })
            .collect();
        let edges = collapse_edges(directed);

        let mut metro_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in &nodes {
            if !node.metro.is_empty() {
                *metro_counts.entry(node.metro.clone()).or_insert(0) += 1;
            }
        }

        Ok(TopologyDocument {
            node_count: nodes.len(),
            edge_count: edges.len(),
            metros: metro_counts
                .into_iter()
                .map(|(metro, devices)| MetroNodeCount { metro, devices })
                .collect(),
            nodes,
            edges,
        })
    }

    pub async fn compare(&self) -> Result<CompareReport> {
        let mut error = None;

        let graph_devices: HashMap<String, String> = match self
            .graph
            .run("compare_graph_devices", query(GRAPH_DEVICES_CYPHER), &["pk", "code"])
            .await
        {
            Ok(records) => records.iter().map(|r| (r.str("pk"), r.str("code"))).collect(),
            Err(err) => {
                warn!(%err, "graph device inventory unavailable");
                error = Some("graph inventory unavailable".to_string());
                HashMap::new()
            }
        };

        let graph_links: HashMap<String, (String, HashSet<String>)> = match self
            .graph
            .run(
                "compare_graph_links",
                query(GRAPH_LINKS_CYPHER),
                &["pk", "code", "endpoints"],
            )
            .await
        {
            Ok(records) => records
                .iter()
                .map(|r| {
                    (
                        r.str("pk"),
                        (r.str("code"), r.str_list("endpoints").into_iter().collect()),
                    )
                })
                .collect(),
            Err(err) => {
                warn!(%err, "graph link inventory unavailable");
                error.get_or_insert_with(|| "graph inventory unavailable".to_string());
                HashMap::new()
            }
        };

        let columnar_devices = self
            .columnar
            .fetch_all::<InventoryRow>(
                "compare_columnar_devices",
                self.columnar.query(COLUMNAR_DEVICES_SQL),
            )
            .await?;
        let columnar_links = self
            .columnar
            .fetch_all::<LinkInventoryRow>(
                "compare_columnar_links",
                self.columnar.query(COLUMNAR_LINKS_SQL),
            )
            .await?;

        let mut discrepancies = Vec::new();
        let columnar_device_pks: HashSet<&str> =
            columnar_devices.iter().map(|d| d.pk.as_str()).collect();

        if !graph_devices.is_empty() {
            for device in &columnar_devices {
                if !graph_devices.contains_key(&device.pk) {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::MissingInGraph,
                        entity: "device",
                        pk: device.pk.clone(),
                        code: device.code.clone(),
                        detail: "device present in snapshot but absent from topology".into(),
                    });
                }
            }
            for (pk, code) in &graph_devices {
                if !columnar_device_pks.contains(pk.as_str()) {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::MissingInColumnar,
                        entity: "device",
                        pk: pk.clone(),
                        code: code.clone(),
                        detail: "device present in topology but absent from snapshot".into(),
                    });
                }
            }
        }

        if !graph_links.is_empty() {
            let columnar_link_pks: HashSet<&str> =
                columnar_links.iter().map(|l| l.pk.as_str()).collect();
            for link in &columnar_links {
                match graph_links.get(&link.pk) {
                    None => discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::MissingInGraph,
                        entity: "link",
                        pk: link.pk.clone(),
                        code: link.code.clone(),
                        detail: "link present in snapshot but absent from topology".into(),
                    }),
                    Some((_, endpoints)) => {
                        let expected: HashSet<String> =
                            [link.side_a_pk.clone(), link.side_z_pk.clone()]
                                .into_iter()
                                .collect();
                        if *endpoints != expected {
                            discrepancies.push(Discrepancy {
                                kind: DiscrepancyKind::EndpointMismatch,
                                entity: "link",
                                pk: link.pk.clone(),
                                code: link.code.clone(),
                                detail: format!(
                                    "snapshot endpoints {:?} differ from topology {:?}",
                                    expected, endpoints
                                ),
                            });
                        }
                    }
                }
            }
            for (pk, (code, _)) in &graph_links {
                if !columnar_link_pks.contains(pk.as_str()) {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::MissingInColumnar,
                        entity: "link",
                        pk: pk.clone(),
                        code: code.clone(),
                        detail: "link present in topology but absent from snapshot".into(),
                    });
                }
            }
        }

        discrepancies.sort_by(|a, b| (a.entity, &a.code).cmp(&(b.entity, &b.code)));

        Ok(CompareReport {
            graph_devices: graph_devices.len(),
            columnar_devices: columnar_devices.len(),
            graph_links: graph_links.len(),
            columnar_links: columnar_links.len(),
            discrepancies,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directed(from: &str, to: &str, metric: i64) -> DirectedEdge {
        DirectedEdge {
            from_pk: from.into(),
            to_pk: to.into(),
            metric,
            neighbor_addr: format!("fe80::{from}"),
            adj_sids: vec![16001],
            bandwidth_bps: 10_000_000_000,
        }
    }

    #[test]
    fn collapse_keeps_both_direction_metrics() {
        let edges = collapse_edges(vec![
            directed("a", "b", 10),
            directed("b", "a", 12),
            directed("a", "c", 5),
        ]);
        assert_eq!(edges.len(), 2);
        let ab = edges.iter().find(|e| e.b_pk == "b").unwrap();
        assert_eq!(ab.metric_ab, 10);
        assert_eq!(ab.metric_ba, 12);
        let ac = edges.iter().find(|e| e.b_pk == "c").unwrap();
        assert_eq!(ac.metric_ab, 5);
        assert_eq!(ac.metric_ba, 0);
    }

    #[test]
    fn collapse_is_deterministic() {
        let a = collapse_edges(vec![directed("a", "b", 10), directed("b", "a", 12)]);
        let b = collapse_edges(vec![directed("b", "a", 12), directed("a", "b", 10)]);
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].a_pk, b[0].a_pk);
        assert_eq!(a[0].metric_ab, b[0].metric_ab);
    }
}
