//! Critical-link classification and the redundancy report: leaf devices,
//! critical links and single-exit metros, rolled up into one issue list.

use std::sync::Arc;

use neo4rs::query;
use serde::Serialize;

use crate::error::Result;
use crate::graph::GraphClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    Critical,
    Important,
    Redundant,
}

/// Classification by the weaker endpoint's IS-IS degree.
pub fn classify_link(min_degree: i64) -> LinkClass {
    if min_degree <= 1 {
        LinkClass::Critical
    } else if min_degree == 2 {
        LinkClass::Important
    } else {
        LinkClass::Redundant
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkCriticality {
    pub pk: String,
    pub code: String,
    pub side_a_pk: String,
    pub side_a_code: String,
    pub side_a_degree: i64,
    pub side_z_pk: String,
    pub side_z_code: String,
    pub side_z_degree: i64,
    pub class: LinkClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    LeafDevice,
    CriticalLink,
    SingleExitMetro,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedundancyIssue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub entity_pk: String,
    pub entity_code: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RedundancySummary {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    pub leaf_devices: usize,
    pub critical_links: usize,
    pub single_exit_metros: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedundancyReport {
    pub issues: Vec<RedundancyIssue>,
    pub summary: RedundancySummary,
}

const LINK_DEGREES_CYPHER: &str = "\
    MATCH (a:Device)-[:CONNECTS]-(l:Link)-[:CONNECTS]-(b:Device) \
    WHERE a.pk < b.pk \
    WITH l, a, b, \
         size([(a)-[:ISIS_ADJACENT]-(x:Device) | x]) AS deg_a, \
         size([(b)-[:ISIS_ADJACENT]-(y:Device) | y]) AS deg_b \
    RETURN l.pk AS pk, l.code AS code, \
           a.pk AS side_a_pk, a.code AS side_a_code, deg_a, \
           b.pk AS side_z_pk, b.code AS side_z_code, deg_b \
    ORDER BY code";

const LEAF_DEVICES_CYPHER: &str = "\
    MATCH (d:Device)-[:ISIS_ADJACENT]-(n:Device) \
    WITH d, count(DISTINCT n) AS degree \
    WHERE degree = 1 \
    RETURN d.pk AS pk, d.code AS code \
    ORDER BY code";

const SINGLE_EXIT_METROS_CYPHER: &str = "\
    MATCH (m:Metro)<-[:LOCATED_IN]-(d:Device) \
    WHERE d.isis_system_id IS NOT NULL \
    OPTIONAL MATCH (d)-[:ISIS_ADJACENT]-(:Device)-[:LOCATED_IN]->(other:Metro) \
    WHERE other.pk <> m.pk \
    WITH m, d, count(other) AS external \
    WITH m, sum(CASE WHEN external > 0 THEN 1 ELSE 0 END) AS exit_devices, count(d) AS total_devices \
    WHERE exit_devices = 1 \
    RETURN m.pk AS pk, m.code AS code, total_devices \
    ORDER BY code";

pub struct RedundancyEngine {
    graph: Arc<GraphClient>,
}

impl RedundancyEngine {
    pub fn new(graph: Arc<GraphClient>) -> Self {
        Self { graph }
    }

    pub async fn critical_links(&self) -> Result<Vec<LinkCriticality>> {
        let records = self
            .graph
            .run_with_retry(
                "critical_links",
                || query(LINK_DEGREES_CYPHER),
                &[
                    "pk",
                    "code",
                    "side_a_pk",
                    "side_a_code",
                    "deg_a",
                    "side_z_pk",
                    "side_z_code",
                    "deg_b",
                ],
            )
            .await?;
        let mut links: Vec<LinkCriticality> = records
            .iter()
            .map(|r| {
                let deg_a = r.i64("deg_a");
                let deg_b = r.i64("deg_b");
                LinkCriticality {
                    pk: r.str("pk"),
                    code: r.str("code"),
                    side_a_pk: r.str("side_a_pk"),
                    side_a_code: r.str("side_a_code"),
                    side_a_degree: deg_a,
                    side_z_pk: r.str("side_z_pk"),
                    side_z_code: r.str("side_z_code"),
                    side_z_degree: deg_b,
                    class: classify_link(deg_a.min(deg_b)),
                }
            })
            .collect();
        links.sort_by(|a, b| {
            link_class_rank(a.class)
                .cmp(&link_class_rank(b.class))
                .then(a.code.cmp(&b.code))
        });
        Ok(links)
    }

    pub async fn report(&self) -> Result<RedundancyReport> {
        let mut issues = Vec::new();
        let mut summary = RedundancySummary::default();

        let leaves = self
            .graph
            .run_with_retry("redundancy_leaves", || query(LEAF_DEVICES_CYPHER), &["pk", "code"])
            .await?;
        for record in &leaves {
            let code = record.str("code");
            issues.push(RedundancyIssue {
                kind: IssueKind::LeafDevice,
                severity: IssueSeverity::Critical,
                entity_pk: record.str("pk"),
                title: format!("device {code} has a single IS-IS adjacency"),
                entity_code: code,
            });
        }
        summary.leaf_devices = leaves.len();

        let links = self.critical_links().await?;
        for link in &links {
            if link.class != LinkClass::Critical {
                continue;
            }
            summary.critical_links += 1;
            issues.push(RedundancyIssue {
                kind: IssueKind::CriticalLink,
                severity: IssueSeverity::Critical,
                entity_pk: link.pk.clone(),
                entity_code: link.code.clone(),
                title: format!(
                    "link {} is the only path for {}",
                    link.code,
                    if link.side_a_degree <= link.side_z_degree {
                        &link.side_a_code
                    } else {
                        &link.side_z_code
                    }
                ),
            });
        }

        let metros = self
            .graph
            .run_with_retry(
                "redundancy_single_exit",
                || query(SINGLE_EXIT_METROS_CYPHER),
                &["pk", "code", "total_devices"],
            )
            .await?;
        for record in &metros {
            let code = record.str("code");
            issues.push(RedundancyIssue {
                kind: IssueKind::SingleExitMetro,
                severity: IssueSeverity::Warning,
                entity_pk: record.str("pk"),
                title: format!("metro {code} has a single exit device"),
                entity_code: code,
            });
        }
        summary.single_exit_metros = metros.len();

        for issue in &issues {
            match issue.severity {
                IssueSeverity::Critical => summary.critical += 1,
                IssueSeverity::Warning => summary.warning += 1,
                IssueSeverity::Info => summary.info += 1,
            }
        }

        issues.sort_by_key(|i| severity_rank(i.severity));
        Ok(RedundancyReport { issues, summary })
    }
}

fn severity_rank(severity: IssueSeverity) -> u8 {
    match severity {
        IssueSeverity::Critical => 0,
        IssueSeverity::Warning => 1,
        IssueSeverity::Info => 2,
    }
}

fn link_class_rank(class: LinkClass) -> u8 {
    match class {
        LinkClass::Critical => 0,
        LinkClass::Important => 1,
        LinkClass::Redundant => 2,
    }
}
