//! Parameterized graph queries returning dynamically typed record sequences.
//!
//! Every call is scoped to its own driver session and carries a deadline.
//! Raw driver errors are logged under the query name; callers only ever see
//! the translated user-safe message.

use std::time::{Duration, Instant};

use neo4rs::{Graph, Query};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use crate::config::GraphConfig;
use crate::error::{translate_graph_error, FabricError, Result};
use crate::graph::retry::{retry_read, RetryPolicy};
use crate::graph::value;
use crate::metrics;

/// One returned record, columns coerced to dynamic values.
#[derive(Debug, Clone, Default)]
pub struct GraphRecord {
    columns: FxHashMap<String, Value>,
}

impl GraphRecord {
    pub fn from_columns(columns: FxHashMap<String, Value>) -> Self {
        Self { columns }
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    pub fn str(&self, key: &str) -> String {
        value::as_str(self.raw(key))
    }

    pub fn opt_str(&self, key: &str) -> Option<String> {
        value::as_opt_str(self.raw(key))
    }

    pub fn i64(&self, key: &str) -> i64 {
        value::as_i64(self.raw(key))
    }

    pub fn f64(&self, key: &str) -> f64 {
        value::as_f64(self.raw(key))
    }

    pub fn bool(&self, key: &str) -> bool {
        value::as_bool(self.raw(key))
    }

    pub fn u32_list(&self, key: &str) -> Vec<u32> {
        value::as_u32_list(self.raw(key))
    }

    pub fn str_list(&self, key: &str) -> Vec<String> {
        value::as_str_list(self.raw(key))
    }

    pub fn hops(&self, key: &str) -> Vec<value::RawHop> {
        value::parse_hops(self.raw(key))
    }
}

pub struct GraphClient {
    graph: Graph,
    query_timeout: Duration,
    retry: RetryPolicy,
}

impl GraphClient {
    pub async fn connect(config: &GraphConfig) -> Result<Self> {
        let graph = Graph::new(
            config.uri.as_str(),
            config.user.as_str(),
            config.password.as_str(),
        )
        .await
            .map_err(|err| {
                let (message, transient) = translate_graph_error(&err);
                warn!(uri = %config.uri, %err, "graph connect failed");
                FabricError::Graph { message, transient }
            })?;
        Ok(Self {
            graph,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            retry: RetryPolicy::default(),
        })
    }

    /// Runs one parameterized query and collects the named columns of every
    /// record. Columns that fail to coerce come back as `Null` rather than
    /// failing the record.
    pub async fn run(
        &self,
        name: &'static str,
        query: Query,
        columns: &[&str],
    ) -> Result<Vec<GraphRecord>> {
        self.run_with_deadline(name, query, columns, self.query_timeout)
            .await
    }

    /// Same as [`run`] but with an explicit per-call deadline, used by
    /// fan-outs that subdivide a request budget.
    pub async fn run_with_deadline(
        &self,
        name: &'static str,
        query: Query,
        columns: &[&str],
        deadline: Duration,
    ) -> Result<Vec<GraphRecord>> {
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, self.collect(query, columns)).await;
        let elapsed = started.elapsed();
        match result {
            Ok(Ok(records)) => {
                metrics::registry().record(name, elapsed, true);
                Ok(records)
            }
            Ok(Err(err)) => {
                metrics::registry().record(name, elapsed, false);
                let (message, transient) = translate_graph_error(&err);
                warn!(query = name, %err, "graph query failed");
                Err(FabricError::Graph { message, transient })
            }
            Err(_) => {
                metrics::registry().record(name, elapsed, false);
                warn!(query = name, ?deadline, "graph query deadline exceeded");
                Err(FabricError::Deadline(deadline))
            }
        }
    }

    /// Retrying variant for reads where transient failures are expected.
    /// The query is rebuilt per attempt.
    pub async fn run_with_retry<F>(
        &self,
        name: &'static str,
        make_query: F,
        columns: &[&str],
    ) -> Result<Vec<GraphRecord>>
    where
        F: Fn() -> Query,
    {
        retry_read(name, self.retry, || {
            self.run(name, make_query(), columns)
        })
        .await
    }

    pub async fn ping(&self) -> bool {
        self.run("graph_ping", neo4rs::query("RETURN 1 AS ok"), &["ok"])
            .await
            .is_ok()
    }

    async fn collect(
        &self,
        query: Query,
        columns: &[&str],
    ) -> std::result::Result<Vec<GraphRecord>, neo4rs::Error> {
        let mut stream = self.graph.execute(query).await?;
        let mut records = Vec::new();
        while let Some(row) = stream.next().await? {
            let mut map = FxHashMap::default();
            for &column in columns {
                let cell = row.get::<Value>(column).unwrap_or(Value::Null);
                map.insert(column.to_string(), cell);
            }
            records.push(GraphRecord::from_columns(map));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> GraphRecord {
        let mut map = FxHashMap::default();
        for (key, val) in pairs {
            map.insert((*key).to_string(), val.clone());
        }
        GraphRecord::from_columns(map)
    }

    #[test]
    fn record_accessors_zero_on_missing() {
        let rec = record(&[("pk", json!("dev-1")), ("metric", json!(10))]);
        assert_eq!(rec.str("pk"), "dev-1");
        assert_eq!(rec.i64("metric"), 10);
        assert_eq!(rec.str("absent"), "");
        assert_eq!(rec.f64("absent"), 0.0);
        assert_eq!(rec.opt_str("absent"), None);
    }

    #[test]
    fn record_parses_hop_projection() {
        let rec = record(&[(
            "hops",
            json!([{"pk": "a", "code": "A", "status": "activated", "device_type": "switch"}]),
        )]);
        let hops = rec.hops("hops");
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].code, "A");
    }
}
