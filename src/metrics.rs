//! Process-wide query metrics. Every store call records its duration here
//! under the query name; the health endpoint exposes the aggregate view.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueryStats {
    pub calls: u64,
    pub errors: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl QueryStats {
    pub fn avg_micros(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_micros / self.calls
        }
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    queries: Mutex<HashMap<&'static str, QueryStats>>,
}

impl MetricsRegistry {
    pub fn record(&self, name: &'static str, elapsed: Duration, ok: bool) {
        let micros = elapsed.as_micros() as u64;
        let mut queries = self.queries.lock();
        let stats = queries.entry(name).or_default();
        stats.calls += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_micros += micros;
        stats.max_micros = stats.max_micros.max(micros);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, QueryStats> {
        self.queries.lock().clone()
    }
}

/// The single registry shared by both store clients.
pub fn registry() -> &'static MetricsRegistry {
    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates() {
        let registry = MetricsRegistry::default();
        registry.record("q1", Duration::from_micros(100), true);
        registry.record("q1", Duration::from_micros(300), false);
        let snapshot = registry.snapshot();
        let stats = snapshot["q1"];
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.total_micros, 400);
        assert_eq!(stats.max_micros, 300);
        assert_eq!(stats.avg_micros(), 200);
    }
}
