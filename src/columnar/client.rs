//! Thin wrapper over the columnar driver.
//!
//! Queries bind `?` placeholders in order. Ratio and average columns are
//! expected to pass through `ifNotFinite(x, 0)` in SQL; `finite` is the
//! Rust-side guard for arithmetic done after scan.

use std::time::{Duration, Instant};

use clickhouse::{Client, Row, RowOwned};
use serde::Deserialize;
use tracing::warn;

use crate::config::ColumnarConfig;
use crate::error::{FabricError, Result};
use crate::metrics;

/// NaN/Inf coerced to 0; everything downstream treats "no signal" as zero.
pub fn finite(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[derive(Clone)]
pub struct ColumnarClient {
    client: Client,
    query_timeout: Duration,
}

impl ColumnarClient {
    pub fn connect(config: &ColumnarConfig) -> Self {
        let client = Client::default()
            .with_url(config.url.as_str())
            .with_database(config.database.as_str())
            .with_user(config.user.as_str())
            .with_password(config.password.as_str());
        Self {
            client,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        }
    }

    /// Builds a bound query. Callers chain `.bind()` in placeholder order.
    pub fn query(&self, sql: &str) -> clickhouse::query::Query {
        self.client.query(sql)
    }

    pub async fn fetch_all<T>(
        &self,
        name: &'static str,
        query: clickhouse::query::Query,
    ) -> Result<Vec<T>>
    where
        T: Row + RowOwned + for<'b> Deserialize<'b>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.query_timeout, query.fetch_all::<T>()).await;
        self.finish(name, started, result)
    }

    pub async fn fetch_one<T>(
        &self,
        name: &'static str,
        query: clickhouse::query::Query,
    ) -> Result<T>
    where
        T: Row + RowOwned + for<'b> Deserialize<'b>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.query_timeout, query.fetch_one::<T>()).await;
        self.finish(name, started, result)
    }

    pub async fn fetch_optional<T>(
        &self,
        name: &'static str,
        query: clickhouse::query::Query,
    ) -> Result<Option<T>>
    where
        T: Row + RowOwned + for<'b> Deserialize<'b>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.query_timeout, query.fetch_optional::<T>()).await;
        self.finish(name, started, result)
    }

    pub async fn ping(&self) -> bool {
        self.fetch_one::<u8>("columnar_ping", self.client.query("SELECT 1"))
            .await
            .is_ok()
    }

    fn finish<T>(
        &self,
        name: &'static str,
        started: Instant,
        result: std::result::Result<
            std::result::Result<T, clickhouse::error::Error>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<T> {
        let elapsed = started.elapsed();
        match result {
            Ok(Ok(value)) => {
                metrics::registry().record(name, elapsed, true);
                Ok(value)
            }
            Ok(Err(err)) => {
                metrics::registry().record(name, elapsed, false);
                warn!(query = name, %err, "columnar query failed");
                Err(FabricError::Columnar(name.to_string()))
            }
            Err(_) => {
                metrics::registry().record(name, elapsed, false);
                warn!(query = name, timeout = ?self.query_timeout, "columnar query deadline exceeded");
                Err(FabricError::Deadline(self.query_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_coerces_non_finite_to_zero() {
        assert_eq!(finite(f64::NAN), 0.0);
        assert_eq!(finite(f64::INFINITY), 0.0);
        assert_eq!(finite(f64::NEG_INFINITY), 0.0);
        assert_eq!(finite(1.25), 1.25);
        assert_eq!(finite(0.0), 0.0);
    }
}
