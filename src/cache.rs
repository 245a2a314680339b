//! Refresh cache for the expensive composites.
//!
//! A timer loop rebuilds each registered composite with its default
//! parameters and swaps the stored `Arc` on success; a failed refresh keeps
//! the previous value in place. Readers clone the `Arc` under a read lock
//! and never block the refresher.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::query::history::{
    BucketSpec, DeviceHistory, HistoryEngine, HistoryRange, HistoryResponse, LinkHistory,
    DEFAULT_BUCKETS,
};
use crate::query::metro::{MetroEngine, MetroPathLatencyEntry};
use crate::query::paths::PathMode;
use crate::query::status::{StatusBuilder, StatusDocument};
use crate::timeline::{TimelineEngine, TimelineParams, TimelineResponse};

/// Default history tuple served from the cache.
pub const DEFAULT_HISTORY_RANGE: HistoryRange = HistoryRange::H24;

pub struct CacheSlot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> Default for CacheSlot<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }
}

impl<T> CacheSlot<T> {
    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write() = Some(Arc::new(value));
    }
}

pub struct KeyedCacheSlot<K, T> {
    inner: RwLock<FxHashMap<K, Arc<T>>>,
}

impl<K, T> Default for KeyedCacheSlot<K, T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<K: std::hash::Hash + Eq, T> KeyedCacheSlot<K, T> {
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        self.inner.read().get(key).cloned()
    }

    pub fn store(&self, key: K, value: T) {
        self.inner.write().insert(key, Arc::new(value));
    }
}

pub type HistoryKey = (HistoryRange, usize);

#[derive(Default)]
pub struct RefreshCache {
    pub status: CacheSlot<StatusDocument>,
    pub link_history: KeyedCacheSlot<HistoryKey, HistoryResponse<LinkHistory>>,
    pub device_history: KeyedCacheSlot<HistoryKey, HistoryResponse<DeviceHistory>>,
    pub timeline: CacheSlot<TimelineResponse>,
    pub metro_path_latency: KeyedCacheSlot<PathMode, Vec<MetroPathLatencyEntry>>,
}

impl RefreshCache {
    pub fn default_history_key() -> HistoryKey {
        (DEFAULT_HISTORY_RANGE, DEFAULT_BUCKETS)
    }
}

pub struct CacheRefresher {
    pub cache: Arc<RefreshCache>,
    pub status: Arc<StatusBuilder>,
    pub history: Arc<HistoryEngine>,
    pub timeline: Arc<TimelineEngine>,
    pub metro: Arc<MetroEngine>,
    pub interval: Duration,
}

impl CacheRefresher {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.refresh_once().await;
            }
        })
    }

    /// One refresh pass over every registered composite. Failures keep the
    /// previous value.
    pub async fn refresh_once(&self) {
        let started = std::time::Instant::now();

        let status = self.status.build().await;
        self.cache.status.store(status);

        let (range, buckets) = RefreshCache::default_history_key();
        let spec = BucketSpec::new(range, buckets);
        match self.history.link_history(spec).await {
            Ok(response) => self.cache.link_history.store((range, buckets), response),
            Err(err) => warn!(%err, "link history refresh failed, serving stale"),
        }
        match self.history.device_history(spec).await {
            Ok(response) => self.cache.device_history.store((range, buckets), response),
            Err(err) => warn!(%err, "device history refresh failed, serving stale"),
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        match self.timeline.build(&TimelineParams::defaults(now)).await {
            Ok(response) => self.cache.timeline.store(response),
            Err(err) => warn!(%err, "timeline refresh failed, serving stale"),
        }

        for mode in [PathMode::Hops, PathMode::Latency] {
            match self.metro.path_latency_matrix(mode).await {
                Ok(entries) => self.cache.metro_path_latency.store(mode, entries),
                Err(err) => {
                    warn!(?mode, %err, "metro path latency refresh failed, serving stale")
                }
            }
        }

        info!(elapsed = ?started.elapsed(), "composite cache refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_replaces_and_never_loses_value() {
        let slot: CacheSlot<u32> = CacheSlot::default();
        assert!(slot.get().is_none());
        slot.store(1);
        let first = slot.get().unwrap();
        slot.store(2);
        // the reader's snapshot is unaffected by the swap
        assert_eq!(*first, 1);
        assert_eq!(*slot.get().unwrap(), 2);
    }

    #[test]
    fn keyed_slot_is_per_parameter_tuple() {
        let slot: KeyedCacheSlot<HistoryKey, u32> = KeyedCacheSlot::default();
        slot.store((HistoryRange::H24, 72), 7);
        assert_eq!(*slot.get(&(HistoryRange::H24, 72)).unwrap(), 7);
        assert!(slot.get(&(HistoryRange::H24, 48)).is_none());
        assert!(slot.get(&(HistoryRange::H1, 72)).is_none());
    }
}
