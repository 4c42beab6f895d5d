//! Node-to-host clock offset estimation with hysteresis.
//!
//! The offset for a node is computed once and then reused until a fresh
//! skew measurement drifts past `recalc_threshold`. Skews larger than
//! `recalc_max_skew` never replace a stored offset, so a batch with corrupt
//! timestamps cannot poison the cache. Offsets are persisted through an
//! [`OffsetStore`] as a durable fallback across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::OffsetConfig;
use crate::model::{now_unix_nanos, BackfillRow, FieldValue, Point};
use crate::sink::{SeriesFilter, Sink};

/// Durable per-node offset storage.
pub trait OffsetStore: Send + Sync + 'static {
    /// Last persisted offset for the node.
    fn load(&self, node_id: u32)
        -> impl std::future::Future<Output = Result<Option<i64>>> + Send;

    /// Record a new offset for the node.
    fn persist(
        &self,
        node_id: u32,
        offset_ns: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Stores offsets as a dedicated metric series in the sink.
pub struct SinkOffsetStore<S: Sink> {
    sink: Arc<S>,
    measurement: String,
    metric: String,
}

impl<S: Sink> SinkOffsetStore<S> {
    pub fn new(sink: Arc<S>, cfg: &OffsetConfig) -> Self {
        Self {
            sink,
            measurement: cfg.meta_measurement.clone(),
            metric: cfg.metric.clone(),
        }
    }

    fn series(&self, node_id: u32) -> SeriesFilter {
        SeriesFilter::new(self.measurement.as_str())
            .tag("metric", self.metric.as_str())
            .tag("node_id", node_id.to_string())
    }
}

impl<S: Sink> OffsetStore for SinkOffsetStore<S> {
    async fn load(&self, node_id: u32) -> Result<Option<i64>> {
        let v = self.sink.last_value(&self.series(node_id), "value").await?;
        Ok(v.map(FieldValue::as_i64))
    }

    async fn persist(&self, node_id: u32, offset_ns: i64) -> Result<()> {
        let point = Point::new(self.measurement.as_str())
            .tag("node_id", node_id.to_string())
            .tag("metric", self.metric.as_str())
            .field("value", FieldValue::Int(offset_ns))
            .timestamp(now_unix_nanos());

        self.sink.write(&[point]).await
    }
}

/// Result of one offset estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetEstimate {
    /// Offset to add to node timestamps.
    pub offset_ns: i64,
    /// Measured `now - newest node timestamp`.
    pub skew_ns: i64,
}

/// Estimates and memoizes per-node clock offsets.
pub struct ClockOffsetReconciler<O: OffsetStore> {
    store: O,
    cache: DashMap<u32, i64>,
    min_skew_ns: i64,
    recalc_threshold_ns: i64,
    recalc_max_skew_ns: i64,
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

impl<O: OffsetStore> ClockOffsetReconciler<O> {
    pub fn new(store: O, cfg: &OffsetConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            min_skew_ns: duration_ns(cfg.min_skew),
            recalc_threshold_ns: duration_ns(cfg.recalc_threshold),
            recalc_max_skew_ns: duration_ns(cfg.recalc_max_skew),
        }
    }

    /// Estimate against the current host clock.
    pub async fn estimate(&self, rows: &[BackfillRow], node_id: u32) -> OffsetEstimate {
        self.estimate_at(rows, node_id, now_unix_nanos()).await
    }

    /// Estimate against an explicit host time.
    ///
    /// Store failures are logged and the freshly computed value is used for
    /// this call only.
    pub async fn estimate_at(&self, rows: &[BackfillRow], node_id: u32, now_ns: i64) -> OffsetEstimate {
        let max_node_ts = rows
            .iter()
            .filter_map(|r| r.timestamp_ns)
            .max()
            .unwrap_or(0);
        if max_node_ts <= 0 {
            return OffsetEstimate::default();
        }

        let skew_ns = now_ns.saturating_sub(max_node_ts);
        let chosen = if skew_ns.saturating_abs() <= self.min_skew_ns {
            0
        } else {
            skew_ns
        };

        let cached = self.cache.get(&node_id).map(|v| *v);
        if let Some(existing) = cached {
            if !self.should_recalc(existing, skew_ns) {
                return OffsetEstimate {
                    offset_ns: existing,
                    skew_ns,
                };
            }
            self.adopt(node_id, chosen).await;
            info!(node_id, from = existing, to = chosen, skew_ns, "offset-recalc");
            return OffsetEstimate {
                offset_ns: chosen,
                skew_ns,
            };
        }

        let persisted = match self.store.load(node_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(node_id, error = %e, "offset-load failed");
                None
            }
        };
        if let Some(existing) = persisted {
            if !self.should_recalc(existing, skew_ns) {
                self.cache.insert(node_id, existing);
                return OffsetEstimate {
                    offset_ns: existing,
                    skew_ns,
                };
            }
            self.adopt(node_id, chosen).await;
            info!(node_id, from = existing, to = chosen, skew_ns, "offset-refresh");
            return OffsetEstimate {
                offset_ns: chosen,
                skew_ns,
            };
        }

        self.adopt(node_id, chosen).await;
        OffsetEstimate {
            offset_ns: chosen,
            skew_ns,
        }
    }

    /// Cached offset for the node, if any.
    pub fn cached(&self, node_id: u32) -> Option<i64> {
        self.cache.get(&node_id).map(|v| *v)
    }

    fn should_recalc(&self, existing: i64, skew_ns: i64) -> bool {
        if skew_ns.saturating_abs() > self.recalc_max_skew_ns {
            return false;
        }
        existing.saturating_sub(skew_ns).saturating_abs() > self.recalc_threshold_ns
    }

    async fn adopt(&self, node_id: u32, offset_ns: i64) {
        self.cache.insert(node_id, offset_ns);
        if let Err(e) = self.store.persist(node_id, offset_ns).await {
            warn!(node_id, offset_ns, error = %e, "offset-persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    const SEC: i64 = 1_000_000_000;

    /// In-memory store recording persist calls.
    #[derive(Default)]
    struct RecordingStore {
        persisted: parking_lot::Mutex<Option<i64>>,
        calls: parking_lot::Mutex<Vec<(u32, i64)>>,
        fail: bool,
    }

    impl OffsetStore for RecordingStore {
        async fn load(&self, _node_id: u32) -> Result<Option<i64>> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(*self.persisted.lock())
        }

        async fn persist(&self, node_id: u32, offset_ns: i64) -> Result<()> {
            self.calls.lock().push((node_id, offset_ns));
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(())
        }
    }

    fn rows(ts: &[i64]) -> Vec<BackfillRow> {
        ts.iter()
            .map(|t| BackfillRow {
                channel: "ch1".to_string(),
                value: 1.0,
                timestamp_ns: Some(*t),
                tick: None,
                session_index: None,
                sample_rate: None,
            })
            .collect()
    }

    fn reconciler(store: RecordingStore) -> ClockOffsetReconciler<RecordingStore> {
        ClockOffsetReconciler::new(store, &OffsetConfig::default())
    }

    #[tokio::test]
    async fn test_empty_rows_yield_zero() {
        let r = reconciler(RecordingStore::default());
        assert_eq!(r.estimate_at(&[], 1, SEC).await, OffsetEstimate::default());
        assert_eq!(r.estimate_at(&rows(&[0, -5]), 1, SEC).await, OffsetEstimate::default());
        assert!(r.cached(1).is_none());
    }

    #[tokio::test]
    async fn test_small_skew_chooses_zero() {
        let r = reconciler(RecordingStore::default());
        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 11 * SEC).await;
        assert_eq!(est.skew_ns, SEC);
        assert_eq!(est.offset_ns, 0);
        assert_eq!(r.cached(1), Some(0));
        assert_eq!(r.store.calls.lock().clone(), vec![(1, 0)]);
    }

    #[tokio::test]
    async fn test_large_skew_is_used() {
        let r = reconciler(RecordingStore::default());
        let est = r.estimate_at(&rows(&[100 * SEC]), 1, 145 * SEC).await;
        assert_eq!(est.offset_ns, 45 * SEC);
        assert_eq!(est.skew_ns, 45 * SEC);
    }

    #[tokio::test]
    async fn test_uses_newest_row() {
        let r = reconciler(RecordingStore::default());
        let est = r.estimate_at(&rows(&[5 * SEC, 90 * SEC, 60 * SEC]), 1, 100 * SEC).await;
        assert_eq!(est.skew_ns, 10 * SEC);
    }

    #[tokio::test]
    async fn test_cached_offset_reused_within_threshold() {
        let r = reconciler(RecordingStore::default());
        r.cache.insert(1, 5 * SEC);

        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 14 * SEC).await;
        assert_eq!(est.offset_ns, 5 * SEC);
        assert!(r.store.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cached_offset_recalculated_on_drift() {
        let r = reconciler(RecordingStore::default());
        r.cache.insert(1, SEC);

        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 16 * SEC).await;
        assert_eq!(est.skew_ns, 6 * SEC);
        assert_eq!(est.offset_ns, 6 * SEC);
        assert_eq!(r.cached(1), Some(6 * SEC));
        assert_eq!(r.store.calls.lock().clone(), vec![(1, 6 * SEC)]);
    }

    #[tokio::test]
    async fn test_implausible_skew_never_replaces_cache() {
        let r = reconciler(RecordingStore::default());
        r.cache.insert(1, SEC);

        // 45s skew is past recalc_max_skew, drift size is irrelevant.
        let est = r.estimate_at(&rows(&[100 * SEC]), 1, 145 * SEC).await;
        assert_eq!(est.offset_ns, SEC);
        assert_eq!(est.skew_ns, 45 * SEC);
        assert!(r.store.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_persisted_offset_loaded_into_cache() {
        let store = RecordingStore::default();
        *store.persisted.lock() = Some(4 * SEC);
        let r = reconciler(store);

        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 13 * SEC).await;
        assert_eq!(est.offset_ns, 4 * SEC);
        assert_eq!(r.cached(1), Some(4 * SEC));
        assert!(r.store.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_persisted_offset_refreshed_on_drift() {
        let store = RecordingStore::default();
        *store.persisted.lock() = Some(20 * SEC);
        let r = reconciler(store);

        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 15 * SEC).await;
        assert_eq!(est.offset_ns, 5 * SEC);
        assert_eq!(r.cached(1), Some(5 * SEC));
        assert_eq!(r.store.calls.lock().clone(), vec![(1, 5 * SEC)]);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_fresh_value() {
        let store = RecordingStore {
            fail: true,
            ..Default::default()
        };
        let r = reconciler(store);

        let est = r.estimate_at(&rows(&[10 * SEC]), 1, 20 * SEC).await;
        assert_eq!(est.offset_ns, 10 * SEC);
        assert_eq!(r.cached(1), Some(10 * SEC));
    }

    #[tokio::test]
    async fn test_sink_store_round_trip() {
        let sink = Arc::new(MemorySink::new());
        let cfg = OffsetConfig::default();
        let store = SinkOffsetStore::new(Arc::clone(&sink), &cfg);

        assert_eq!(store.load(7).await.expect("load"), None);
        store.persist(7, 42 * SEC).await.expect("persist");
        assert_eq!(store.load(7).await.expect("load"), Some(42 * SEC));
        assert_eq!(store.load(8).await.expect("load"), None);

        let points = sink.points_in("mscl_meta");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tag_value("metric"), Some("node_export_clock_offset_ns"));
        assert_eq!(points[0].tag_value("node_id"), Some("7"));
    }
}
