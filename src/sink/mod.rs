pub mod influx;
pub mod memory;

use std::collections::HashSet;

use anyhow::Result;

use crate::model::{FieldValue, Point};

pub use influx::InfluxSink;
pub use memory::MemorySink;

/// Tag-equality filter selecting one series family in a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFilter {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
}

impl SeriesFilter {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Whether `point` belongs to the filtered series.
    pub fn matches(&self, point: &Point) -> bool {
        point.measurement == self.measurement
            && self
                .tags
                .iter()
                .all(|(k, v)| point.tag_value(k) == Some(v.as_str()))
    }
}

/// Half-open time range `[start_ns, stop_ns)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ns: i64,
    pub stop_ns: i64,
}

impl TimeRange {
    pub fn contains(&self, ts_ns: i64) -> bool {
        ts_ns >= self.start_ns && ts_ns < self.stop_ns
    }
}

/// Provenance already recorded for a series: bare raw node timestamps and
/// `(raw_ts, tick)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawKeySet {
    pub raws: HashSet<i64>,
    pub pairs: HashSet<(i64, i64)>,
}

impl RawKeySet {
    /// Whether a sample with this provenance was already written.
    ///
    /// Samples with a tick match on the pair; samples without match on the
    /// bare raw timestamp.
    pub fn contains(&self, raw_ts: i64, tick: Option<i64>) -> bool {
        match tick {
            Some(t) => self.pairs.contains(&(raw_ts, t)),
            None => self.raws.contains(&raw_ts),
        }
    }

    pub fn insert(&mut self, raw_ts: i64, tick: Option<i64>) {
        self.raws.insert(raw_ts);
        if let Some(t) = tick {
            self.pairs.insert((raw_ts, t));
        }
    }
}

/// Field names carried by backfilled points.
pub const FIELD_VALUE: &str = "value";
pub const FIELD_RAW_TS: &str = "node_ts_raw_ns";
pub const FIELD_TICK: &str = "node_tick";

/// Time-series store receiving streamed and backfilled points.
pub trait Sink: Send + Sync + 'static {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Write a batch of points with nanosecond precision.
    fn write(&self, points: &[Point]) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Timestamps of points in `series` carrying `field` within `range`.
    fn query_existing_timestamps(
        &self,
        series: &SeriesFilter,
        field: &str,
        range: TimeRange,
    ) -> impl std::future::Future<Output = Result<HashSet<i64>>> + Send;

    /// Provenance recorded in `series` with `node_ts_raw_ns` in `[raw_min, raw_max]`.
    fn query_existing_raw(
        &self,
        series: &SeriesFilter,
        raw_min: i64,
        raw_max: i64,
    ) -> impl std::future::Future<Output = Result<RawKeySet>> + Send;

    /// Most recent value of `field` in `series`.
    fn last_value(
        &self,
        series: &SeriesFilter,
        field: &str,
    ) -> impl std::future::Future<Output = Result<Option<FieldValue>>> + Send;
}

/// Sink selected by configuration.
///
/// Enum dispatch keeps the async trait methods statically dispatched.
pub enum SinkBackend {
    Influx(InfluxSink),
    Memory(MemorySink),
}

impl Sink for SinkBackend {
    fn name(&self) -> &str {
        match self {
            Self::Influx(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    async fn write(&self, points: &[Point]) -> Result<()> {
        match self {
            Self::Influx(s) => s.write(points).await,
            Self::Memory(s) => s.write(points).await,
        }
    }

    async fn query_existing_timestamps(
        &self,
        series: &SeriesFilter,
        field: &str,
        range: TimeRange,
    ) -> Result<HashSet<i64>> {
        match self {
            Self::Influx(s) => s.query_existing_timestamps(series, field, range).await,
            Self::Memory(s) => s.query_existing_timestamps(series, field, range).await,
        }
    }

    async fn query_existing_raw(
        &self,
        series: &SeriesFilter,
        raw_min: i64,
        raw_max: i64,
    ) -> Result<RawKeySet> {
        match self {
            Self::Influx(s) => s.query_existing_raw(series, raw_min, raw_max).await,
            Self::Memory(s) => s.query_existing_raw(series, raw_min, raw_max).await,
        }
    }

    async fn last_value(&self, series: &SeriesFilter, field: &str) -> Result<Option<FieldValue>> {
        match self {
            Self::Influx(s) => s.last_value(series, field).await,
            Self::Memory(s) => s.last_value(series, field).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_filter_matches_all_tags() {
        let filter = SeriesFilter::new("m").tag("node_id", "1").tag("channel", "ch1");
        let hit = Point::new("m").tag("node_id", "1").tag("channel", "ch1").tag("source", "x");
        let wrong_tag = Point::new("m").tag("node_id", "1").tag("channel", "ch2");
        let wrong_measurement = Point::new("n").tag("node_id", "1").tag("channel", "ch1");

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_tag));
        assert!(!filter.matches(&wrong_measurement));
    }

    #[test]
    fn test_raw_key_set_pair_vs_bare() {
        let mut set = RawKeySet::default();
        set.insert(100, Some(7));
        set.insert(200, None);

        assert!(set.contains(100, Some(7)));
        assert!(!set.contains(100, Some(8)));
        // A bare raw timestamp matches regardless of how it was recorded.
        assert!(set.contains(100, None));
        assert!(set.contains(200, None));
        assert!(!set.contains(200, Some(1)));
    }

    #[test]
    fn test_time_range_is_half_open() {
        let r = TimeRange {
            start_ns: 10,
            stop_ns: 20,
        };
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
        assert!(!r.contains(9));
    }
}
