use std::collections::HashSet;

use anyhow::{bail, Result};

use super::{RawKeySet, SeriesFilter, Sink, TimeRange, FIELD_RAW_TS, FIELD_TICK};
use crate::model::{FieldValue, Point};

/// In-process sink keeping every written point.
///
/// Backs the `memory` dry-run mode and tests. Writes can be made to fail
/// a set number of times to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: parking_lot::Mutex<Vec<Point>>,
    write_sizes: parking_lot::Mutex<Vec<usize>>,
    failing_writes: parking_lot::Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail without storing anything.
    pub fn fail_next_writes(&self, n: u32) {
        *self.failing_writes.lock() = n;
    }

    /// Copy of every stored point, in write order.
    pub fn points(&self) -> Vec<Point> {
        self.points.lock().clone()
    }

    /// Stored points of one measurement.
    pub fn points_in(&self, measurement: &str) -> Vec<Point> {
        self.points
            .lock()
            .iter()
            .filter(|p| p.measurement == measurement)
            .cloned()
            .collect()
    }

    /// Batch sizes of successful writes, in order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, points: &[Point]) -> Result<()> {
        {
            let mut failing = self.failing_writes.lock();
            if *failing > 0 {
                *failing -= 1;
                bail!("memory sink: injected write failure");
            }
        }

        if points.is_empty() {
            return Ok(());
        }

        self.points.lock().extend_from_slice(points);
        self.write_sizes.lock().push(points.len());
        Ok(())
    }

    async fn query_existing_timestamps(
        &self,
        series: &SeriesFilter,
        field: &str,
        range: TimeRange,
    ) -> Result<HashSet<i64>> {
        Ok(self
            .points
            .lock()
            .iter()
            .filter(|p| series.matches(p) && p.field_value(field).is_some())
            .map(|p| p.timestamp_ns)
            .filter(|ts| range.contains(*ts))
            .collect())
    }

    async fn query_existing_raw(
        &self,
        series: &SeriesFilter,
        raw_min: i64,
        raw_max: i64,
    ) -> Result<RawKeySet> {
        let mut out = RawKeySet::default();
        for p in self.points.lock().iter().filter(|p| series.matches(p)) {
            let Some(raw) = p.field_value(FIELD_RAW_TS).map(FieldValue::as_i64) else {
                continue;
            };
            if raw < raw_min || raw > raw_max {
                continue;
            }
            out.insert(raw, p.field_value(FIELD_TICK).map(FieldValue::as_i64));
        }
        Ok(out)
    }

    async fn last_value(&self, series: &SeriesFilter, field: &str) -> Result<Option<FieldValue>> {
        Ok(self
            .points
            .lock()
            .iter()
            .filter(|p| series.matches(p))
            .filter_map(|p| p.field_value(field).map(|v| (p.timestamp_ns, v)))
            .max_by_key(|(ts, _)| *ts)
            .map(|(_, v)| v))
    }
}
