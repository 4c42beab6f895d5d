//! Idempotent historical backfill.
//!
//! Rows downloaded from node storage are aligned to host time, de-collided,
//! checked against what the sink already holds and written in bounded
//! batches. Two existence checks run per channel: corrected timestamps, and
//! raw provenance (`node_ts_raw_ns` plus `node_tick`). The second catches a
//! sample that was written before under a different clock offset.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::BackfillConfig;
use crate::export::health::HealthMetrics;
use crate::model::{sample_rate_text_to_hz, BackfillRow, FieldValue, Point, NANOS_PER_SEC};
use crate::sink::{
    RawKeySet, SeriesFilter, Sink, TimeRange, FIELD_RAW_TS, FIELD_TICK, FIELD_VALUE,
};
use crate::stream::dedup::{TieBreakMode, TieBreaker};

/// Tag marking points whose time was shifted from node to host clock.
const TIME_ALIGNMENT: &str = "node_to_host";

/// Outcome of one backfill call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackfillStats {
    pub written: usize,
    pub skipped_existing: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackfillError {
    #[error("querying existing points for channel {channel}: {message}")]
    Query { channel: String, message: String },

    #[error("writing backfill batch after {written} points: {message}")]
    Write { written: usize, message: String },
}

/// A row accepted for writing, before the existence checks.
struct Candidate {
    channel: String,
    ts_ns: i64,
    value: f64,
    raw_ts_ns: i64,
    tick: Option<i64>,
}

/// First tick-bearing row of a `(channel, session)` run.
struct TickBase {
    tick: i64,
    ts_ns: i64,
    rate_hz: f64,
}

/// Min/max tracker.
#[derive(Clone, Copy)]
struct Span {
    lo: i64,
    hi: i64,
}

impl Span {
    fn widen(slot: &mut Option<Span>, v: i64) {
        match slot {
            Some(s) => {
                s.lo = s.lo.min(v);
                s.hi = s.hi.max(v);
            }
            None => *slot = Some(Span { lo: v, hi: v }),
        }
    }
}

/// Writes historical rows into the raw measurement without duplicates.
pub struct BackfillService<S: Sink> {
    sink: Arc<S>,
    measurement: String,
    default_source: String,
    batch_size: usize,
    tie_break: TieBreakMode,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: Sink> BackfillService<S> {
    pub fn new(sink: Arc<S>, measurement: impl Into<String>, cfg: &BackfillConfig) -> Self {
        Self {
            sink,
            measurement: measurement.into(),
            default_source: cfg.source_tag.clone(),
            batch_size: cfg.batch_size.max(1),
            tie_break: TieBreakMode::OriginalKey,
            metrics: None,
        }
    }

    pub fn with_tie_break(mut self, mode: TieBreakMode) -> Self {
        self.tie_break = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backfill `rows` for `node_id`, shifting node timestamps by
    /// `time_offset_ns`. `source_tag` defaults to the configured tag.
    ///
    /// Re-running the same call against the same sink writes nothing.
    pub async fn backfill(
        &self,
        node_id: u32,
        rows: &[BackfillRow],
        time_offset_ns: i64,
        source_tag: Option<&str>,
    ) -> Result<BackfillStats, BackfillError> {
        if rows.is_empty() {
            return Ok(BackfillStats::default());
        }

        let node_tag = node_id.to_string();
        let source = source_tag
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.default_source)
            .to_string();

        let candidates = self.align(node_id, rows, time_offset_ns);

        // Per-channel ranges, in first-seen order.
        let mut channels: Vec<&str> = Vec::new();
        let mut ts_spans: HashMap<&str, Option<Span>> = HashMap::new();
        let mut raw_spans: HashMap<&str, Option<Span>> = HashMap::new();
        for c in &candidates {
            let ch = c.channel.as_str();
            if !ts_spans.contains_key(ch) {
                channels.push(ch);
            }
            Span::widen(ts_spans.entry(ch).or_default(), c.ts_ns);
            Span::widen(raw_spans.entry(ch).or_default(), c.raw_ts_ns);
        }

        let mut existing: HashMap<String, HashSet<i64>> = HashMap::new();
        let mut existing_raw: HashMap<String, RawKeySet> = HashMap::new();
        for ch in channels {
            let series = SeriesFilter::new(self.measurement.as_str())
                .tag("node_id", node_tag.as_str())
                .tag("channel", ch)
                .tag("source", source.as_str());
            let query_err = |e: anyhow::Error| BackfillError::Query {
                channel: ch.to_string(),
                message: format!("{e:#}"),
            };

            if let Some(Some(span)) = ts_spans.get(ch) {
                let range = TimeRange {
                    start_ns: span.lo,
                    stop_ns: span.hi.saturating_add(1),
                };
                let set = self
                    .sink
                    .query_existing_timestamps(&series, FIELD_VALUE, range)
                    .await
                    .map_err(query_err)?;
                existing.insert(ch.to_string(), set);
            }

            if let Some(Some(span)) = raw_spans.get(ch) {
                let keys = self
                    .sink
                    .query_existing_raw(&series, span.lo, span.hi)
                    .await
                    .map_err(query_err)?;
                existing_raw.insert(ch.to_string(), keys);
            }
        }

        let mut stats = BackfillStats::default();
        let mut batch: Vec<Point> = Vec::with_capacity(self.batch_size.min(candidates.len()));

        for c in candidates {
            let known_raw = existing_raw
                .get(&c.channel)
                .is_some_and(|k| k.contains(c.raw_ts_ns, c.tick));
            let known_ts = existing
                .get(&c.channel)
                .is_some_and(|set| set.contains(&c.ts_ns));
            if known_raw || known_ts {
                stats.skipped_existing += 1;
                continue;
            }

            let mut point = Point::new(self.measurement.as_str())
                .tag("node_id", node_tag.as_str())
                .tag("channel", c.channel.as_str())
                .tag("source", source.as_str())
                .tag("time_alignment", TIME_ALIGNMENT)
                .field(FIELD_VALUE, FieldValue::Float(c.value))
                .field(FIELD_RAW_TS, FieldValue::Int(c.raw_ts_ns))
                .field("clock_offset_ns", FieldValue::Int(time_offset_ns))
                .timestamp(c.ts_ns);
            if let Some(tick) = c.tick {
                point = point.field(FIELD_TICK, FieldValue::Int(tick));
            }
            batch.push(point);

            if let Some(set) = existing.get_mut(&c.channel) {
                set.insert(c.ts_ns);
            }
            if let Some(keys) = existing_raw.get_mut(&c.channel) {
                keys.insert(c.raw_ts_ns, c.tick);
            }

            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut stats).await?;
            }
        }
        self.flush(&mut batch, &mut stats).await?;

        if let Some(m) = &self.metrics {
            m.backfill_points_skipped.inc_by(stats.skipped_existing as f64);
        }

        info!(
            node_id,
            written = stats.written,
            skipped_existing = stats.skipped_existing,
            offset_ns = time_offset_ns,
            "backfill complete"
        );

        Ok(stats)
    }

    /// Validates rows, reconstructs tick timing and applies the offset.
    fn align(&self, node_id: u32, rows: &[BackfillRow], time_offset_ns: i64) -> Vec<Candidate> {
        let mut tie_break = TieBreaker::new(self.tie_break);
        let mut bases: HashMap<(String, Option<u32>), TickBase> = HashMap::new();
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            let channel = row.channel.trim();
            if channel.is_empty() || !row.value.is_finite() {
                continue;
            }
            let Some(raw_ts_ns) = row.timestamp_ns else {
                continue;
            };

            let mut ts_base = raw_ts_ns;
            let rate = row
                .sample_rate
                .as_deref()
                .and_then(sample_rate_text_to_hz)
                .filter(|hz| *hz > 0.0);
            if let (Some(tick), Some(rate_hz)) = (row.tick, rate) {
                let base = bases
                    .entry((channel.to_string(), row.session_index))
                    .or_insert(TickBase {
                        tick,
                        ts_ns: raw_ts_ns,
                        rate_hz,
                    });
                let step_ns = (NANOS_PER_SEC as f64 / base.rate_hz).round() as i64;
                ts_base = tick
                    .checked_sub(base.tick)
                    .and_then(|rel| rel.checked_mul(step_ns))
                    .and_then(|off| base.ts_ns.checked_add(off))
                    .unwrap_or(raw_ts_ns);
            }

            let ts_ns = ts_base.saturating_add(time_offset_ns);
            if ts_ns <= 0 {
                continue;
            }
            let ts_ns = tie_break.assign(node_id, channel, ts_ns);

            out.push(Candidate {
                channel: channel.to_string(),
                ts_ns,
                value: row.value,
                raw_ts_ns,
                tick: row.tick,
            });
        }

        out
    }

    async fn flush(
        &self,
        batch: &mut Vec<Point>,
        stats: &mut BackfillStats,
    ) -> Result<(), BackfillError> {
        if batch.is_empty() {
            return Ok(());
        }

        self.sink
            .write(batch)
            .await
            .map_err(|e| BackfillError::Write {
                written: stats.written,
                message: format!("{e:#}"),
            })?;

        stats.written += batch.len();
        if let Some(m) = &self.metrics {
            m.backfill_points_written.inc_by(batch.len() as f64);
        }
        debug!(points = batch.len(), total = stats.written, "backfill batch written");
        batch.clear();

        Ok(())
    }
}
