//! Consumer half of the live pipeline.
//!
//! Drains every queued packet in one pass, turns data points into raw and
//! resampled sink points and writes them in bounded chunks. Failed writes
//! keep their points for the next cycle. The writer also owns the
//! operator-facing summaries: throttled batch logs, packet rate counts and
//! the channel-1 stall warning.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::decode::{
    channel_key, decode_value, is_channel_1, is_diagnostic, point_time_ns, ValueDecoder,
};
use super::dedup::{TieBreakMode, TieBreaker};
use super::queue::PacketQueue;
use super::resample::resample;
use crate::config::StreamConfig;
use crate::export::health::HealthMetrics;
use crate::model::{sample_rate_text_to_hz, FieldValue, Packet, Point, Sample};
use crate::sink::{Sink, FIELD_VALUE};
use crate::transport::{ConnectionManager, Transport};

/// Diagnostics listed in the stall warning, in display order.
const STALL_DIAGNOSTICS: [&str; 5] = [
    "diagnostic_state",
    "diagnostic_syncFailures",
    "diagnostic_totalDroppedPackets",
    "diagnostic_lowBatteryFlag",
    "diagnostic_memoryFull",
];

/// Where the writer gets its value decoder order from.
pub trait DecoderSource: Send + Sync + 'static {
    fn decoders(&self) -> Vec<ValueDecoder>;
}

impl<T: Transport> DecoderSource for ConnectionManager<T> {
    fn decoders(&self) -> Vec<ValueDecoder> {
        self.capabilities()
            .map(|c| c.decoders)
            .unwrap_or_else(|| ValueDecoder::DEFAULT_ORDER.to_vec())
    }
}

/// Fixed decoder order, used when no device session exists.
pub struct DefaultDecoders;

impl DecoderSource for DefaultDecoders {
    fn decoders(&self) -> Vec<ValueDecoder> {
        ValueDecoder::DEFAULT_ORDER.to_vec()
    }
}

/// Counters feeding the periodic summary log.
#[derive(Default)]
struct BatchSummary {
    points: usize,
    by_channel: BTreeMap<String, usize>,
    packet_rates: BTreeMap<String, usize>,
}

pub struct BatchWriter<S: Sink> {
    sink: Arc<S>,
    queue: Arc<PacketQueue>,
    decoders: Arc<dyn DecoderSource>,
    metrics: Arc<HealthMetrics>,
    cfg: StreamConfig,

    raw_ties: TieBreaker,
    resampled_ties: TieBreaker,
    pending: VecDeque<Point>,
    last_write: Instant,

    diagnostics: HashMap<String, f64>,
    last_ch1: Option<Instant>,
    last_stall_log: Option<Instant>,
    summary: BatchSummary,
    last_summary_log: Instant,
}

impl<S: Sink> BatchWriter<S> {
    pub fn new(
        sink: Arc<S>,
        queue: Arc<PacketQueue>,
        decoders: Arc<dyn DecoderSource>,
        metrics: Arc<HealthMetrics>,
        cfg: &StreamConfig,
    ) -> Self {
        let mode = TieBreakMode::from_strict(cfg.strict_tie_break);
        let now = Instant::now();
        Self {
            sink,
            queue,
            decoders,
            metrics,
            cfg: cfg.clone(),
            raw_ties: TieBreaker::new(mode),
            resampled_ties: TieBreaker::new(mode),
            pending: VecDeque::new(),
            last_write: now,
            diagnostics: HashMap::new(),
            last_ch1: None,
            last_stall_log: None,
            summary: BatchSummary::default(),
            last_summary_log: now,
        }
    }

    /// Runs until `cancel` fires, then drains and flushes what is left.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            measurement = %self.cfg.measurement,
            resampled = self.cfg.resampled.enabled,
            "stream writer started"
        );

        loop {
            let has_data = tokio::select! {
                _ = cancel.cancelled() => break,
                ready = self.queue.wait_for_data(self.cfg.queue_wait) => ready,
            };

            if has_data {
                let packets = self.queue.drain_all();
                self.ingest(&packets);
            }
            self.metrics.queue_depth.set(self.queue.len() as f64);

            self.flush(false).await;
            self.maybe_log_summary();
            self.maybe_warn_stall();
        }

        let packets = self.queue.drain_all();
        self.ingest(&packets);
        self.flush(true).await;
        info!(pending = self.pending.len(), "stream writer stopped");
    }

    /// Converts one drained batch of packets into pending sink points.
    ///
    /// Tie-breaking spans exactly this batch.
    pub fn ingest(&mut self, packets: &[Packet]) {
        if packets.is_empty() {
            return;
        }

        let samples = self.extract(packets);
        if samples.is_empty() {
            return;
        }

        self.raw_ties.clear();
        self.resampled_ties.clear();

        for s in &samples {
            let ts = self.raw_ties.assign(s.node_id, &s.channel, s.timestamp_ns);
            let point = self
                .base_point(&self.cfg.measurement, s)
                .field(FIELD_VALUE, FieldValue::Float(s.value))
                .timestamp(ts);
            self.pending.push_back(point);

            *self.summary.by_channel.entry(s.channel.clone()).or_default() += 1;
        }
        self.summary.points += samples.len();

        if self.cfg.resampled.enabled {
            for r in resample(&samples) {
                let s = &r.sample;
                let ts = self
                    .resampled_ties
                    .assign(s.node_id, &s.channel, r.resampled_ns);
                let mut point = self
                    .base_point(&self.cfg.resampled.measurement, s)
                    .tag("time_model", "resampled_uniform_second")
                    .field(FIELD_VALUE, FieldValue::Float(s.value));
                if self.cfg.resampled.include_raw_ts {
                    point = point.field("raw_ts_ns", FieldValue::Int(s.timestamp_ns));
                }
                self.pending.push_back(point.timestamp(ts));
            }
        }

        self.enforce_pending_cap();
    }

    fn base_point(&self, measurement: &str, s: &Sample) -> Point {
        Point::new(measurement)
            .tag("node_id", s.node_id.to_string())
            .tag("channel", s.channel.as_str())
            .tag("source", s.source.as_str())
    }

    fn extract(&mut self, packets: &[Packet]) -> Vec<Sample> {
        let decoders = self.decoders.decoders();
        let now = Instant::now();
        let mut samples = Vec::new();

        for packet in packets {
            let label = packet.rate_label.as_deref().unwrap_or("unknown");
            *self
                .summary
                .packet_rates
                .entry(label.to_string())
                .or_default() += 1;
            let rate_hz = sample_rate_text_to_hz(label);

            for dp in &packet.points {
                let channel = channel_key(dp);
                if self.cfg.only_channel_1 && !is_channel_1(&channel) {
                    continue;
                }

                let Some(value) = decode_value(&dp.value, &decoders) else {
                    self.metrics.decode_errors.inc();
                    debug!(node_id = packet.node_address, %channel, "undecodable value");
                    continue;
                };

                if is_diagnostic(&channel) {
                    self.diagnostics.insert(channel.clone(), value);
                }
                if is_channel_1(&channel) {
                    self.last_ch1 = Some(now);
                }

                samples.push(Sample {
                    node_id: packet.node_address,
                    channel,
                    value,
                    timestamp_ns: point_time_ns(dp),
                    source: self.cfg.source_tag.clone(),
                    tick: None,
                    sample_rate_hz: rate_hz,
                });
            }
        }

        samples
    }

    fn enforce_pending_cap(&mut self) {
        let cap = self.cfg.max_pending_points.max(1);
        let excess = self.pending.len().saturating_sub(cap);
        if excess > 0 {
            self.pending.drain(..excess);
            self.metrics.pending_points_discarded.inc_by(excess as f64);
            warn!(
                discarded = excess,
                cap, "pending points over cap, discarding oldest"
            );
        }
        self.metrics.pending_points.set(self.pending.len() as f64);
    }

    /// Writes pending points in `batch_size` chunks.
    ///
    /// Without `force`, nothing is written until a full chunk is buffered or
    /// `flush_interval` has passed since the last write. Stops at the first
    /// failed chunk, which stays pending.
    pub async fn flush(&mut self, force: bool) {
        if self.pending.is_empty() {
            return;
        }

        let batch_size = self.cfg.batch_size.max(1);
        let due = force
            || self.pending.len() >= batch_size
            || self.last_write.elapsed() >= self.cfg.flush_interval;
        if !due {
            return;
        }

        while !self.pending.is_empty() {
            let n = batch_size.min(self.pending.len());
            let chunk = &self.pending.make_contiguous()[..n];

            let started = Instant::now();
            self.metrics.write_calls.inc();
            let result = self.sink.write(chunk).await;
            self.metrics
                .sink_write_duration
                .observe(started.elapsed().as_secs_f64());

            if let Err(e) = result {
                self.metrics.writer_errors.inc();
                error!(
                    sink = self.sink.name(),
                    error = %format!("{e:#}"),
                    pending = self.pending.len(),
                    "sink write failed, keeping points for retry"
                );
                break;
            }

            let resampled = chunk
                .iter()
                .filter(|p| p.measurement == self.cfg.resampled.measurement)
                .count();
            self.metrics.points_written.inc_by((n - resampled) as f64);
            self.metrics
                .points_written_resampled
                .inc_by(resampled as f64);
            self.pending.drain(..n);
        }

        self.last_write = Instant::now();
        self.metrics.pending_points.set(self.pending.len() as f64);
    }

    /// Emits the batch summary when `log_interval` has passed.
    fn maybe_log_summary(&mut self) -> bool {
        if self.summary.points == 0 || self.last_summary_log.elapsed() < self.cfg.log_interval {
            return false;
        }

        let summary = std::mem::take(&mut self.summary);
        info!(
            "logged {} points ({})",
            summary.points,
            join_counts(&summary.by_channel)
        );
        if !summary.packet_rates.is_empty() {
            info!("Packet rates ({})", join_counts(&summary.packet_rates));
        }
        self.last_summary_log = Instant::now();
        true
    }

    /// Warns when channel 1 has gone quiet, throttled by `drop_log_throttle`.
    ///
    /// Never fires before the first channel-1 sample.
    fn maybe_warn_stall(&mut self) -> bool {
        let Some(last) = self.last_ch1 else {
            return false;
        };
        let silent = last.elapsed();
        if silent < self.cfg.drop_warn {
            return false;
        }
        if self
            .last_stall_log
            .is_some_and(|at| at.elapsed() < self.cfg.drop_log_throttle)
        {
            return false;
        }

        warn!(
            "no ch1 data for {:.1}s ({})",
            silent.as_secs_f64(),
            self.diagnostic_summary()
        );
        self.last_stall_log = Some(Instant::now());
        true
    }

    fn diagnostic_summary(&self) -> String {
        let mut out = String::new();
        for name in STALL_DIAGNOSTICS {
            let short = name.trim_start_matches(super::decode::DIAGNOSTIC_PREFIX);
            let _ = match self.diagnostics.get(name) {
                Some(v) => write!(out, "{short}={v} "),
                None => write!(out, "{short}=n/a "),
            };
        }
        out.trim_end().to_string()
    }

    /// Points buffered for the next write.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Time since the last flush attempt.
    pub fn since_last_write(&self) -> Duration {
        self.last_write.elapsed()
    }
}

fn join_counts(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}
