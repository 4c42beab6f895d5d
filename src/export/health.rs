use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::status::{HealthReport, HealthState, StatusSource};
use crate::observability::LogRing;

const NAMESPACE: &str = "sensorbridge";

/// Prometheus metrics for the bridge plus the HTTP server exposing them.
///
/// All metrics use the "sensorbridge" namespace. Organized by path:
/// - Reader: packets, queue, reconnects
/// - Writer: points, write calls, decode and sink failures
/// - Backfill and retry
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Reader ===
    /// Packets pulled from the base station.
    pub packets_read: Counter,
    /// Packets discarded by the queue's drop-oldest policy.
    pub queue_dropped_packets: Counter,
    /// Reconnect attempts after a reader failure.
    pub reconnect_attempts: Counter,
    /// Reconnects that produced a working link.
    pub reconnect_successes: Counter,
    /// Transport errors seen by the reader.
    pub reader_errors: Counter,
    /// Packets currently queued.
    pub queue_depth: Gauge,
    /// Highest queue depth observed.
    pub queue_high_water_mark: Gauge,
    /// Whether the base station link is up (1=yes, 0=no).
    pub base_connected: Gauge,

    // === Writer ===
    /// Raw points accepted by the sink.
    pub points_written: Counter,
    /// Resampled points accepted by the sink.
    pub points_written_resampled: Counter,
    /// Sink write calls issued.
    pub write_calls: Counter,
    /// Failed sink writes.
    pub writer_errors: Counter,
    /// Data points no decoder could turn into a number.
    pub decode_errors: Counter,
    /// Buffered points discarded after the pending cap was hit.
    pub pending_points_discarded: Counter,
    /// Points waiting for a successful write.
    pub pending_points: Gauge,
    pub sink_write_duration: Histogram,

    // === Backfill / retry ===
    pub backfill_points_written: Counter,
    pub backfill_points_skipped: Counter,
    /// Retries of device operations that failed with a transient error.
    pub transient_error_retries: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let packets_read = counter("packets_read_total", "Packets read from the base station.")?;
        let queue_dropped_packets = counter(
            "queue_dropped_packets_total",
            "Packets dropped because the queue was full.",
        )?;
        let reconnect_attempts = counter(
            "reconnect_attempts_total",
            "Reconnect attempts after a transport failure.",
        )?;
        let reconnect_successes = counter(
            "reconnect_successes_total",
            "Reconnect attempts that restored the link.",
        )?;
        let reader_errors = counter("reader_errors_total", "Transport errors seen by the reader.")?;
        let queue_depth = gauge("queue_depth", "Packets currently queued.")?;
        let queue_high_water_mark =
            gauge("queue_high_water_mark", "Highest queue depth observed.")?;
        let base_connected = gauge(
            "base_connected",
            "Whether the base station link is up (1=yes, 0=no).",
        )?;

        let points_written = counter("points_written_total", "Raw points written to the sink.")?;
        let points_written_resampled = counter(
            "points_written_resampled_total",
            "Resampled points written to the sink.",
        )?;
        let write_calls = counter("write_calls_total", "Sink write calls issued.")?;
        let writer_errors = counter("writer_errors_total", "Failed sink writes.")?;
        let decode_errors = counter(
            "decode_errors_total",
            "Data points dropped because no decoder accepted the value.",
        )?;
        let pending_points_discarded = counter(
            "pending_points_discarded_total",
            "Buffered points discarded after the pending cap was reached.",
        )?;
        let pending_points = gauge("pending_points", "Points waiting for a successful write.")?;
        let sink_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sink_write_duration_seconds",
                "Time to write one batch to the sink.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let backfill_points_written = counter(
            "backfill_points_written_total",
            "Historical points written by backfill.",
        )?;
        let backfill_points_skipped = counter(
            "backfill_points_skipped_total",
            "Historical points skipped because they already exist.",
        )?;
        let transient_error_retries = counter(
            "transient_error_retries_total",
            "Device operations retried after a transient error.",
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(packets_read.clone()))?;
        registry.register(Box::new(queue_dropped_packets.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(reconnect_successes.clone()))?;
        registry.register(Box::new(reader_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_high_water_mark.clone()))?;
        registry.register(Box::new(base_connected.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(points_written_resampled.clone()))?;
        registry.register(Box::new(write_calls.clone()))?;
        registry.register(Box::new(writer_errors.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(pending_points_discarded.clone()))?;
        registry.register(Box::new(pending_points.clone()))?;
        registry.register(Box::new(sink_write_duration.clone()))?;
        registry.register(Box::new(backfill_points_written.clone()))?;
        registry.register(Box::new(backfill_points_skipped.clone()))?;
        registry.register(Box::new(transient_error_retries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            packets_read,
            queue_dropped_packets,
            reconnect_attempts,
            reconnect_successes,
            reader_errors,
            queue_depth,
            queue_high_water_mark,
            base_connected,
            points_written,
            points_written_resampled,
            write_calls,
            writer_errors,
            decode_errors,
            pending_points_discarded,
            pending_points,
            sink_write_duration,
            backfill_points_written,
            backfill_points_skipped,
            transient_error_retries,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz and /logs.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 is requested.
    pub async fn start(
        &self,
        status: Arc<dyn StatusSource>,
        logs: Arc<LogRing>,
    ) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            status,
            logs,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/logs", get(logs_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    status: Arc<dyn StatusSource>,
    logs: Arc<LogRing>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - JSON link and stream status.
///
/// Degraded is still served with 200 so scrapers can read the reasons;
/// only the body distinguishes the two states.
async fn healthz_handler(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let report = HealthReport::evaluate(&state.status.probe());
    if report.status == HealthState::Degraded {
        tracing::debug!(reasons = ?report.reasons, "health degraded");
    }
    Json(report)
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

/// GET /logs - most recent operator log lines, oldest first.
async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    Json(state.logs.recent(params.limit))
}
