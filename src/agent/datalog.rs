//! Node datalog export: download, align, backfill.
//!
//! The download is the longest exclusive device operation, so the stream
//! reader is paused for its duration. The pause is re-armed on every retry
//! attempt and released once the download is done.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::backfill::BackfillService;
use crate::config::{ExportConfig, RetryConfig};
use crate::export::health::HealthMetrics;
use crate::model::{now_unix_nanos, BackfillRow, NANOS_PER_SEC};
use crate::offset::{ClockOffsetReconciler, OffsetEstimate, OffsetStore};
use crate::retry::{LinkOperation, LinkOps, RetryError, RetryPolicy};
use crate::sink::Sink;
use crate::stream::pause::PauseGate;
use crate::transport::{ConnectionManager, Transport, TransportError};

/// Host-time window applied to downloaded rows.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ExportWindow {
    #[default]
    All,
    /// Inclusive host-time bounds in unix ns.
    Between { from_ns: i64, to_ns: i64 },
    /// The last `h` hours up to now.
    HostHours(f64),
}

impl ExportWindow {
    fn bounds(self, now_ns: i64) -> Option<(i64, i64)> {
        match self {
            Self::All => None,
            Self::Between { from_ns, to_ns } => Some((from_ns, to_ns)),
            Self::HostHours(h) => {
                let span = (h.max(0.0) * 3600.0 * NANOS_PER_SEC as f64) as i64;
                Some((now_ns.saturating_sub(span), now_ns))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    /// Datalog session to download; `None` downloads all sessions.
    pub session: Option<u32>,
    /// Write the rows through backfill.
    pub ingest: bool,
    /// Estimate and apply the node-to-host clock offset.
    pub align_clock: bool,
    pub window: ExportWindow,
    /// `source` tag for backfilled points; defaults to the backfill setting.
    pub source_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub node_id: u32,
    /// Rows left after windowing.
    pub point_count: usize,
    pub written: usize,
    pub skipped_existing: usize,
    pub offset_ns: i64,
    pub skew_ns: i64,
    pub window_applied: bool,
    /// Backfill failure text; the export itself still succeeded.
    pub backfill_error: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("downloading datalog: {0}")]
    Download(#[from] RetryError),

    #[error("node {node_id} returned no datalog rows")]
    Empty { node_id: u32 },

    #[error("no datalog rows for node {node_id} inside the requested window")]
    EmptyWindow { node_id: u32 },
}

/// Download step run under the retry wrapper.
struct DownloadDatalog {
    node_id: u32,
    session: Option<u32>,
    pause: Arc<PauseGate>,
    pause_for: Duration,
}

impl<T: Transport> LinkOperation<T> for DownloadDatalog {
    type Output = Vec<BackfillRow>;

    async fn run(&mut self, transport: &mut T) -> Result<Vec<BackfillRow>, TransportError> {
        self.pause.pause_for(self.pause_for, "datalog download");
        transport
            .download_historical(self.node_id, self.session)
            .await
    }
}

pub struct DatalogExporter<T: Transport, S: Sink, O: OffsetStore> {
    conn: Arc<ConnectionManager<T>>,
    pause: Arc<PauseGate>,
    policy: RetryPolicy,
    pause_for: Duration,
    reconciler: Arc<ClockOffsetReconciler<O>>,
    backfill: Arc<BackfillService<S>>,
}

impl<T: Transport, S: Sink, O: OffsetStore> DatalogExporter<T, S, O> {
    pub fn new(
        conn: Arc<ConnectionManager<T>>,
        pause: Arc<PauseGate>,
        reconciler: Arc<ClockOffsetReconciler<O>>,
        backfill: Arc<BackfillService<S>>,
        metrics: &HealthMetrics,
        retry: &RetryConfig,
        cfg: &ExportConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(retry)
            .with_max_attempts(cfg.max_attempts)
            .with_transient_patterns(cfg.transient_patterns.clone())
            .with_transient_counter(metrics.transient_error_retries.clone());

        Self {
            conn,
            pause,
            policy,
            pause_for: cfg.pause,
            reconciler,
            backfill,
        }
    }

    pub async fn export_datalog(
        &self,
        node_id: u32,
        req: &ExportRequest,
    ) -> Result<ExportReport, ExportError> {
        self.pause.pause_for(self.pause_for, "datalog export");

        let downloaded = {
            let guard = self.conn.lock().await;
            let mut ops = LinkOps::new(
                guard,
                DownloadDatalog {
                    node_id,
                    session: req.session,
                    pause: Arc::clone(&self.pause),
                    pause_for: self.pause_for,
                },
            );
            self.policy.run("datalog download", &mut ops).await
        };
        self.pause.resume();

        let rows = downloaded?;
        if rows.is_empty() {
            return Err(ExportError::Empty { node_id });
        }
        info!(node_id, rows = rows.len(), "datalog downloaded");

        let estimate = if req.align_clock {
            self.reconciler.estimate(&rows, node_id).await
        } else {
            OffsetEstimate::default()
        };

        let mut report = ExportReport {
            node_id,
            offset_ns: estimate.offset_ns,
            skew_ns: estimate.skew_ns,
            ..Default::default()
        };

        let rows = match req.window.bounds(now_unix_nanos()) {
            None => rows,
            Some((from, to)) => {
                report.window_applied = true;
                let kept: Vec<BackfillRow> = rows
                    .into_iter()
                    .filter(|r| {
                        r.timestamp_ns
                            .map(|ts| ts.saturating_add(estimate.offset_ns))
                            .is_some_and(|ts| ts >= from && ts <= to)
                    })
                    .collect();
                if kept.is_empty() {
                    return Err(ExportError::EmptyWindow { node_id });
                }
                kept
            }
        };
        report.point_count = rows.len();

        if req.ingest {
            match self
                .backfill
                .backfill(node_id, &rows, estimate.offset_ns, req.source_tag.as_deref())
                .await
            {
                Ok(stats) => {
                    report.written = stats.written;
                    report.skipped_existing = stats.skipped_existing;
                }
                Err(e) => {
                    warn!(node_id, error = %e, "datalog backfill failed");
                    if let crate::backfill::BackfillError::Write { written, .. } = &e {
                        report.written = *written;
                    }
                    report.backfill_error = Some(e.to_string());
                }
            }
        }

        info!(
            node_id,
            points = report.point_count,
            written = report.written,
            skipped_existing = report.skipped_existing,
            offset_ns = report.offset_ns,
            "datalog export finished"
        );

        Ok(report)
    }
}
