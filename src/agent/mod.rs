pub mod datalog;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::datalog::{DatalogExporter, ExportError, ExportReport, ExportRequest};
use crate::backfill::{BackfillError, BackfillService, BackfillStats};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::status::{HealthReport, PipelineStatus, StatusSource};
use crate::model::BackfillRow;
use crate::observability::LogRing;
use crate::offset::{ClockOffsetReconciler, OffsetEstimate, SinkOffsetStore};
use crate::sink::Sink;
use crate::stream::dedup::TieBreakMode;
use crate::stream::pause::PauseGate;
use crate::stream::queue::PacketQueue;
use crate::stream::{start_streaming, StreamHandle};
use crate::transport::{ConnectionManager, Transport};

type Reconciler<S> = ClockOffsetReconciler<SinkOffsetStore<S>>;

/// Agent wires the link, the live pipeline, backfill and the health server.
pub struct Agent<T: Transport, S: Sink> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    logs: Arc<LogRing>,
    conn: Arc<ConnectionManager<T>>,
    queue: Arc<PacketQueue>,
    pause: Arc<PauseGate>,
    sink: Arc<S>,
    reconciler: Arc<Reconciler<S>>,
    backfill: Arc<BackfillService<S>>,
    exporter: DatalogExporter<T, S, SinkOffsetStore<S>>,
    stream: Option<StreamHandle>,
    cancel: CancellationToken,
}

impl<T: Transport, S: Sink> Agent<T, S> {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config, transport: T, sink: S, logs: Arc<LogRing>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let sink = Arc::new(sink);
        let conn = Arc::new(ConnectionManager::new(transport, cfg.connection.clone()));
        let queue = Arc::new(PacketQueue::new(cfg.stream.queue_max));
        let pause = Arc::new(PauseGate::new());

        let reconciler = Arc::new(ClockOffsetReconciler::new(
            SinkOffsetStore::new(Arc::clone(&sink), &cfg.offset),
            &cfg.offset,
        ));
        let backfill = Arc::new(
            BackfillService::new(Arc::clone(&sink), cfg.stream.measurement.as_str(), &cfg.backfill)
                .with_tie_break(TieBreakMode::from_strict(cfg.stream.strict_tie_break))
                .with_metrics(Arc::clone(&health)),
        );
        let exporter = DatalogExporter::new(
            Arc::clone(&conn),
            Arc::clone(&pause),
            Arc::clone(&reconciler),
            Arc::clone(&backfill),
            &health,
            &cfg.retry,
            &cfg.export,
        );

        Ok(Self {
            cfg,
            health,
            logs,
            conn,
            queue,
            pause,
            sink,
            reconciler,
            backfill,
            exporter,
            stream: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the health server, the link and the live pipeline.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        self.health
            .start(self.status_source(), Arc::clone(&self.logs))
            .await
            .context("starting health metrics server")?;

        // 1. Bring the link up. Failure is not fatal: the reader reconnects.
        match self.conn.connect().await {
            Ok(caps) => {
                self.health.base_connected.set(1.0);
                info!(
                    model = %caps.model,
                    hardware_timestamps = caps.hardware_timestamps,
                    datalog = caps.datalog_download,
                    decoders = caps.decoders.len(),
                    "base station connected"
                );
            }
            Err(e) => warn!(error = %e, "initial base station connect failed, reader will retry"),
        }

        // 2. Start the reader/writer pair.
        if self.cfg.stream.enabled {
            self.stream = Some(start_streaming(
                Arc::clone(&self.conn),
                Arc::clone(&self.sink),
                Arc::clone(&self.queue),
                Arc::clone(&self.pause),
                Arc::clone(&self.health),
                &self.cfg.stream,
                &self.cancel,
            ));
        } else {
            info!("streaming disabled");
        }

        // 3. Start background monitors.
        self.spawn_ping_monitor();

        info!(sink = self.sink.name(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for the writer's final flush.
        if let Some(stream) = self.stream.take() {
            stream.stop().await;
        }

        self.conn.disconnect().await;
        self.health.base_connected.set(0.0);

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Node-to-host clock offset for `rows`, with hysteresis.
    pub async fn estimate_offset(&self, rows: &[BackfillRow], node_id: u32) -> OffsetEstimate {
        self.reconciler.estimate(rows, node_id).await
    }

    /// Idempotently write historical rows for `node_id`.
    pub async fn backfill(
        &self,
        node_id: u32,
        rows: &[BackfillRow],
        offset_ns: i64,
        source_tag: Option<&str>,
    ) -> Result<BackfillStats, BackfillError> {
        self.backfill
            .backfill(node_id, rows, offset_ns, source_tag)
            .await
    }

    /// Download a node's datalog and optionally ingest it.
    pub async fn export_datalog(
        &self,
        node_id: u32,
        req: &ExportRequest,
    ) -> Result<ExportReport, ExportError> {
        self.exporter.export_datalog(node_id, req).await
    }

    /// Current health as served on `/healthz`.
    pub fn health_report(&self) -> HealthReport {
        HealthReport::evaluate(&self.status_source().probe())
    }

    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.pause
    }

    fn status_source(&self) -> Arc<dyn StatusSource> {
        Arc::new(PipelineStatus::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.pause),
            Arc::clone(&self.queue),
        ))
    }

    /// Spawn background link liveness monitor.
    ///
    /// Pings only when the last good ping is older than the interval, so
    /// an active reader keeps the link fresh without extra traffic.
    fn spawn_ping_monitor(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let conn = Arc::clone(&self.conn);
        let pause = Arc::clone(&self.pause);
        let interval = self.cfg.connection.ping_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !conn.is_connected() || pause.is_paused() {
                            continue;
                        }
                        if conn.last_ping_age().is_some_and(|age| age < interval) {
                            continue;
                        }

                        match conn.ping().await {
                            Ok(true) => debug!("base station ping ok"),
                            Ok(false) => {
                                health.base_connected.set(0.0);
                                warn!("base station ping failed");
                            }
                            Err(e) => {
                                health.base_connected.set(0.0);
                                warn!(error = %e, "base station ping error");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SimulatedConfig;
    use crate::export::status::HealthState;
    use crate::sink::MemorySink;
    use crate::transport::simulated::SimulatedBaseStation;

    fn config() -> Config {
        let mut cfg = Config::from_yaml("health:\n  addr: \"127.0.0.1:0\"\nsink:\n  kind: memory\n")
            .expect("config");
        cfg.stream.flush_interval = Duration::from_millis(50);
        cfg
    }

    #[tokio::test]
    async fn test_agent_streams_into_sink() {
        let sim = SimulatedBaseStation::new(SimulatedConfig::default());
        let mut agent = Agent::new(config(), sim, MemorySink::new(), Arc::new(LogRing::new(16)))
            .expect("agent");

        agent.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(agent.health_report().status, HealthState::Ok);
        agent.stop().await.expect("stop");

        assert!(agent.metrics().packets_read.get() > 0.0);
        assert!(!agent.sink.points_in("mscl_sensors").is_empty());
        assert!(!agent.sink.points_in("mscl_sensors_resampled").is_empty());
    }

    #[tokio::test]
    async fn test_agent_backfill_and_offset_entry_points() {
        let sim = SimulatedBaseStation::new(SimulatedConfig::default());
        let agent = Agent::new(config(), sim, MemorySink::new(), Arc::new(LogRing::new(16)))
            .expect("agent");

        let rows = vec![BackfillRow {
            channel: "ch1".to_string(),
            value: 1.0,
            timestamp_ns: Some(crate::model::now_unix_nanos() - 45_000_000_000),
            tick: None,
            session_index: None,
            sample_rate: None,
        }];

        let estimate = agent.estimate_offset(&rows, 7).await;
        assert!(estimate.offset_ns >= 45_000_000_000);

        let stats = agent
            .backfill(7, &rows, estimate.offset_ns, None)
            .await
            .expect("backfill");
        assert_eq!(stats.written, 1);
        assert_eq!(agent.metrics().backfill_points_written.get(), 1.0);
    }
}
