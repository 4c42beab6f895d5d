use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sensorbridge::backfill::{BackfillService, BackfillStats};
use sensorbridge::config::{
    BackfillConfig, ConnectionConfig, OffsetConfig, SimulatedConfig, StreamConfig,
};
use sensorbridge::export::health::HealthMetrics;
use sensorbridge::model::{BackfillRow, NANOS_PER_SEC};
use sensorbridge::offset::{ClockOffsetReconciler, SinkOffsetStore};
use sensorbridge::sink::MemorySink;
use sensorbridge::stream::pause::PauseGate;
use sensorbridge::stream::queue::PacketQueue;
use sensorbridge::stream::start_streaming;
use sensorbridge::transport::simulated::SimulatedBaseStation;
use sensorbridge::transport::ConnectionManager;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000 * NANOS_PER_SEC;

struct Running {
    sink: Arc<MemorySink>,
    metrics: Arc<HealthMetrics>,
}

/// Runs the simulated station through the live pipeline for `secs` of
/// (paused) time.
async fn stream_for(sim: SimulatedConfig, cfg: StreamConfig, secs: u64) -> Running {
    let sink = Arc::new(MemorySink::new());
    let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let conn = Arc::new(ConnectionManager::new(
        SimulatedBaseStation::new(sim),
        ConnectionConfig {
            connect_min_interval: Duration::ZERO,
            ..Default::default()
        },
    ));

    let cancel = CancellationToken::new();
    let handle = start_streaming(
        conn,
        Arc::clone(&sink),
        Arc::new(PacketQueue::new(cfg.queue_max)),
        Arc::new(PauseGate::new()),
        Arc::clone(&metrics),
        &cfg,
        &cancel,
    );

    tokio::time::sleep(Duration::from_secs(secs)).await;
    handle.stop().await;

    Running { sink, metrics }
}

#[tokio::test(start_paused = true)]
async fn strict_tie_break_keeps_streamed_identities_unique() {
    // Packets of one poll share a node clock reading.
    let run = stream_for(
        SimulatedConfig {
            nodes: vec![1, 2],
            packets_per_poll: 3,
            ..Default::default()
        },
        StreamConfig {
            strict_tie_break: true,
            ..Default::default()
        },
        3,
    )
    .await;

    let raw = run.sink.points_in("mscl_sensors");
    assert!(!raw.is_empty());

    let mut seen = HashSet::new();
    for p in &raw {
        let key = (
            p.tag_value("node_id").map(str::to_string),
            p.tag_value("channel").map(str::to_string),
            p.timestamp_ns,
        );
        assert!(seen.insert(key), "duplicate point identity {p:?}");
    }

    assert_eq!(run.metrics.points_written.get(), raw.len() as f64);
    assert_eq!(
        run.metrics.points_written_resampled.get(),
        run.sink.points_in("mscl_sensors_resampled").len() as f64
    );
}

#[tokio::test(start_paused = true)]
async fn reader_recovers_from_link_drops() {
    let run = stream_for(
        SimulatedConfig {
            fail_every_n_polls: 4,
            ..Default::default()
        },
        StreamConfig::default(),
        15,
    )
    .await;

    assert!(run.metrics.reader_errors.get() > 0.0);
    assert!(run.metrics.reconnect_successes.get() > 0.0);
    assert!(run.metrics.packets_read.get() > 1.0);
    assert!(!run.sink.points_in("mscl_sensors").is_empty());
}

fn row(channel: &str, ts: i64, tick: i64) -> BackfillRow {
    BackfillRow {
        channel: channel.to_string(),
        value: tick as f64,
        timestamp_ns: Some(ts),
        tick: Some(tick),
        session_index: Some(1),
        sample_rate: Some("2 Hz".to_string()),
    }
}

#[tokio::test]
async fn aligned_backfill_is_idempotent_across_offset_changes() {
    let sink = Arc::new(MemorySink::new());
    let offsets = OffsetConfig::default();
    let reconciler = ClockOffsetReconciler::new(
        SinkOffsetStore::new(Arc::clone(&sink), &offsets),
        &offsets,
    );
    let backfill = BackfillService::new(Arc::clone(&sink), "mscl_sensors", &BackfillConfig::default());

    // Node clock 45s behind the host.
    let rows: Vec<BackfillRow> = (0..6)
        .flat_map(|i| {
            let ts = T0 + i * NANOS_PER_SEC / 2;
            [row("ch1", ts, i), row("ch2", ts, i)]
        })
        .collect();
    let newest = T0 + 5 * NANOS_PER_SEC / 2;
    let now = newest + 45 * NANOS_PER_SEC;

    let estimate = reconciler.estimate_at(&rows, 16904, now).await;
    assert_eq!(estimate.offset_ns, 45 * NANOS_PER_SEC);

    let first = backfill
        .backfill(16904, &rows, estimate.offset_ns, None)
        .await
        .expect("first backfill");
    assert_eq!(first, BackfillStats { written: 12, skipped_existing: 0 });

    // A later export measures a slightly different skew; hysteresis keeps
    // the stored offset and nothing is rewritten.
    let later = reconciler.estimate_at(&rows, 16904, now + NANOS_PER_SEC).await;
    assert_eq!(later.offset_ns, estimate.offset_ns);

    let second = backfill
        .backfill(16904, &rows, later.offset_ns, None)
        .await
        .expect("second backfill");
    assert_eq!(second, BackfillStats { written: 0, skipped_existing: 12 });

    // Even under a different offset the provenance check recognizes them.
    let shifted = backfill
        .backfill(16904, &rows, estimate.offset_ns + 7 * NANOS_PER_SEC, None)
        .await
        .expect("shifted backfill");
    assert_eq!(shifted.written, 0);
}

#[tokio::test]
async fn offset_survives_restart_through_sink() {
    let sink = Arc::new(MemorySink::new());
    let offsets = OffsetConfig::default();
    let rows = vec![row("ch1", T0, 0)];
    let now = T0 + 10 * NANOS_PER_SEC;

    let first = ClockOffsetReconciler::new(SinkOffsetStore::new(Arc::clone(&sink), &offsets), &offsets);
    assert_eq!(first.estimate_at(&rows, 3, now).await.offset_ns, 10 * NANOS_PER_SEC);

    // Fresh process, empty cache: the persisted offset is reused.
    let second = ClockOffsetReconciler::new(SinkOffsetStore::new(Arc::clone(&sink), &offsets), &offsets);
    let estimate = second.estimate_at(&rows, 3, now + 2 * NANOS_PER_SEC).await;
    assert_eq!(estimate.offset_ns, 10 * NANOS_PER_SEC);
    assert_eq!(estimate.skew_ns, 12 * NANOS_PER_SEC);
}
