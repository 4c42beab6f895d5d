//! Producer half of the live pipeline.
//!
//! The reader owns nothing but handles: it borrows the link through the
//! connection manager for each poll, hands packets to the queue and backs
//! off exponentially while the link is down. It never exits on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pause::PauseGate;
use super::queue::PacketQueue;
use crate::config::{ReconnectConfig, StreamConfig};
use crate::export::health::HealthMetrics;
use crate::transport::{ConnectionManager, Transport};

/// Exponential reconnect delay, reset after any successful poll.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: cfg.initial,
            multiplier: cfg.multiplier.max(1.0),
            max: cfg.max,
            current: cfg.initial.min(cfg.max),
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = (self.current.as_nanos() as f64 * self.multiplier).round() as u64;
        self.current = Duration::from_nanos(grown).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

pub struct PacketReader<T: Transport> {
    conn: Arc<ConnectionManager<T>>,
    queue: Arc<PacketQueue>,
    pause: Arc<PauseGate>,
    metrics: Arc<HealthMetrics>,
    read_timeout: Duration,
    idle_sleep: Duration,
    backoff: ReconnectBackoff,
    reconnecting: bool,
}

impl<T: Transport> PacketReader<T> {
    pub fn new(
        conn: Arc<ConnectionManager<T>>,
        queue: Arc<PacketQueue>,
        pause: Arc<PauseGate>,
        metrics: Arc<HealthMetrics>,
        cfg: &StreamConfig,
    ) -> Self {
        Self {
            conn,
            queue,
            pause,
            metrics,
            read_timeout: cfg.read_timeout,
            idle_sleep: cfg.idle_sleep,
            backoff: ReconnectBackoff::new(&cfg.reconnect),
            reconnecting: false,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(timeout = ?self.read_timeout, "stream reader started");

        loop {
            let delay = tokio::select! {
                _ = cancel.cancelled() => break,
                delay = self.step() => delay,
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("stream reader stopped");
    }

    /// One reader iteration. Returns how long to sleep before the next.
    pub async fn step(&mut self) -> Duration {
        if let Some(hint) = self.pause.sleep_hint() {
            return hint;
        }

        let mut guard = self.conn.lock().await;

        if self.reconnecting {
            self.metrics.reconnect_attempts.inc();
        }
        let polled = match guard.ensure_connected().await {
            Ok(_) => {
                if self.reconnecting {
                    self.reconnecting = false;
                    self.metrics.reconnect_successes.inc();
                    info!("base station reconnected");
                }
                self.metrics.base_connected.set(1.0);
                guard.transport_mut().poll(self.read_timeout).await
            }
            Err(e) => Err(e),
        };

        let packets = match polled {
            Ok(packets) => packets,
            Err(e) => {
                guard.mark_disconnected();
                drop(guard);

                self.metrics.reader_errors.inc();
                self.metrics.base_connected.set(0.0);
                self.reconnecting = true;
                let delay = self.backoff.next_delay();
                warn!(error = %e, backoff = ?delay, "stream read failed");
                return delay;
            }
        };
        drop(guard);

        self.backoff.reset();
        if packets.is_empty() {
            return self.idle_sleep;
        }

        let count = packets.len();
        self.metrics.packets_read.inc_by(count as f64);
        let outcome = self.queue.push_all(packets);
        if outcome.dropped > 0 {
            self.metrics
                .queue_dropped_packets
                .inc_by(outcome.dropped as f64);
            debug!(
                dropped = outcome.dropped,
                depth = outcome.depth,
                "queue full, dropped oldest packets"
            );
        }
        self.metrics.queue_depth.set(outcome.depth as f64);
        self.metrics
            .queue_high_water_mark
            .set(self.queue.high_water_mark() as f64);

        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, SimulatedConfig};
    use crate::model::Packet;
    use crate::transport::simulated::SimulatedBaseStation;
    use crate::transport::TransportError;

    fn packet(node: u32) -> Packet {
        Packet {
            node_address: node,
            rate_label: None,
            points: Vec::new(),
        }
    }

    fn reader(
        sim: SimulatedBaseStation,
        queue_max: usize,
    ) -> (PacketReader<SimulatedBaseStation>, Arc<HealthMetrics>) {
        let conn = Arc::new(ConnectionManager::new(
            sim,
            ConnectionConfig {
                connect_min_interval: Duration::ZERO,
                ..Default::default()
            },
        ));
        let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let reader = PacketReader::new(
            conn,
            Arc::new(PacketQueue::new(queue_max)),
            Arc::new(PauseGate::new()),
            Arc::clone(&metrics),
            &StreamConfig::default(),
        );
        (reader, metrics)
    }

    #[test]
    fn test_backoff_schedule() {
        let mut b = ReconnectBackoff::new(&ReconnectConfig::default());
        let delays: Vec<u128> = (0..7).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1000, 1700, 2890, 4913, 8352, 10000, 10000]);

        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_queues_packets() {
        let mut sim = SimulatedBaseStation::new(SimulatedConfig::default());
        sim.script_poll(Ok(vec![packet(1), packet(2)]));
        let (mut reader, metrics) = reader(sim, 10);

        assert_eq!(reader.step().await, Duration::ZERO);
        assert_eq!(reader.queue.len(), 2);
        assert_eq!(metrics.packets_read.get(), 2.0);
        assert_eq!(metrics.base_connected.get(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_drops_oldest_on_overflow() {
        let mut sim = SimulatedBaseStation::new(SimulatedConfig::default());
        sim.script_poll(Ok(vec![packet(1), packet(2), packet(3)]));
        let (mut reader, metrics) = reader(sim, 2);

        reader.step().await;
        let kept: Vec<u32> = reader
            .queue
            .drain_all()
            .iter()
            .map(|p| p.node_address)
            .collect();
        assert_eq!(kept, vec![2, 3]);
        assert_eq!(metrics.queue_dropped_packets.get(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_reset() {
        let mut sim = SimulatedBaseStation::new(SimulatedConfig::default());
        for _ in 0..3 {
            sim.script_poll(Err(TransportError::Link("radio link dropped".to_string())));
        }
        sim.script_poll(Ok(vec![packet(1)]));
        let (mut reader, metrics) = reader(sim, 10);

        assert_eq!(reader.step().await, Duration::from_millis(1000));
        assert_eq!(reader.step().await, Duration::from_millis(1700));
        assert_eq!(reader.step().await, Duration::from_millis(2890));
        assert_eq!(metrics.base_connected.get(), 0.0);

        assert_eq!(reader.step().await, Duration::ZERO);
        assert_eq!(reader.backoff.current(), Duration::from_secs(1));

        assert_eq!(metrics.reader_errors.get(), 3.0);
        assert_eq!(metrics.reconnect_attempts.get(), 3.0);
        assert_eq!(metrics.reconnect_successes.get(), 3.0);
        assert_eq!(reader.conn.lock().await.transport_mut().connect_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_backs_off() {
        let mut sim = SimulatedBaseStation::new(SimulatedConfig::default());
        sim.fail_next_connects(1);
        let (mut reader, metrics) = reader(sim, 10);

        assert_eq!(reader.step().await, Duration::from_secs(1));
        assert_eq!(metrics.reader_errors.get(), 1.0);
        assert_eq!(reader.conn.lock().await.transport_mut().polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_reader_does_not_poll() {
        let sim = SimulatedBaseStation::new(SimulatedConfig::default());
        let (mut reader, _metrics) = reader(sim, 10);
        reader.pause.pause_for(Duration::from_secs(2), "test");

        assert_eq!(reader.step().await, Duration::from_millis(250));
        assert_eq!(reader.conn.lock().await.transport_mut().polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let sim = SimulatedBaseStation::new(SimulatedConfig::default());
        let (reader, metrics) = reader(sim, 100);
        let queue = Arc::clone(&reader.queue);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.expect("reader task");

        assert!(metrics.packets_read.get() > 0.0);
        assert!(!queue.is_empty());
    }
}
