//! Health status derived from link, pause and queue state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::stream::pause::PauseGate;
use crate::stream::queue::PacketQueue;
use crate::transport::connection::ConnectionManager;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Degraded,
}

/// Point-in-time readings a health report is computed from.
#[derive(Debug, Clone, Copy)]
pub struct LinkProbe {
    pub connected: bool,
    pub last_ping_age: Option<Duration>,
    pub ping_ttl: Duration,
    pub pause_remaining: Duration,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

/// Body of `GET /healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub reasons: Vec<&'static str>,
    pub base_connected: bool,
    pub last_ping_age_secs: Option<f64>,
    pub pause_remaining_secs: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

impl HealthReport {
    pub fn evaluate(probe: &LinkProbe) -> Self {
        let mut reasons = Vec::new();
        if !probe.connected {
            reasons.push("base_disconnected");
        } else if !probe.last_ping_age.is_some_and(|age| age <= probe.ping_ttl) {
            reasons.push("ping_stale");
        }
        if !probe.pause_remaining.is_zero() {
            reasons.push("stream_paused");
        }

        Self {
            status: if reasons.is_empty() {
                HealthState::Ok
            } else {
                HealthState::Degraded
            },
            reasons,
            base_connected: probe.connected,
            last_ping_age_secs: probe.last_ping_age.map(|d| d.as_secs_f64()),
            pause_remaining_secs: probe.pause_remaining.as_secs_f64(),
            queue_depth: probe.queue_depth,
            queue_capacity: probe.queue_capacity,
        }
    }
}

/// Anything that can report current pipeline readings.
pub trait StatusSource: Send + Sync + 'static {
    fn probe(&self) -> LinkProbe;
}

/// Status of a running pipeline, read without taking the operation lock.
pub struct PipelineStatus<T: Transport> {
    conn: Arc<ConnectionManager<T>>,
    pause: Arc<PauseGate>,
    queue: Arc<PacketQueue>,
}

impl<T: Transport> PipelineStatus<T> {
    pub fn new(
        conn: Arc<ConnectionManager<T>>,
        pause: Arc<PauseGate>,
        queue: Arc<PacketQueue>,
    ) -> Self {
        Self { conn, pause, queue }
    }
}

impl<T: Transport> StatusSource for PipelineStatus<T> {
    fn probe(&self) -> LinkProbe {
        LinkProbe {
            connected: self.conn.is_connected(),
            last_ping_age: self.conn.last_ping_age(),
            ping_ttl: self.conn.ping_ttl(),
            pause_remaining: self.pause.remaining(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> LinkProbe {
        LinkProbe {
            connected: true,
            last_ping_age: Some(Duration::from_secs(1)),
            ping_ttl: Duration::from_secs(10),
            pause_remaining: Duration::ZERO,
            queue_depth: 3,
            queue_capacity: 2000,
        }
    }

    #[test]
    fn test_healthy_link_is_ok() {
        let report = HealthReport::evaluate(&probe());
        assert_eq!(report.status, HealthState::Ok);
        assert!(report.reasons.is_empty());
        assert_eq!(report.queue_depth, 3);
    }

    #[test]
    fn test_disconnected_skips_ping_check() {
        let report = HealthReport::evaluate(&LinkProbe {
            connected: false,
            last_ping_age: None,
            ..probe()
        });
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.reasons, vec!["base_disconnected"]);
    }

    #[test]
    fn test_stale_ping_and_pause() {
        let report = HealthReport::evaluate(&LinkProbe {
            last_ping_age: Some(Duration::from_secs(11)),
            pause_remaining: Duration::from_millis(1500),
            ..probe()
        });
        assert_eq!(report.reasons, vec!["ping_stale", "stream_paused"]);
        assert_eq!(report.pause_remaining_secs, 1.5);
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_value(HealthReport::evaluate(&probe())).expect("serialize");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["base_connected"], true);
        assert_eq!(json["queue_capacity"], 2000);
    }
}
