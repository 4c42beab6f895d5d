//! In-process base station used when no hardware binding is linked.
//!
//! Produces packets at the configured rate for each configured node, keeps
//! a synthetic datalog per node, and injects faults deterministically so
//! reconnect and retry paths can be exercised without a radio.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::{DeviceInfo, Transport, TransportError};
use crate::config::SimulatedConfig;
use crate::model::{
    now_unix_nanos, sample_rate_text_to_hz, BackfillRow, DataPoint, HwTimestamp, Packet, RawValue,
    NANOS_PER_SEC,
};

/// Every Nth generated tick carries radio diagnostics.
const DIAGNOSTIC_EVERY: i64 = 32;

/// Scripted result for the next poll.
pub type ScriptedPoll = Result<Vec<Packet>, TransportError>;

pub struct SimulatedBaseStation {
    cfg: SimulatedConfig,
    emit_interval: Duration,
    connected: bool,
    connect_calls: u64,
    failing_connects: u32,
    polls: u64,
    device_ops: u64,
    tick: i64,
    last_emit: Option<Instant>,
    scripted: VecDeque<ScriptedPoll>,
    datalogs: HashMap<u32, Vec<BackfillRow>>,
}

impl SimulatedBaseStation {
    pub fn new(cfg: SimulatedConfig) -> Self {
        let emit_interval = sample_rate_text_to_hz(&cfg.rate_label)
            .filter(|hz| *hz > 0.0)
            .map(|hz| Duration::from_secs_f64(1.0 / hz))
            .unwrap_or(Duration::from_secs(1));

        Self {
            cfg,
            emit_interval,
            connected: false,
            connect_calls: 0,
            failing_connects: 0,
            polls: 0,
            device_ops: 0,
            tick: 0,
            last_emit: None,
            scripted: VecDeque::new(),
            datalogs: HashMap::new(),
        }
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&mut self, n: u32) {
        self.failing_connects = n;
    }

    /// Queue an exact result for an upcoming poll, ahead of synthesis.
    pub fn script_poll(&mut self, result: ScriptedPoll) {
        self.scripted.push_back(result);
    }

    /// Replace a node's datalog contents.
    pub fn set_datalog(&mut self, node_id: u32, rows: Vec<BackfillRow>) {
        self.datalogs.insert(node_id, rows);
    }

    pub fn connect_calls(&self) -> u64 {
        self.connect_calls
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    fn device_op(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.device_ops += 1;
        let n = self.cfg.eeprom_every_n_ops;
        if n > 0 && self.device_ops % n == 0 {
            return Err(TransportError::Device(
                "EEPROM read error: node did not respond".to_string(),
            ));
        }
        Ok(())
    }

    fn node_now_ns(&self) -> i64 {
        let lead = i64::try_from(self.cfg.node_clock_lead.as_nanos()).unwrap_or(0);
        now_unix_nanos().saturating_add(lead)
    }

    fn synthesize(&mut self) -> Vec<Packet> {
        let per_node = self.cfg.packets_per_poll.max(1);
        let mut packets = Vec::with_capacity(self.cfg.nodes.len() * per_node);

        for node in self.cfg.nodes.clone() {
            for _ in 0..per_node {
                self.tick += 1;
                let ts_ns = self.node_now_ns();
                let timestamp = Some(HwTimestamp {
                    seconds: ts_ns.div_euclid(NANOS_PER_SEC),
                    nanoseconds: ts_ns.rem_euclid(NANOS_PER_SEC),
                });

                let mut points: Vec<DataPoint> = self
                    .cfg
                    .channels
                    .iter()
                    .enumerate()
                    .map(|(idx, ch)| DataPoint {
                        channel_name: Some(ch.clone()),
                        channel_id: u8::try_from(idx + 1).ok(),
                        value: RawValue::Float(wave(self.tick, idx) as f32),
                        timestamp,
                    })
                    .collect();

                if self.tick % DIAGNOSTIC_EVERY == 0 {
                    points.push(diagnostic("diagnostic_state", RawValue::Uint8(0), timestamp));
                    points.push(diagnostic(
                        "diagnostic_totalDroppedPackets",
                        RawValue::Uint32(0),
                        timestamp,
                    ));
                }

                packets.push(Packet {
                    node_address: node,
                    rate_label: Some(self.cfg.rate_label.clone()),
                    points,
                });
            }
        }

        packets
    }

    fn generated_datalog(&self, node_id: u32) -> Vec<BackfillRow> {
        let step_ns = i64::try_from(self.emit_interval.as_nanos()).unwrap_or(NANOS_PER_SEC);
        let sweeps = i64::try_from(self.cfg.datalog_sweeps).unwrap_or(0);
        let start = self.node_now_ns() - sweeps * step_ns;
        let mut rows = Vec::with_capacity(self.cfg.datalog_sweeps * self.cfg.channels.len());

        for i in 0..sweeps {
            for (idx, ch) in self.cfg.channels.iter().enumerate() {
                rows.push(BackfillRow {
                    channel: ch.clone(),
                    value: wave(i + i64::from(node_id), idx),
                    timestamp_ns: Some(start + i * step_ns),
                    tick: Some(i),
                    session_index: Some(0),
                    sample_rate: Some(self.cfg.rate_label.clone()),
                });
            }
        }

        rows
    }
}

fn diagnostic(name: &str, value: RawValue, timestamp: Option<HwTimestamp>) -> DataPoint {
    DataPoint {
        channel_name: Some(name.to_string()),
        channel_id: None,
        value,
        timestamp,
    }
}

/// Deterministic test signal per channel.
fn wave(tick: i64, channel_idx: usize) -> f64 {
    let phase = tick as f64 * 0.05 + channel_idx as f64;
    20.0 + 5.0 * phase.sin()
}

impl Transport for SimulatedBaseStation {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&mut self) -> Result<DeviceInfo, TransportError> {
        self.connect_calls += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(TransportError::Link("serial port unavailable".to_string()));
        }

        self.connected = true;
        Ok(DeviceInfo {
            model: "SIM-BASE".to_string(),
            firmware: env!("CARGO_PKG_VERSION").to_string(),
            features: [
                "as_float",
                "as_double",
                "as_int32",
                "as_uint32",
                "as_uint16",
                "as_uint8",
                "timestamp",
                "datalog",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        })
    }

    async fn ping(&mut self) -> Result<bool, TransportError> {
        Ok(self.connected)
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Packet>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.polls += 1;

        if let Some(result) = self.scripted.pop_front() {
            if result.is_err() {
                self.connected = false;
            }
            return result;
        }

        let n = self.cfg.fail_every_n_polls;
        if n > 0 && self.polls % n == 0 {
            self.connected = false;
            return Err(TransportError::Link("radio link dropped".to_string()));
        }

        let now = Instant::now();
        if let Some(last) = self.last_emit {
            let since = now.saturating_duration_since(last);
            if since < self.emit_interval {
                tokio::time::sleep(timeout.min(self.emit_interval - since)).await;
                return Ok(Vec::new());
            }
        }
        self.last_emit = Some(now);

        Ok(self.synthesize())
    }

    async fn download_historical(
        &mut self,
        node_id: u32,
        session: Option<u32>,
    ) -> Result<Vec<BackfillRow>, TransportError> {
        self.device_op()?;

        if !self.cfg.nodes.contains(&node_id) && !self.datalogs.contains_key(&node_id) {
            return Err(TransportError::Device(format!(
                "node {node_id} did not respond"
            )));
        }

        let rows = match self.datalogs.get(&node_id) {
            Some(rows) => rows.clone(),
            None => {
                let rows = self.generated_datalog(node_id);
                self.datalogs.insert(node_id, rows.clone());
                rows
            }
        };

        Ok(match session {
            Some(s) => rows
                .into_iter()
                .filter(|r| r.session_index == Some(s))
                .collect(),
            None => rows,
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
