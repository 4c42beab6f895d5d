//! Core data types shared by the streaming, backfill and sink paths.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Nanoseconds per second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Largest valid sub-second nanosecond component.
pub const MAX_SUBSEC_NANOS: i64 = 999_999_999;

/// Device-native value carried by a data point before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Float(f32),
    Double(f64),
    Int32(i32),
    Uint32(u32),
    Int16(i16),
    Uint16(u16),
    Int8(i8),
    Uint8(u8),
    Text(String),
}

/// Timestamp embedded in a data point by the node radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwTimestamp {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl HwTimestamp {
    /// Converts to unix nanoseconds. Returns `None` when `seconds <= 0`.
    ///
    /// Out-of-range nanoseconds are clamped to `0..=999_999_999`.
    pub fn to_unix_nanos(self) -> Option<i64> {
        if self.seconds <= 0 {
            return None;
        }

        let nanos = self.nanoseconds.clamp(0, MAX_SUBSEC_NANOS);
        self.seconds
            .checked_mul(NANOS_PER_SEC)
            .and_then(|s| s.checked_add(nanos))
    }
}

/// One channel reading inside a hardware packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub channel_name: Option<String>,
    pub channel_id: Option<u8>,
    pub value: RawValue,
    pub timestamp: Option<HwTimestamp>,
}

/// A hardware-delivered bundle of readings from one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub node_address: u32,
    /// Nominal sample-rate label reported by the radio (e.g. "64 Hz").
    pub rate_label: Option<String>,
    pub points: Vec<DataPoint>,
}

/// A decoded, timestamped reading ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub node_id: u32,
    pub channel: String,
    pub value: f64,
    pub timestamp_ns: i64,
    pub source: String,
    pub tick: Option<i64>,
    pub sample_rate_hz: Option<f64>,
}

/// A decoded historical sample recovered from on-device storage.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRow {
    pub channel: String,
    pub value: f64,
    /// Node-clock timestamp. `None` when the sweep carried no usable time.
    pub timestamp_ns: Option<i64>,
    pub tick: Option<i64>,
    pub session_index: Option<u32>,
    pub sample_rate: Option<String>,
}

/// A field value as stored by the time-series sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
}

impl FieldValue {
    /// Returns the value widened to `f64`.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(v) => v,
            Self::Int(v) => v as f64,
        }
    }

    /// Returns the integer value, truncating floats.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Float(v) => v as i64,
            Self::Int(v) => v,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}i"),
        }
    }
}

/// A sink-bound record: one row of one measurement at nanosecond precision.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::with_capacity(4),
            fields: Vec::with_capacity(2),
            timestamp_ns: 0,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn timestamp(mut self, ts_ns: i64) -> Self {
        self.timestamp_ns = ts_ns;
        self
    }

    /// Returns the value of the named tag.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the named field.
    pub fn field_value(&self, key: &str) -> Option<FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

/// Current wall-clock time in unix nanoseconds.
pub fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Formats unix nanoseconds as an RFC3339 UTC string with 9 fractional digits.
pub fn ns_to_iso_utc(ns: i64) -> Option<String> {
    let secs = ns.div_euclid(NANOS_PER_SEC);
    let nanos = u32::try_from(ns.rem_euclid(NANOS_PER_SEC)).ok()?;
    let dt = DateTime::<Utc>::from_timestamp(secs, nanos)?;
    Some(dt.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string())
}

/// Converts a radio sample-rate label to Hz.
///
/// Understands "N kHz", "N Hz" and "every N second/minute/hour" forms.
pub fn sample_rate_text_to_hz(label: &str) -> Option<f64> {
    let text = label.trim().to_lowercase().replace('-', " ");
    if text.is_empty() {
        return None;
    }

    if let Some(n) = number_before(&text, "khz") {
        return Some(n as f64 * 1000.0);
    }

    if let Some(n) = number_before(&text, "hz") {
        return Some(n as f64);
    }

    for (unit, secs) in [("second", 1u64), ("minute", 60), ("hour", 3600)] {
        if let Some(n) = every_n(&text, unit) {
            let period = n.checked_mul(secs)?;
            return (period > 0).then(|| 1.0 / period as f64);
        }
    }

    None
}

/// Finds the first `<digits>\s*<unit>` occurrence and returns the digits.
fn number_before(text: &str, unit: &str) -> Option<u64> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(unit) {
        let at = search_from + pos;
        let head = text[..at].trim_end();
        let digits: String = head
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
        search_from = at + unit.len();
    }
    None
}

/// Matches `every\s+<digits>\s*<unit>`.
fn every_n(text: &str, unit: &str) -> Option<u64> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find("every") {
        let at = search_from + pos + "every".len();
        let rest = &text[at..];
        let trimmed = rest.trim_start();
        if trimmed.len() < rest.len() {
            let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
            if !digits.is_empty() && trimmed[digits.len()..].trim_start().starts_with(unit) {
                return digits.parse().ok();
            }
        }
        search_from = at;
    }
    None
}
