//! Bounded in-process log retention.
//!
//! [`LogRing`] keeps the most recent formatted log lines so operators can
//! read them over HTTP. [`RingLayer`] feeds it from `tracing`; install it
//! next to the fmt layer so every line goes to both places.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::model::{now_unix_nanos, ns_to_iso_utc};

/// One retained log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Fixed-capacity ring of log entries; the oldest entry is evicted first.
#[derive(Debug)]
pub struct LogRing {
    entries: parking_lot::Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` most recent entries, oldest first. `None` returns all.
    pub fn recent(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// `tracing` layer copying events into a [`LogRing`].
///
/// Level filtering is left to the subscriber's filter.
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        self.ring.push(LogEntry {
            ts: ns_to_iso_utc(now_unix_nanos()).unwrap_or_default(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Renders `message` followed by ` key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            ts: String::new(),
            level: "INFO".to_string(),
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(entry(&format!("line {i}")));
        }

        let messages: Vec<String> = ring.recent(None).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_recent_limit_keeps_newest() {
        let ring = LogRing::new(10);
        for i in 0..4 {
            ring.push(entry(&format!("line {i}")));
        }

        let messages: Vec<String> = ring.recent(Some(2)).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3"]);
        assert_eq!(ring.recent(Some(100)).len(), 4);

        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_layer_captures_message_and_fields() {
        let ring = Arc::new(LogRing::new(8));
        let subscriber = tracing_subscriber::registry().with(RingLayer::new(Arc::clone(&ring)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(node_id = 7, channel = "ch1", "no ch1 data");
        });

        let entries = ring.recent(None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "no ch1 data node_id=7 channel=ch1");
        assert!(entries[0].ts.ends_with('Z'));
    }
}
