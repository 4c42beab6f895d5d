//! Live streaming pipeline: reader -> bounded queue -> writer -> sink.

pub mod decode;
pub mod dedup;
pub mod pause;
pub mod queue;
pub mod reader;
pub mod resample;
pub mod writer;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use self::pause::PauseGate;
use self::queue::PacketQueue;
use self::reader::PacketReader;
use self::writer::BatchWriter;
use crate::config::StreamConfig;
use crate::export::health::HealthMetrics;
use crate::sink::Sink;
use crate::transport::{ConnectionManager, Transport};

/// Running reader/writer pair.
pub struct StreamHandle {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamHandle {
    /// Stops both tasks. The writer flushes what it still holds first.
    pub async fn stop(self) {
        self.cancel.cancel();

        if let Err(e) = self.reader.await {
            error!(error = %e, "stream reader task failed");
        }
        if let Err(e) = self.writer.await {
            error!(error = %e, "stream writer task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

/// Spawns the reader and writer tasks sharing `queue`.
///
/// `cancel` is a parent token; stopping the handle cancels only a child.
pub fn start_streaming<T: Transport, S: Sink>(
    conn: Arc<ConnectionManager<T>>,
    sink: Arc<S>,
    queue: Arc<PacketQueue>,
    pause: Arc<PauseGate>,
    metrics: Arc<HealthMetrics>,
    cfg: &StreamConfig,
    cancel: &CancellationToken,
) -> StreamHandle {
    let cancel = cancel.child_token();

    let reader = PacketReader::new(
        Arc::clone(&conn),
        Arc::clone(&queue),
        pause,
        Arc::clone(&metrics),
        cfg,
    );
    let writer = BatchWriter::new(sink, queue, conn, metrics, cfg);

    info!(
        queue_max = cfg.queue_max,
        batch_size = cfg.batch_size,
        "starting stream pipeline"
    );

    StreamHandle {
        reader: tokio::spawn(reader.run(cancel.clone())),
        writer: tokio::spawn(writer.run(cancel.clone())),
        cancel,
    }
}
