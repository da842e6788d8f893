//! Ring-to-disk recorder
//!
//! The recorder is the designated durable consumer: a dedicated thread
//! drains the ring at its own cursor and appends every message to the
//! log in batches. Messages reach the log in strictly increasing
//! sequence order; when the producer laps the recorder a gap is forced,
//! counted and logged, and recording continues from a position safely
//! inside the retention window.
//!
//! Alongside the records the recorder maintains a Kahan-compensated
//! running sum of payloads. Consumers that rebuild their state from the
//! log are expected to converge on this sum, so it doubles as the
//! ground truth for end-to-end verification.

use crate::affinity;
use crate::disk::writer::LogWriter;
use crate::disk::Result;
use crate::ring::{
    spmc::RingBuffer, AtomicF64, ConsumerCursor, Msg, ReadResult, Seq, DISK_BATCH_SIZE,
    INVALID_SEQ,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Observability counters for the recorder, readable from any thread.
#[derive(Debug, Default)]
pub struct RecorderMetrics {
    /// Sequence numbers skipped because the producer lapped us.
    pub seq_gap_count: AtomicI64,
    /// Ring overwrites observed at this consumer's cursor.
    pub overwrite_count: AtomicI64,
}

struct RecorderShared {
    stop: AtomicBool,
    running: AtomicBool,
    recorded_count: AtomicI64,
    last_seq: AtomicI64,
    expected_sum: AtomicF64,
    cursor: ConsumerCursor,
    metrics: RecorderMetrics,
}

/// Drains the ring into an append-only log on a dedicated thread.
pub struct Recorder {
    ring: Arc<RingBuffer>,
    output_path: PathBuf,
    shared: Arc<RecorderShared>,
    batch_size: usize,
    cpu_core: Option<usize>,
    handle: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Create a recorder that persists `ring` to `output_path`.
    pub fn new<P: AsRef<Path>>(ring: Arc<RingBuffer>, output_path: P) -> Self {
        Self {
            ring,
            output_path: output_path.as_ref().to_path_buf(),
            shared: Arc::new(RecorderShared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                recorded_count: AtomicI64::new(0),
                last_seq: AtomicI64::new(INVALID_SEQ),
                expected_sum: AtomicF64::new(0.0),
                cursor: ConsumerCursor::new(),
                metrics: RecorderMetrics::default(),
            }),
            batch_size: DISK_BATCH_SIZE,
            cpu_core: None,
            handle: None,
        }
    }

    /// Open the log and spawn the recorder thread.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.running.load(Ordering::Acquire) {
            warn!("recorder already running, ignoring start");
            return Ok(());
        }

        let writer = LogWriter::create(&self.output_path)?;

        self.shared.stop.store(false, Ordering::Release);
        self.shared.recorded_count.store(0, Ordering::Release);
        self.shared.last_seq.store(INVALID_SEQ, Ordering::Release);
        self.shared.expected_sum.store(0.0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        info!(
            output = %self.output_path.display(),
            batch_size = self.batch_size,
            "recorder starting"
        );

        let worker = RecorderWorker {
            ring: Arc::clone(&self.ring),
            shared: Arc::clone(&self.shared),
            writer,
            batch: Vec::with_capacity(self.batch_size),
            batch_size: self.batch_size,
            kahan_c: 0.0,
            cpu_core: self.cpu_core,
        };

        let handle = thread::Builder::new()
            .name("mktdata-recorder".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn recorder thread");
        self.handle = Some(handle);
        Ok(())
    }

    /// Signal the worker to stop and join it. The worker flushes its
    /// partial batch and closes the log (setting the cleanly-closed
    /// flag) before exiting.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        info!(
            recorded = self.recorded_count(),
            gaps = self.metrics().seq_gap_count.load(Ordering::Relaxed),
            overwrites = self.metrics().overwrite_count.load(Ordering::Relaxed),
            "recorder stopped"
        );
    }

    /// Whether the worker thread is live.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Messages persisted so far.
    pub fn recorded_count(&self) -> i64 {
        self.shared.recorded_count.load(Ordering::Acquire)
    }

    /// Sequence number of the most recently persisted message.
    pub fn last_seq(&self) -> Seq {
        self.shared.last_seq.load(Ordering::Acquire)
    }

    /// Kahan-compensated sum of all persisted payloads.
    pub fn expected_sum(&self) -> f64 {
        self.shared.expected_sum.load(Ordering::Acquire)
    }

    /// Number of messages buffered before each disk write.
    pub fn set_batch_size(&mut self, size: usize) {
        self.batch_size = size.max(1);
    }

    /// Pin the worker thread to a core; call before
    /// [`start`](Self::start).
    pub fn set_cpu_core(&mut self, core_id: Option<usize>) {
        self.cpu_core = core_id;
    }

    /// Observability counters.
    pub fn metrics(&self) -> &RecorderMetrics {
        &self.shared.metrics
    }

    /// Path of the output log.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RecorderWorker {
    ring: Arc<RingBuffer>,
    shared: Arc<RecorderShared>,
    writer: LogWriter,
    batch: Vec<Msg>,
    batch_size: usize,
    kahan_c: f64,
    cpu_core: Option<usize>,
}

impl RecorderWorker {
    fn run(mut self) {
        affinity::pin_current_thread(self.cpu_core, "recorder");

        self.shared.cursor.reset(0);

        while !self.shared.stop.load(Ordering::Acquire) {
            let seq = self.shared.cursor.read_seq();

            match self.ring.read(seq) {
                ReadResult::Ok(msg) => self.record(msg),
                ReadResult::Overwritten => self.reattach(seq),
                ReadResult::NotReady => {
                    if !self.batch.is_empty() {
                        self.write_batch();
                    }
                    thread::yield_now();
                }
            }
        }

        self.write_batch();
        if let Err(err) = self.writer.close() {
            error!(error = %err, "failed to close log writer");
        }
        self.shared.running.store(false, Ordering::Release);
        info!(
            recorded = self.shared.recorded_count.load(Ordering::Acquire),
            "recorder completed"
        );
    }

    fn record(&mut self, msg: Msg) {
        let prev = self.shared.last_seq.load(Ordering::Relaxed);

        if prev != INVALID_SEQ && msg.seq_num <= prev {
            warn!(
                got = msg.seq_num,
                prev, "recorder dropped duplicate or out-of-order message"
            );
            self.shared.cursor.advance();
            return;
        }
        if prev != INVALID_SEQ && msg.seq_num != prev + 1 {
            let gap = msg.seq_num - prev - 1;
            self.shared
                .metrics
                .seq_gap_count
                .fetch_add(gap, Ordering::Relaxed);
            warn!(
                expected = prev + 1,
                got = msg.seq_num,
                gap,
                "recorder sequence gap"
            );
        }

        self.batch.push(msg);

        let y = msg.payload - self.kahan_c;
        let sum = self.shared.expected_sum.load(Ordering::Relaxed);
        let t = sum + y;
        self.kahan_c = (t - sum) - y;
        self.shared.expected_sum.store(t, Ordering::Release);

        self.shared.last_seq.store(msg.seq_num, Ordering::Release);
        self.shared.recorded_count.fetch_add(1, Ordering::Release);
        self.shared.cursor.advance();

        if self.batch.len() >= self.batch_size {
            self.write_batch();
        }
    }

    /// The producer lapped us; the skipped messages are gone for good.
    fn reattach(&mut self, seq: Seq) {
        self.shared
            .metrics
            .overwrite_count
            .fetch_add(1, Ordering::Relaxed);
        error!(
            seq,
            "recorder lapped by producer, data loss is permanent; consider a larger ring"
        );

        let latest = self.ring.latest_seq();
        if latest >= 0 {
            // Re-attach half a capacity behind the head. The margin is
            // a heuristic: close enough to resume promptly, far enough
            // that the producer does not lap us again immediately.
            let new_pos = (seq + 1).max(latest - self.ring.capacity() as i64 / 2);
            self.shared.cursor.set_read_seq(new_pos);
        } else {
            self.shared.cursor.advance();
        }

        if !self.batch.is_empty() {
            self.write_batch();
        }
    }

    fn write_batch(&mut self) {
        if self.batch.is_empty() {
            // Header refresh only; keeps crash recovery current while
            // the stream is idle.
            if let Err(err) = self.writer.flush() {
                error!(error = %err, "log flush failed");
            }
            return;
        }

        for msg in &self.batch {
            if let Err(err) = self.writer.write(msg) {
                error!(error = %err, seq = msg.seq_num, "log append failed");
                break;
            }
        }
        self.batch.clear();

        if let Err(err) = self.writer.flush() {
            error!(error = %err, "log flush failed");
        }
    }
}
