//! Consuming client with fault recovery
//!
//! The client consumes the live stream on a dedicated thread and folds
//! every payload into a Kahan-compensated running sum. When its state
//! is lost (an injected crash, or the producer lapping it with
//! auto-detection enabled) it rebuilds by replaying the recorded log
//! from the beginning and then hands back to the live ring at the
//! first sequence the replay did not cover, with no gap and no
//! duplicate at the boundary.
//!
//! The handoff is safe as long as the catch-up threshold is small
//! compared to the ring capacity: at the switch instant the replay
//! position is within the threshold of the live head, so the boundary
//! sequence is still deep inside the ring's retention window. If that
//! ever fails (a pathologically slow handoff), the next live read
//! returns `Overwritten` and recovery simply runs again; nothing is
//! silently lost.
//!
//! Fault entry is serialised: manual triggers deposit the fault in a
//! pending cell consumed by the worker, and auto-detected overwrites
//! take the same path on the worker itself, so one observed fault
//! produces exactly one recovery cycle.

use crate::affinity;
use crate::replay::ReplayEngine;
use crate::ring::{
    spmc::RingBuffer, AtomicF64, ConsumerCursor, Msg, ReadResult, Seq, CATCHUP_THRESHOLD,
    INVALID_SEQ,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Cursor skip applied by a [`FaultKind::MessageLoss`] fault.
const MESSAGE_LOSS_SKIP: Seq = 10;

/// Sleep applied by a [`FaultKind::TemporaryHang`] fault.
const HANG_DURATION: Duration = Duration::from_secs(1);

/// Client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Consuming the live stream.
    Normal = 0,
    /// A fault was observed; recovery has not started yet.
    Faulted = 1,
    /// Rebuilding state from the recorded log.
    Replaying = 2,
    /// Replay finished; rejoining the live stream.
    CatchingUp = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientState::Faulted,
            2 => ClientState::Replaying,
            3 => ClientState::CatchingUp,
            _ => ClientState::Normal,
        }
    }
}

/// Injectable fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Lose all accumulated state and recover from the log.
    ClientCrash,
    /// Skip ahead in the stream without recovering.
    MessageLoss,
    /// Stall the worker briefly.
    TemporaryHang,
}

/// Invoked on the worker thread when a crash fault is handled.
pub type FaultCallback = Box<dyn Fn() + Send>;

/// Observability counters for the client, readable from any thread.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Missing sequence numbers observed in accepted messages.
    pub seq_gap_count: AtomicI64,
    /// Duplicate or out-of-order messages dropped.
    pub duplicate_count: AtomicI64,
    /// Ring overwrites observed at this consumer's cursor.
    pub overwrite_count: AtomicI64,
    /// Completed or attempted recovery cycles.
    pub recovery_count: AtomicI64,
    /// Faults raised by overwrite auto-detection.
    pub auto_fault_count: AtomicI64,
}

struct ClientShared {
    stop: AtomicBool,
    running: AtomicBool,
    in_recovery: AtomicBool,
    pending_fault: Mutex<Option<FaultKind>>,
    sum: AtomicF64,
    last_seq: AtomicI64,
    processed_count: AtomicI64,
    state: AtomicU8,
    auto_fault_detection: AtomicBool,
    cursor: ConsumerCursor,
    /// Serialises the replay-to-live cursor handoff with a racing stop.
    switch_lock: Mutex<()>,
    fault_callback: Mutex<Option<FaultCallback>>,
    metrics: ClientMetrics,
}

impl ClientShared {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Consumes the live stream, accumulating payloads, and recovers from
/// faults by replaying the recorded log.
pub struct Client {
    ring: Arc<RingBuffer>,
    log_path: PathBuf,
    shared: Arc<ClientShared>,
    catchup_threshold: i64,
    cpu_core: Option<usize>,
    handle: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client over `ring` that recovers from the log at
    /// `log_path`.
    pub fn new<P: AsRef<Path>>(ring: Arc<RingBuffer>, log_path: P) -> Self {
        Self {
            ring,
            log_path: log_path.as_ref().to_path_buf(),
            shared: Arc::new(ClientShared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                in_recovery: AtomicBool::new(false),
                pending_fault: Mutex::new(None),
                sum: AtomicF64::new(0.0),
                last_seq: AtomicI64::new(INVALID_SEQ),
                processed_count: AtomicI64::new(0),
                state: AtomicU8::new(ClientState::Normal as u8),
                auto_fault_detection: AtomicBool::new(true),
                cursor: ConsumerCursor::new(),
                switch_lock: Mutex::new(()),
                fault_callback: Mutex::new(None),
                metrics: ClientMetrics::default(),
            }),
            catchup_threshold: CATCHUP_THRESHOLD,
            cpu_core: None,
            handle: None,
        }
    }

    /// Spawn the consumer thread.
    pub fn start(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            warn!("client already running, ignoring start");
            return;
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(ClientState::Normal);

        info!(log = %self.log_path.display(), "client starting");

        let worker = ClientWorker {
            ring: Arc::clone(&self.ring),
            shared: Arc::clone(&self.shared),
            log_path: self.log_path.clone(),
            catchup_threshold: self.catchup_threshold,
            kahan_c: 0.0,
            cpu_core: self.cpu_core,
        };

        let handle = thread::Builder::new()
            .name("mktdata-client".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn client thread");
        self.handle = Some(handle);
    }

    /// Signal the worker to stop and join it. An in-flight recovery is
    /// aborted at its next log read.
    pub fn stop(&mut self) {
        {
            // Taken so the stop signal cannot land in the middle of a
            // cursor handoff.
            let _guard = self.shared.switch_lock.lock();
            self.shared.stop.store(true, Ordering::Release);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        info!(
            processed = self.processed_count(),
            gaps = self.metrics().seq_gap_count.load(Ordering::Relaxed),
            duplicates = self.metrics().duplicate_count.load(Ordering::Relaxed),
            overwrites = self.metrics().overwrite_count.load(Ordering::Relaxed),
            recoveries = self.metrics().recovery_count.load(Ordering::Relaxed),
            "client stopped"
        );
    }

    /// Block until any in-flight recovery completes.
    pub fn wait_for_recovery(&self) {
        while self.shared.in_recovery.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Inject a fault. `ClientCrash` raises the recovery flag before
    /// returning so [`wait_for_recovery`](Self::wait_for_recovery)
    /// observes the cycle even if the worker has not picked it up yet.
    pub fn trigger_fault(&self, kind: FaultKind) {
        if kind == FaultKind::ClientCrash {
            self.shared.in_recovery.store(true, Ordering::Release);
        }
        *self.shared.pending_fault.lock() = Some(kind);
    }

    /// Whether the worker thread is live.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether a recovery cycle is pending or in progress.
    pub fn is_in_recovery(&self) -> bool {
        self.shared.in_recovery.load(Ordering::Acquire)
    }

    /// Current accumulated sum.
    pub fn sum(&self) -> f64 {
        self.shared.sum.load(Ordering::Acquire)
    }

    /// Messages accepted in the current epoch.
    pub fn processed_count(&self) -> i64 {
        self.shared.processed_count.load(Ordering::Acquire)
    }

    /// Sequence number of the most recently accepted message.
    pub fn last_seq(&self) -> Seq {
        self.shared.last_seq.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Register a callback invoked when a crash fault is handled.
    pub fn set_fault_callback(&self, callback: FaultCallback) {
        *self.shared.fault_callback.lock() = Some(callback);
    }

    /// Enable or disable automatic recovery on observed overwrites
    /// (default: enabled). When disabled, an overwrite skips the cursor
    /// to the live head instead.
    pub fn set_auto_fault_detection(&self, enabled: bool) {
        self.shared
            .auto_fault_detection
            .store(enabled, Ordering::Relaxed);
    }

    /// Override the catch-up threshold; call before
    /// [`start`](Self::start).
    pub fn set_catchup_threshold(&mut self, threshold: i64) {
        self.catchup_threshold = threshold;
    }

    /// Pin the worker thread to a core; call before
    /// [`start`](Self::start).
    pub fn set_cpu_core(&mut self, core_id: Option<usize>) {
        self.cpu_core = core_id;
    }

    /// Observability counters.
    pub fn metrics(&self) -> &ClientMetrics {
        &self.shared.metrics
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ClientWorker {
    ring: Arc<RingBuffer>,
    shared: Arc<ClientShared>,
    log_path: PathBuf,
    catchup_threshold: i64,
    /// Kahan compensation term. Worker-local: only this thread folds
    /// payloads into the sum.
    kahan_c: f64,
    cpu_core: Option<usize>,
}

impl ClientWorker {
    fn run(mut self) {
        affinity::pin_current_thread(self.cpu_core, "client");

        self.shared.cursor.reset(0);

        while !self.shared.stop.load(Ordering::Acquire) {
            // Bind before matching: the lock guard must not be held
            // across on_fault, which re-locks the cell after recovery.
            let pending = self.shared.pending_fault.lock().take();
            if let Some(kind) = pending {
                self.on_fault(kind);
                continue;
            }

            let seq = self.shared.cursor.read_seq();
            match self.ring.read(seq) {
                ReadResult::Ok(msg) => {
                    self.process_message(&msg);
                    self.shared.cursor.advance();
                }
                ReadResult::Overwritten => self.on_overwritten(seq),
                ReadResult::NotReady => thread::yield_now(),
            }
        }

        self.shared.running.store(false, Ordering::Release);
    }

    /// The producer lapped us; the messages between our cursor and the
    /// surviving window can only come back from disk.
    fn on_overwritten(&mut self, seq: Seq) {
        self.shared
            .metrics
            .overwrite_count
            .fetch_add(1, Ordering::Relaxed);
        self.shared
            .metrics
            .seq_gap_count
            .fetch_add(1, Ordering::Relaxed);
        warn!(seq, "ring overwrite detected at client cursor");

        if self
            .shared
            .auto_fault_detection
            .load(Ordering::Relaxed)
        {
            self.shared
                .metrics
                .auto_fault_count
                .fetch_add(1, Ordering::Relaxed);
            self.on_fault(FaultKind::ClientCrash);
        } else {
            let latest = self.ring.latest_seq();
            if latest >= 0 {
                self.shared.cursor.set_read_seq(latest + 1);
            }
        }
    }

    /// Fold one message into the accumulator.
    ///
    /// Accepted sequence numbers grow strictly: duplicates and
    /// out-of-order messages are dropped and counted, gaps are counted
    /// but the message is accepted.
    fn process_message(&mut self, msg: &Msg) {
        let prev = self.shared.last_seq.load(Ordering::Relaxed);

        if prev != INVALID_SEQ && msg.seq_num <= prev {
            warn!(
                prev,
                got = msg.seq_num,
                "client dropped duplicate or out-of-order message"
            );
            self.shared
                .metrics
                .duplicate_count
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if prev != INVALID_SEQ && msg.seq_num != prev + 1 {
            let gap = msg.seq_num - prev - 1;
            self.shared
                .metrics
                .seq_gap_count
                .fetch_add(gap, Ordering::Relaxed);
            warn!(expected = prev + 1, got = msg.seq_num, gap, "client sequence gap");
        }

        let y = msg.payload - self.kahan_c;
        let sum = self.shared.sum.load(Ordering::Relaxed);
        let t = sum + y;
        self.kahan_c = (t - sum) - y;
        self.shared.sum.store(t, Ordering::Release);

        self.shared.last_seq.store(msg.seq_num, Ordering::Release);
        self.shared.processed_count.fetch_add(1, Ordering::Release);
    }

    fn on_fault(&mut self, kind: FaultKind) {
        match kind {
            FaultKind::ClientCrash => {
                warn!("client fault: crash, starting recovery");
                self.shared.set_state(ClientState::Faulted);
                self.shared.sum.store(0.0, Ordering::Release);
                self.kahan_c = 0.0;
                self.shared.last_seq.store(INVALID_SEQ, Ordering::Release);
                self.shared.processed_count.store(0, Ordering::Release);

                if let Some(callback) = self.shared.fault_callback.lock().as_ref() {
                    callback();
                }

                self.recover();
            }
            FaultKind::MessageLoss => {
                warn!(skip = MESSAGE_LOSS_SKIP, "client fault: message loss");
                let seq = self.shared.cursor.read_seq();
                self.shared.cursor.set_read_seq(seq + MESSAGE_LOSS_SKIP);
            }
            FaultKind::TemporaryHang => {
                warn!("client fault: temporary hang");
                thread::sleep(HANG_DURATION);
            }
        }
    }

    /// Rebuild the accumulator by replaying the log, then hand off to
    /// the live ring.
    ///
    /// The boundary is gap-free and duplicate-free: the cursor is set
    /// to exactly one past the last replayed sequence while that
    /// position is still inside the ring's retention window (the
    /// catch-up threshold is far smaller than the capacity). If the
    /// log runs out before the live head is within reach, the cursor
    /// resumes from the last replayed position; a subsequent overwrite
    /// there re-enters recovery rather than losing data silently.
    fn recover(&mut self) {
        self.shared.in_recovery.store(true, Ordering::Release);
        self.shared.set_state(ClientState::Replaying);
        self.shared
            .metrics
            .recovery_count
            .fetch_add(1, Ordering::Relaxed);

        info!(log = %self.log_path.display(), "client recovery started");

        let mut replay = ReplayEngine::new(&self.log_path);
        if let Err(err) = replay.open() {
            // Best effort: without a log there is nothing to rebuild
            // from, so resume live consumption at zero state.
            error!(error = %err, "cannot open replay log, abandoning recovery");
            self.shared.in_recovery.store(false, Ordering::Release);
            self.shared.set_state(ClientState::Normal);
            return;
        }

        let mut last_replay_seq = INVALID_SEQ;
        let mut switched = false;

        while !self.shared.stop.load(Ordering::Acquire) {
            let Some(msg) = replay.next_message() else {
                break;
            };

            self.process_message(&msg);
            last_replay_seq = msg.seq_num;

            let live_seq = self.ring.latest_seq();
            if live_seq >= 0 && msg.seq_num >= live_seq - self.catchup_threshold {
                self.shared.set_state(ClientState::CatchingUp);

                let boundary = msg.seq_num + 1;
                self.switch_to_live(boundary);
                switched = true;

                info!(
                    last_replay_seq = msg.seq_num,
                    first_live_seq = boundary,
                    live_head = live_seq,
                    "replay-to-live boundary"
                );
                break;
            }
        }
        replay.close();

        if !switched && last_replay_seq != INVALID_SEQ {
            self.shared.cursor.set_read_seq(last_replay_seq + 1);
            info!(
                resume_seq = last_replay_seq + 1,
                "replay exhausted log, resuming live without switch"
            );
        }

        // A crash queued while this cycle ran is the same fault
        // observed twice; one rebuild already covers it.
        {
            let mut pending = self.shared.pending_fault.lock();
            if *pending == Some(FaultKind::ClientCrash) {
                *pending = None;
            }
        }

        self.shared.in_recovery.store(false, Ordering::Release);
        self.shared.set_state(ClientState::Normal);
        info!(last_replay_seq, "client recovery finished");
    }

    /// Retarget the cursor from the log to the live ring.
    fn switch_to_live(&self, expected_seq: Seq) {
        let _guard = self.shared.switch_lock.lock();

        let latest = self.ring.latest_seq();
        let oldest_available = (latest - self.ring.capacity() as i64 + 1).max(0);
        if expected_seq < oldest_available {
            warn!(
                expected_seq,
                oldest_available, "handoff target already overwritten, recovery will re-trigger"
            );
        }

        self.shared.cursor.set_read_seq(expected_seq);
        info!(
            expected_seq,
            oldest_available, latest, "client switched to live stream"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ClientState::Normal,
            ClientState::Faulted,
            ClientState::Replaying,
            ClientState::CatchingUp,
        ] {
            assert_eq!(ClientState::from_u8(state as u8), state);
        }
        // Unknown values decode to Normal.
        assert_eq!(ClientState::from_u8(42), ClientState::Normal);
    }

    #[test]
    fn crash_trigger_raises_recovery_flag_immediately() {
        let ring = Arc::new(RingBuffer::new(16));
        let client = Client::new(ring, "/nonexistent/path.bin");

        assert!(!client.is_in_recovery());
        client.trigger_fault(FaultKind::ClientCrash);
        assert!(client.is_in_recovery());

        // Non-crash faults do not.
        let ring = Arc::new(RingBuffer::new(16));
        let client = Client::new(ring, "/nonexistent/path.bin");
        client.trigger_fault(FaultKind::MessageLoss);
        assert!(!client.is_in_recovery());
    }
}
