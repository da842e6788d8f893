//! End-to-end recovery scenarios: feed, client and recorder over one
//! ring, with fault injection and replay-to-live handoff.

use mktdata_replay::{Client, FaultKind, Feed, Recorder, RingBuffer};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const SUM_TOLERANCE: f64 = 1e-9;
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

struct Harness {
    _dir: TempDir,
    log_path: PathBuf,
    ring: Arc<RingBuffer>,
    feed: Feed,
    client: Client,
    recorder: Recorder,
    messages: i64,
}

impl Harness {
    fn new(ring_capacity: usize, messages: i64, rate: i64) -> Self {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("mktdata_test.bin");

        let ring = Arc::new(RingBuffer::new(ring_capacity));

        let mut feed = Feed::new(Arc::clone(&ring));
        feed.set_message_count(messages);
        feed.set_rate(rate);
        // Deterministic payloads so reruns are comparable.
        let mut i = 0_i64;
        feed.set_generator(Box::new(move || {
            i += 1;
            (i % 1_000) as f64 * 0.25
        }));

        let client = Client::new(Arc::clone(&ring), &log_path);
        let recorder = Recorder::new(Arc::clone(&ring), &log_path);

        Self {
            _dir: dir,
            log_path,
            ring,
            feed,
            client,
            recorder,
            messages,
        }
    }

    fn start(&mut self) {
        self.recorder.start().unwrap();
        self.client.start();
        self.feed.start();
    }

    /// Wait for the feed to finish and both consumers to drain the
    /// tail, then stop everything.
    fn drain_and_stop(&mut self) {
        self.feed.wait_for_complete();

        let deadline = Instant::now() + DRAIN_DEADLINE;
        while (self.client.last_seq() < self.messages - 1
            || self.recorder.last_seq() < self.messages - 1)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(
            Instant::now() < deadline,
            "consumers failed to drain: client at {}, recorder at {}, stream of {}",
            self.client.last_seq(),
            self.recorder.last_seq(),
            self.messages
        );
        // Margin for the final accumulator stores.
        thread::sleep(Duration::from_millis(50));

        self.client.stop();
        self.recorder.stop();
    }

    fn assert_sums_match(&self) {
        let diff = (self.client.sum() - self.recorder.expected_sum()).abs();
        assert!(
            diff < SUM_TOLERANCE,
            "client sum {} diverged from recorder sum {} by {}",
            self.client.sum(),
            self.recorder.expected_sum(),
            diff
        );
    }
}

/// Fault-free run: both consumers see the whole stream, sums agree,
/// and no anomaly counter moves.
#[test]
fn clean_run_sums_agree() {
    const N: i64 = 10_000;

    let mut harness = Harness::new(32_768, N, 0);
    harness.start();
    harness.drain_and_stop();

    assert_eq!(harness.feed.sent_count(), N);
    assert_eq!(harness.client.processed_count(), N);
    assert_eq!(harness.recorder.recorded_count(), N);
    harness.assert_sums_match();

    use std::sync::atomic::Ordering;
    assert_eq!(harness.ring.overwrite_count(), 0);
    let cm = harness.client.metrics();
    assert_eq!(cm.seq_gap_count.load(Ordering::Relaxed), 0);
    assert_eq!(cm.duplicate_count.load(Ordering::Relaxed), 0);
    assert_eq!(cm.overwrite_count.load(Ordering::Relaxed), 0);
    assert_eq!(cm.recovery_count.load(Ordering::Relaxed), 0);
    let rm = harness.recorder.metrics();
    assert_eq!(rm.seq_gap_count.load(Ordering::Relaxed), 0);
    assert_eq!(rm.overwrite_count.load(Ordering::Relaxed), 0);
}

/// One injected crash mid-stream: exactly one recovery cycle, the full
/// stream is reprocessed once (no duplicate, no skip), and the rebuilt
/// sum matches the recorder's.
#[test]
fn crash_mid_stream_recovers_exactly_once() {
    use std::sync::atomic::Ordering;

    const N: i64 = 10_000;
    const FAULT_AT: i64 = 5_000;

    let mut harness = Harness::new(32_768, N, 0);
    harness.start();

    while harness.client.last_seq() < FAULT_AT && harness.feed.is_running() {
        thread::sleep(Duration::from_millis(1));
    }
    harness.client.trigger_fault(FaultKind::ClientCrash);
    harness.client.wait_for_recovery();

    harness.drain_and_stop();

    let cm = harness.client.metrics();
    assert_eq!(cm.recovery_count.load(Ordering::Relaxed), 1);
    assert_eq!(harness.client.processed_count(), N);
    // Gap-free and duplicate-free across the replay-to-live boundary.
    assert_eq!(cm.seq_gap_count.load(Ordering::Relaxed), 0);
    assert_eq!(cm.duplicate_count.load(Ordering::Relaxed), 0);
    harness.assert_sums_match();
}

/// A crash injected right at startup, before the log holds anything
/// meaningful, still converges.
#[test]
fn immediate_crash_recovers() {
    use std::sync::atomic::Ordering;

    const N: i64 = 5_000;

    let mut harness = Harness::new(32_768, N, 0);
    harness.start();

    thread::sleep(Duration::from_millis(5));
    harness.client.trigger_fault(FaultKind::ClientCrash);
    harness.client.wait_for_recovery();

    harness.drain_and_stop();

    assert!(harness.client.metrics().recovery_count.load(Ordering::Relaxed) >= 1);
    assert_eq!(harness.client.processed_count(), N);
    harness.assert_sums_match();
}

/// A crash after the stream has fully completed replays the log from
/// end to end; the live side is quiescent so the signed catch-up
/// comparison and the log-exhausted path both come into play.
#[test]
fn crash_after_completion_rebuilds_from_log_alone() {
    use std::sync::atomic::Ordering;

    const N: i64 = 5_000;

    let mut harness = Harness::new(32_768, N, 0);
    harness.start();
    harness.feed.wait_for_complete();

    let deadline = Instant::now() + DRAIN_DEADLINE;
    while harness.client.last_seq() < N - 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    harness.client.trigger_fault(FaultKind::ClientCrash);
    harness.client.wait_for_recovery();

    harness.drain_and_stop();

    assert_eq!(harness.client.metrics().recovery_count.load(Ordering::Relaxed), 1);
    assert_eq!(harness.client.processed_count(), N);
    harness.assert_sums_match();
}

/// Repeated crashes during one run: the client keeps converging.
#[test]
fn repeated_crashes_still_converge() {
    use std::sync::atomic::Ordering;

    const N: i64 = 20_000;

    let mut harness = Harness::new(65_536, N, 10_000);
    harness.start();

    for _ in 0..5 {
        thread::sleep(Duration::from_millis(100));
        harness.client.trigger_fault(FaultKind::ClientCrash);
        harness.client.wait_for_recovery();
    }

    harness.drain_and_stop();

    assert!(harness.client.metrics().recovery_count.load(Ordering::Relaxed) >= 1);
    assert_eq!(harness.client.processed_count(), N);
    harness.assert_sums_match();
}

/// A message-loss fault skips ahead without recovery: the gap is
/// counted, no recovery cycle runs, and the sums legitimately diverge.
#[test]
fn message_loss_skips_without_recovery() {
    use std::sync::atomic::Ordering;

    const N: i64 = 5_000;

    let mut harness = Harness::new(32_768, N, 10_000);
    harness.start();

    while harness.client.last_seq() < 100 {
        thread::sleep(Duration::from_millis(1));
    }
    harness.client.trigger_fault(FaultKind::MessageLoss);

    harness.feed.wait_for_complete();
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while harness.client.last_seq() < N - 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    harness.client.stop();
    harness.recorder.stop();

    let cm = harness.client.metrics();
    assert_eq!(cm.recovery_count.load(Ordering::Relaxed), 0);
    assert!(cm.seq_gap_count.load(Ordering::Relaxed) >= 1);
    assert!(harness.client.processed_count() < N);
}

/// The producer laps a stalled client; auto-detection turns the
/// overwrite into a recovery cycle and the rebuilt state converges on
/// the recorder's.
#[test]
fn overwrite_triggers_automatic_recovery() {
    use std::sync::atomic::Ordering;

    const N: i64 = 20_000;

    // Ring far smaller than the stream: a 1 s stall guarantees a lap.
    let mut harness = Harness::new(4_096, N, 20_000);
    harness.start();

    while harness.client.last_seq() < 100 {
        thread::sleep(Duration::from_millis(1));
    }
    harness.client.trigger_fault(FaultKind::TemporaryHang);

    harness.drain_and_stop();

    let cm = harness.client.metrics();
    assert!(cm.overwrite_count.load(Ordering::Relaxed) >= 1);
    assert!(cm.auto_fault_count.load(Ordering::Relaxed) >= 1);
    assert!(cm.recovery_count.load(Ordering::Relaxed) >= 1);
    assert_eq!(harness.client.processed_count(), N);
    harness.assert_sums_match();
}

/// The log left behind by a faulted run is complete: closed cleanly by
/// the recorder's stop, covering the entire stream.
#[test]
fn recorder_log_survives_client_faults() {
    const N: i64 = 3_000;

    let mut harness = Harness::new(16_384, N, 0);
    harness.start();

    thread::sleep(Duration::from_millis(2));
    harness.client.trigger_fault(FaultKind::ClientCrash);

    harness.drain_and_stop();

    let mut reader = mktdata_replay::LogReader::open(&harness.log_path).unwrap();
    assert!(reader.was_cleanly_closed());
    assert_eq!(reader.message_count(), N);
    assert_eq!(reader.first_seq(), 0);
    assert_eq!(reader.last_seq(), N - 1);

    let mut expected = 0;
    while let Some(msg) = reader.next() {
        assert_eq!(msg.seq_num, expected);
        expected += 1;
    }
    assert_eq!(expected, N);
}
