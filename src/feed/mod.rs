//! Synthetic market-data producer
//!
//! One worker thread publishes a configured number of messages into the
//! ring, optionally throttled to a target rate. Payloads come from a
//! pluggable generator; the default draws uniformly from `[0, 100)`.
//!
//! Rate control uses absolute deadlines from the start instant rather
//! than per-message sleeps, so the average rate holds even when
//! individual sleeps overshoot.

use crate::affinity;
use crate::ring::{current_timestamp_ns, spmc::RingBuffer, Msg, Seq, INVALID_SEQ};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Produces one payload per published message.
pub type PayloadGenerator = Box<dyn FnMut() -> f64 + Send>;

struct FeedShared {
    stop: AtomicBool,
    running: AtomicBool,
    sent_count: AtomicI64,
}

/// Publishes a synthetic message stream into the ring.
pub struct Feed {
    ring: Arc<RingBuffer>,
    shared: Arc<FeedShared>,
    message_count: i64,
    rate: i64,
    generator: Option<PayloadGenerator>,
    cpu_core: Option<usize>,
    handle: Option<JoinHandle<()>>,
}

impl Feed {
    /// Create a feed over `ring` with the default message count
    /// (10 000) and rate (1 000/s).
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            ring,
            shared: Arc::new(FeedShared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                sent_count: AtomicI64::new(0),
            }),
            message_count: 10_000,
            rate: 1_000,
            generator: None,
            cpu_core: None,
            handle: None,
        }
    }

    /// Total number of messages to publish.
    pub fn set_message_count(&mut self, count: i64) {
        self.message_count = count;
    }

    /// Target publish rate in messages per second; 0 means
    /// unthrottled.
    pub fn set_rate(&mut self, rate_per_second: i64) {
        self.rate = rate_per_second;
    }

    /// Replace the default random payload generator.
    pub fn set_generator(&mut self, generator: PayloadGenerator) {
        self.generator = Some(generator);
    }

    /// Pin the worker thread to a core; call before
    /// [`start`](Self::start).
    pub fn set_cpu_core(&mut self, core_id: Option<usize>) {
        self.cpu_core = core_id;
    }

    /// Spawn the producer thread.
    pub fn start(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            warn!("feed already running, ignoring start");
            return;
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.sent_count.store(0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        info!(
            messages = self.message_count,
            rate = self.rate,
            "feed starting"
        );

        let worker = FeedWorker {
            ring: Arc::clone(&self.ring),
            shared: Arc::clone(&self.shared),
            message_count: self.message_count,
            rate: self.rate,
            generator: self.generator.take(),
            cpu_core: self.cpu_core,
        };

        let handle = thread::Builder::new()
            .name("mktdata-feed".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn feed thread");
        self.handle = Some(handle);
    }

    /// Signal the worker to stop and join it.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        info!(sent = self.sent_count(), "feed stopped");
    }

    /// Block until the worker finishes publishing.
    pub fn wait_for_complete(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Whether the worker is still publishing.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Messages published so far.
    pub fn sent_count(&self) -> i64 {
        self.shared.sent_count.load(Ordering::Acquire)
    }

    /// Latest sequence number published into the ring.
    pub fn latest_seq(&self) -> Seq {
        self.ring.latest_seq()
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedWorker {
    ring: Arc<RingBuffer>,
    shared: Arc<FeedShared>,
    message_count: i64,
    rate: i64,
    generator: Option<PayloadGenerator>,
    cpu_core: Option<usize>,
}

impl FeedWorker {
    fn run(mut self) {
        affinity::pin_current_thread(self.cpu_core, "feed");

        let mut generator = self.generator.take().unwrap_or_else(|| {
            let mut rng = StdRng::from_entropy();
            Box::new(move || rng.gen_range(0.0..100.0))
        });

        let interval_ns = if self.rate > 0 {
            1_000_000_000_u64 / self.rate as u64
        } else {
            0
        };
        let start = Instant::now();

        for i in 0..self.message_count {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }

            let payload = generator();
            let msg = Msg::new(INVALID_SEQ, current_timestamp_ns(), payload);

            self.ring.push(msg);
            self.shared.sent_count.fetch_add(1, Ordering::Release);

            if interval_ns > 0 {
                let deadline =
                    start + Duration::from_nanos(interval_ns.saturating_mul(i as u64 + 1));
                let now = Instant::now();
                if now < deadline {
                    thread::sleep(deadline - now);
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
        info!(
            sent = self.shared.sent_count.load(Ordering::Acquire),
            "feed completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ReadResult;

    #[test]
    fn publishes_exactly_message_count() {
        let ring = Arc::new(RingBuffer::new(4096));
        let mut feed = Feed::new(Arc::clone(&ring));
        feed.set_message_count(500);
        feed.set_rate(0);

        feed.start();
        feed.wait_for_complete();

        assert_eq!(feed.sent_count(), 500);
        assert_eq!(ring.latest_seq(), 499);
        assert!(!feed.is_running());
    }

    #[test]
    fn custom_generator_drives_payloads() {
        let ring = Arc::new(RingBuffer::new(1024));
        let mut feed = Feed::new(Arc::clone(&ring));
        feed.set_message_count(10);
        feed.set_rate(0);

        let mut next = 0.0;
        feed.set_generator(Box::new(move || {
            next += 1.0;
            next
        }));

        feed.start();
        feed.wait_for_complete();

        for seq in 0..10 {
            match ring.read(seq) {
                ReadResult::Ok(msg) => assert_eq!(msg.payload, (seq + 1) as f64),
                other => panic!("expected Ok at {seq}, got {other:?}"),
            }
        }
    }

    #[test]
    fn stop_interrupts_a_throttled_run() {
        let ring = Arc::new(RingBuffer::new(1024));
        let mut feed = Feed::new(Arc::clone(&ring));
        feed.set_message_count(1_000_000);
        feed.set_rate(100); // Slow enough that stop lands mid-run.

        feed.start();
        std::thread::sleep(Duration::from_millis(50));
        feed.stop();

        assert!(feed.sent_count() < 1_000_000);
    }
}
