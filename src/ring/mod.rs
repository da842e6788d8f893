//! Core message and cursor types shared across the fabric
//!
//! This module provides the data structures used by both the in-memory
//! ring and the on-disk log:
//!
//! - The fixed-size [`Msg`] wire structure with its sequence-number
//!   addressing scheme
//! - [`ReadResult`], the three-valued outcome of a ring read
//! - [`ConsumerCursor`], a per-consumer atomic read position
//! - [`AtomicF64`] for lock-free publication of running sums
//!
//! Sequence numbers are the system's global ordering: assigned once by
//! the ring at publish time, they address a message both in the ring
//! (`seq & (capacity - 1)`) and in the log (`64 + seq * 24`).

pub mod spmc;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sequence number assigned by the ring at publish time.
pub type Seq = i64;

/// Sentinel for "no sequence number": unpublished slots, empty files,
/// consumers that have not processed anything yet.
pub const INVALID_SEQ: Seq = -1;

/// Default ring capacity in slots (must be a power of two).
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// Number of messages the recorder accumulates before a disk write.
pub const DISK_BATCH_SIZE: usize = 1024;

/// Maximum live-to-replay gap at which a recovering consumer switches
/// from log replay back to the live ring.
pub const CATCHUP_THRESHOLD: i64 = 100;

/// A single market-data message.
///
/// Exactly 24 bytes, eight-byte aligned, identical layout in memory and
/// on disk (little-endian on disk). The producer fills `timestamp_ns`
/// and `payload`; the ring overwrites `seq_num` when the message is
/// published.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Msg {
    /// Sequence number, [`INVALID_SEQ`] until assigned by the ring.
    pub seq_num: Seq,
    /// Producer timestamp in nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    /// Data payload.
    pub payload: f64,
}

impl Msg {
    /// Size of one message on the wire and in memory.
    pub const SIZE: usize = 24;

    /// Create a message with the given fields.
    pub const fn new(seq_num: Seq, timestamp_ns: i64, payload: f64) -> Self {
        Self {
            seq_num,
            timestamp_ns,
            payload,
        }
    }

    /// A message carrying no sequence number.
    pub const fn invalid() -> Self {
        Self::new(INVALID_SEQ, 0, 0.0)
    }

    /// Whether this message carries an assigned sequence number.
    pub const fn is_valid(&self) -> bool {
        self.seq_num != INVALID_SEQ
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Outcome of a ring read at an expected sequence number.
///
/// Distinguishes "the producer has not reached this sequence yet" from
/// "the producer has lapped the consumer and the message is gone".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadResult {
    /// A consistent copy of the message at the expected sequence.
    Ok(Msg),
    /// The producer has not published this sequence yet.
    NotReady,
    /// The slot now holds a newer generation; the message was lost.
    Overwritten,
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn current_timestamp_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Per-consumer monotonic read position.
///
/// Each consumer owns one cursor; it is atomic because recovery and
/// shutdown may retarget it from a thread other than the consumer's
/// worker.
#[derive(Debug)]
pub struct ConsumerCursor {
    read_seq: AtomicI64,
}

impl ConsumerCursor {
    /// Create a cursor positioned at sequence 0.
    pub const fn new() -> Self {
        Self {
            read_seq: AtomicI64::new(0),
        }
    }

    /// Current read position.
    pub fn read_seq(&self) -> Seq {
        self.read_seq.load(Ordering::Acquire)
    }

    /// Retarget the cursor to `seq`.
    pub fn set_read_seq(&self, seq: Seq) {
        self.read_seq.store(seq, Ordering::Release);
    }

    /// Advance to the next position, returning the previous one.
    pub fn advance(&self) -> Seq {
        self.read_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Reset the cursor to `seq`.
    pub fn reset(&self, seq: Seq) {
        self.read_seq.store(seq, Ordering::Release);
    }
}

impl Default for ConsumerCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// An `f64` published through an atomic bit pattern.
///
/// Consumers update their running sums from a worker thread while other
/// threads poll them; the value round-trips through `to_bits` so the
/// load always observes a complete store.
#[derive(Debug)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// Create with an initial value.
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// Load the current value.
    pub fn load(&self, ordering: Ordering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    /// Store a new value.
    pub fn store(&self, value: f64, ordering: Ordering) {
        self.bits.store(value.to_bits(), ordering);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_is_24_bytes_and_8_aligned() {
        assert_eq!(std::mem::size_of::<Msg>(), Msg::SIZE);
        assert_eq!(std::mem::align_of::<Msg>(), 8);
    }

    #[test]
    fn msg_validity() {
        let msg = Msg::new(100, 1_234_567_890, 3.14159);
        assert_eq!(msg.seq_num, 100);
        assert_eq!(msg.timestamp_ns, 1_234_567_890);
        assert!((msg.payload - 3.14159).abs() < 1e-10);
        assert!(msg.is_valid());

        assert!(!Msg::invalid().is_valid());
        assert!(!Msg::default().is_valid());
    }

    #[test]
    fn cursor_advance_returns_previous() {
        let cursor = ConsumerCursor::new();
        assert_eq!(cursor.read_seq(), 0);
        assert_eq!(cursor.advance(), 0);
        assert_eq!(cursor.advance(), 1);
        assert_eq!(cursor.read_seq(), 2);

        cursor.set_read_seq(50);
        assert_eq!(cursor.read_seq(), 50);

        cursor.reset(0);
        assert_eq!(cursor.read_seq(), 0);
    }

    #[test]
    fn atomic_f64_round_trips() {
        let value = AtomicF64::new(0.0);
        value.store(1234.5678, Ordering::Release);
        assert_eq!(value.load(Ordering::Acquire), 1234.5678);

        value.store(-0.0, Ordering::Relaxed);
        assert_eq!(value.load(Ordering::Relaxed), 0.0);
    }

    #[test]
    fn timestamp_is_positive_and_monotonic_enough() {
        let a = current_timestamp_ns();
        let b = current_timestamp_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
