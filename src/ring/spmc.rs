//! Lock-free single-producer multi-consumer broadcast ring
//!
//! The ring is a fixed, power-of-two array of slots indexed by sequence
//! number (`seq & (capacity - 1)`). The slot at index `i` is responsible
//! for every sequence `s` with `s % capacity == i`; its atomic `seq`
//! field identifies which generation currently occupies it.
//!
//! The producer never blocks and never fails: when the ring is full it
//! overwrites the oldest generation, and consumers detect the loss
//! through [`ReadResult::Overwritten`]. A market-data feed must not
//! stall on a slow consumer, so buffer-full is expressed as overwrite
//! rather than backpressure.
//!
//! Reads use a seqlock double-check. A consumer copies the slot, then
//! re-reads the published sequence after an acquire fence; if the value
//! changed, the producer overtook the copy and the message is reported
//! as overwritten rather than returned torn.

use crate::ring::{Msg, ReadResult, Seq, INVALID_SEQ};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI64, Ordering};

/// One ring slot: message plus the published sequence number.
///
/// Sized and aligned to exactly one cache line so neighbouring slots
/// never share a line.
#[repr(C, align(64))]
struct Slot {
    msg: UnsafeCell<Msg>,
    seq: AtomicI64,
}

impl Slot {
    fn new() -> Self {
        Self {
            msg: UnsafeCell::new(Msg::invalid()),
            seq: AtomicI64::new(INVALID_SEQ),
        }
    }
}

const _: () = assert!(std::mem::size_of::<Slot>() == 64);

/// Lock-free SPMC broadcast ring addressed by sequence number.
///
/// One producer publishes through [`push`](RingBuffer::push) /
/// [`push_batch`](RingBuffer::push_batch); arbitrarily many consumers
/// read independently through [`read`](RingBuffer::read), each keeping
/// its own cursor. Synchronisation is per-slot atomics only.
///
/// The write cursor is modified by exactly one actor. The structure
/// itself does not enforce the single-producer contract; callers hand
/// the producer role to one thread.
pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: usize,
    /// Next sequence number to assign. Own cache line: the producer
    /// hammers it while consumers only read.
    write_seq: CachePadded<AtomicI64>,
    /// Publishes into already-occupied slots since creation.
    overwrite_count: CachePadded<AtomicI64>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with the given slot count.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a non-zero power of two; bitmask
    /// indexing requires it.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a non-zero power of two, got {capacity}"
        );

        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();

        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            write_seq: CachePadded::new(AtomicI64::new(0)),
            overwrite_count: CachePadded::new(AtomicI64::new(0)),
        }
    }

    #[inline]
    fn index(&self, seq: Seq) -> usize {
        seq as usize & self.mask
    }

    /// Publish one message, returning its assigned sequence number.
    ///
    /// Never blocks and never fails. Any sequence number present in
    /// `msg` is replaced by the one assigned here. If the target slot
    /// still holds an unread generation, the overwrite counter is
    /// incremented; after the first full wrap every publish overwrites.
    pub fn push(&self, msg: Msg) -> Seq {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.publish(seq, msg);
        seq
    }

    /// Publish a batch, reserving all sequence numbers atomically.
    ///
    /// Returns the first sequence of the batch, or [`INVALID_SEQ`] for
    /// an empty batch. Per-slot ordering guarantees are identical to
    /// [`push`](RingBuffer::push).
    pub fn push_batch(&self, messages: &[Msg]) -> Seq {
        if messages.is_empty() {
            return INVALID_SEQ;
        }

        let first_seq = self
            .write_seq
            .fetch_add(messages.len() as i64, Ordering::Relaxed);

        for (i, msg) in messages.iter().enumerate() {
            self.publish(first_seq + i as Seq, *msg);
        }

        first_seq
    }

    fn publish(&self, seq: Seq, mut msg: Msg) {
        let slot = &self.slots[self.index(seq)];

        if slot.seq.load(Ordering::Acquire) != INVALID_SEQ {
            self.overwrite_count.fetch_add(1, Ordering::Relaxed);
        }

        msg.seq_num = seq;
        // Payload store must complete before the release publish below;
        // consumers acquire-load `seq` and then read the payload.
        unsafe {
            *slot.msg.get() = msg;
        }
        slot.seq.store(seq, Ordering::Release);
    }

    /// Read the message at `expected`, reporting exactly one of:
    /// a consistent copy, not-yet-published, or overwritten.
    ///
    /// The published field of the target slot decides the outcome. If
    /// it matches `expected` the message is copied and the field is
    /// re-read behind an acquire fence; a changed value means the
    /// producer overtook the copy, so the (torn) copy is discarded and
    /// the read reports [`ReadResult::Overwritten`]. A field greater
    /// than `expected` means the producer is at least one full wrap
    /// ahead. Anything else (smaller, or the unpublished sentinel)
    /// means the producer has not reached this sequence yet.
    ///
    /// A negative `expected` is always [`ReadResult::NotReady`].
    pub fn read(&self, expected: Seq) -> ReadResult {
        if expected < 0 {
            return ReadResult::NotReady;
        }

        let slot = &self.slots[self.index(expected)];
        let published = slot.seq.load(Ordering::Acquire);

        if published == expected {
            let msg = unsafe { std::ptr::read(slot.msg.get()) };

            // Seqlock double-check: the fence orders the payload copy
            // before the re-read of the published field.
            fence(Ordering::Acquire);
            let recheck = slot.seq.load(Ordering::Relaxed);

            if recheck == expected {
                ReadResult::Ok(msg)
            } else {
                ReadResult::Overwritten
            }
        } else if published > expected {
            ReadResult::Overwritten
        } else {
            ReadResult::NotReady
        }
    }

    /// Latest published sequence number, or a negative value before the
    /// first publish.
    pub fn latest_seq(&self) -> Seq {
        self.write_seq.load(Ordering::Acquire) - 1
    }

    /// Next sequence number the producer will assign.
    pub fn next_seq(&self) -> Seq {
        self.write_seq.load(Ordering::Acquire)
    }

    /// Whether the message at `seq` is currently readable.
    ///
    /// Point-in-time snapshot; the slot may be overwritten immediately
    /// after this returns true.
    pub fn is_available(&self, seq: Seq) -> bool {
        if seq < 0 {
            return false;
        }
        self.slots[self.index(seq)].seq.load(Ordering::Acquire) == seq
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of retained messages.
    pub fn len(&self) -> usize {
        let latest = self.latest_seq();
        if latest < 0 {
            return 0;
        }
        (latest as usize + 1).min(self.capacity())
    }

    /// Whether nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total publishes into already-occupied slots since creation.
    ///
    /// A system-level indicator of buffer pressure: once the stream
    /// exceeds the capacity, every publish increments this.
    pub fn overwrite_count(&self) -> i64 {
        self.overwrite_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::current_timestamp_ns;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_assigns_monotonic_seqs() {
        let ring = RingBuffer::new(1024);

        for i in 0..100 {
            let seq = ring.push(Msg::new(INVALID_SEQ, current_timestamp_ns(), i as f64));
            assert_eq!(seq, i);
        }

        for i in 0..100 {
            match ring.read(i) {
                ReadResult::Ok(msg) => {
                    assert_eq!(msg.seq_num, i);
                    assert_eq!(msg.payload, i as f64);
                }
                other => panic!("expected Ok at seq {i}, got {other:?}"),
            }
        }
    }

    #[test]
    fn read_before_publish_is_not_ready() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.read(0), ReadResult::NotReady);
        assert_eq!(ring.read(5), ReadResult::NotReady);
        assert_eq!(ring.read(-1), ReadResult::NotReady);
        assert!(ring.is_empty());
    }

    #[test]
    fn push_batch_reserves_contiguous_range() {
        let ring = RingBuffer::new(64);
        let batch: Vec<Msg> = (0..10)
            .map(|i| Msg::new(INVALID_SEQ, 0, i as f64 * 2.0))
            .collect();

        let first = ring.push_batch(&batch);
        assert_eq!(first, 0);

        for i in 0..10 {
            match ring.read(i) {
                ReadResult::Ok(msg) => assert_eq!(msg.payload, i as f64 * 2.0),
                other => panic!("expected Ok at seq {i}, got {other:?}"),
            }
        }

        assert_eq!(ring.push_batch(&[]), INVALID_SEQ);
        assert_eq!(ring.latest_seq(), 9);
    }

    #[test]
    fn wrap_marks_old_seqs_overwritten() {
        let ring = RingBuffer::new(8);

        for i in 0..16 {
            ring.push(Msg::new(INVALID_SEQ, 0, i as f64));
        }

        for i in 0..8 {
            assert_eq!(ring.read(i), ReadResult::Overwritten, "seq {i}");
        }
        for i in 8..16 {
            assert!(matches!(ring.read(i), ReadResult::Ok(_)), "seq {i}");
        }
        assert_eq!(ring.read(16), ReadResult::NotReady);
        assert_eq!(ring.overwrite_count(), 8);
    }

    #[test]
    fn len_saturates_at_capacity() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.len(), 0);

        for i in 0..5 {
            ring.push(Msg::new(INVALID_SEQ, 0, i as f64));
        }
        assert_eq!(ring.len(), 5);

        for i in 0..20 {
            ring.push(Msg::new(INVALID_SEQ, 0, i as f64));
        }
        assert_eq!(ring.len(), 8);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_capacity_is_rejected() {
        let _ = RingBuffer::new(100);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn zero_capacity_is_rejected() {
        let _ = RingBuffer::new(0);
    }

    #[test]
    fn concurrent_producer_single_consumer() {
        const COUNT: i64 = 10_000;

        let ring = Arc::new(RingBuffer::new(16_384));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for _ in 0..COUNT {
                    ring.push(Msg::new(INVALID_SEQ, 0, 1.0));
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut expected = 0;
                let mut seen = 0_i64;
                while seen < COUNT {
                    match ring.read(expected) {
                        ReadResult::Ok(msg) => {
                            assert_eq!(msg.seq_num, expected);
                            expected += 1;
                            seen += 1;
                        }
                        ReadResult::NotReady => thread::yield_now(),
                        ReadResult::Overwritten => {
                            panic!("consumer lapped with a ring larger than the stream")
                        }
                    }
                }
                seen
            })
        };

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), COUNT);
        assert_eq!(ring.overwrite_count(), 0);
    }
}
