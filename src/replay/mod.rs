//! Log replay with continuity validation and catch-up detection
//!
//! A replay engine is created per recovery cycle and discarded when the
//! cycle ends. It wraps a [`LogReader`] and adds two things the raw
//! reader does not provide:
//!
//! - continuity validation: emitted sequence numbers must grow
//!   strictly; violations are counted and logged but the record is
//!   still emitted, leaving the skip decision to the caller
//! - the catch-up predicate deciding when a recovering consumer is
//!   close enough to the live stream to switch back to it

use crate::disk::{reader::LogReader, Result};
use crate::ring::{Msg, Seq, CATCHUP_THRESHOLD, INVALID_SEQ};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Invoked once, with `(replay_position, live_seq)`, when the catch-up
/// condition first becomes true.
pub type CatchUpCallback = Box<dyn Fn(Seq, Seq) + Send>;

/// Replays a recorded log and reports when the live stream is within
/// reach.
pub struct ReplayEngine {
    path: PathBuf,
    reader: Option<LogReader>,
    catchup_threshold: i64,
    catchup_callback: Option<CatchUpCallback>,
    catchup_signalled: bool,
    last_read_seq: Seq,
    seq_violation_count: i64,
}

impl ReplayEngine {
    /// Create an engine for the log at `path`. The file is not touched
    /// until [`open`](Self::open).
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
            catchup_threshold: CATCHUP_THRESHOLD,
            catchup_callback: None,
            catchup_signalled: false,
            last_read_seq: INVALID_SEQ,
            seq_violation_count: 0,
        }
    }

    /// Open the log and reset validation state.
    ///
    /// A file the writer never closed cleanly is usable but logged as
    /// possibly truncated.
    pub fn open(&mut self) -> Result<()> {
        let reader = LogReader::open(&self.path)?;
        if !reader.was_cleanly_closed() {
            warn!(
                path = %self.path.display(),
                "replay file was not cleanly closed, data may be truncated"
            );
        }
        self.reader = Some(reader);
        self.last_read_seq = INVALID_SEQ;
        self.seq_violation_count = 0;
        self.catchup_signalled = false;
        Ok(())
    }

    /// Release the underlying file.
    pub fn close(&mut self) {
        self.reader = None;
    }

    /// Whether a log is currently open.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Read the next message, validating sequence continuity.
    ///
    /// A sequence that is not strictly greater than the previous one is
    /// counted and logged, but the record is still returned; the caller
    /// decides whether to drop it.
    pub fn next_message(&mut self) -> Option<Msg> {
        let msg = self.reader.as_mut()?.next()?;
        if self.last_read_seq != INVALID_SEQ && msg.seq_num <= self.last_read_seq {
            self.seq_violation_count += 1;
            warn!(
                path = %self.path.display(),
                prev = self.last_read_seq,
                got = msg.seq_num,
                "replay sequence violation"
            );
        }
        self.last_read_seq = msg.seq_num;
        Some(msg)
    }

    /// Read the next message without advancing or validating.
    pub fn peek_message(&self) -> Option<Msg> {
        self.reader.as_ref()?.peek()
    }

    /// Read up to `count` messages.
    pub fn read_batch(&mut self, count: usize) -> Vec<Msg> {
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match self.next_message() {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        batch
    }

    /// Reposition at record index `seq`.
    ///
    /// A seek invalidates the continuity state: no continuity claim is
    /// made across the boundary.
    pub fn seek(&mut self, seq: i64) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let ok = reader.seek(seq);
        if ok {
            self.last_read_seq = INVALID_SEQ;
        }
        ok
    }

    /// Rewind to the start of the log.
    pub fn reset(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.seek(0);
        }
        self.last_read_seq = INVALID_SEQ;
    }

    /// Whether the replay position is within the catch-up threshold of
    /// `live_seq`.
    ///
    /// Signed arithmetic throughout: a live sequence behind the replay
    /// position (the producer is quiescent) satisfies the condition.
    /// The callback, if any, fires on the first transition to true and
    /// never again for this open.
    pub fn should_switch_to_live(&mut self, live_seq: Seq) -> bool {
        let Some(reader) = self.reader.as_ref() else {
            return false;
        };
        let current = reader.current_seq();

        let should_switch = live_seq - current <= self.catchup_threshold;

        if should_switch && !self.catchup_signalled {
            self.catchup_signalled = true;
            if let Some(callback) = &self.catchup_callback {
                callback(current, live_seq);
            }
        }

        should_switch
    }

    /// Override the catch-up threshold.
    pub fn set_catchup_threshold(&mut self, threshold: i64) {
        self.catchup_threshold = threshold;
    }

    /// Register the first-eligibility callback.
    pub fn set_catchup_callback(&mut self, callback: CatchUpCallback) {
        self.catchup_callback = Some(callback);
    }

    /// Number of records the open log vouches for, 0 when closed.
    pub fn message_count(&self) -> i64 {
        self.reader.as_ref().map_or(0, |r| r.message_count())
    }

    /// Current read position, sentinel when closed.
    pub fn current_seq(&self) -> i64 {
        self.reader.as_ref().map_or(INVALID_SEQ, |r| r.current_seq())
    }

    /// First sequence number recorded in the file header.
    pub fn file_first_seq(&self) -> Seq {
        self.reader.as_ref().map_or(INVALID_SEQ, |r| r.first_seq())
    }

    /// Whether the file carries the cleanly-closed flag.
    pub fn was_file_cleanly_closed(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| r.was_cleanly_closed())
    }

    /// Continuity violations observed since open.
    pub fn seq_violation_count(&self) -> i64 {
        self.seq_violation_count
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
