//! Sequential, seekable log reader
//!
//! The reader maps the file read-only and serves records bounded by the
//! header-recorded count: trailing bytes beyond that count (records the
//! writer appended but never vouched for with a header flush) are
//! ignored. A writer may keep appending to the same file while a reader
//! replays it; the reader's bound was fixed when it opened.
//!
//! A missing cleanly-closed flag is advisory ("may be truncated"), not
//! an error. A structurally inconsistent header downgrades to trusting
//! the count alone.

use crate::disk::{self, DiskError, FileHeader, Result, HEADER_SIZE};
use crate::ring::{Msg, Seq, INVALID_SEQ};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Reads fixed-size message records out of a log file.
pub struct LogReader {
    path: PathBuf,
    mmap: Mmap,
    msg_count: i64,
    first_seq: Seq,
    last_seq: Seq,
    cleanly_closed: bool,
    current_seq: i64,
}

impl LogReader {
    /// Open the log at `path` and validate its header.
    ///
    /// Magic or version mismatches are rejected. A header that fails
    /// structural consistency is downgraded: the count is trusted
    /// as-is, the sequence range is cleared to sentinels, and the file
    /// is treated as not cleanly closed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(DiskError::HeaderTruncated(file_len));
        }

        let mmap = unsafe { Mmap::map(&file)? };

        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&mmap[..HEADER_SIZE]);
        let header = FileHeader::decode(&buf);

        if header.magic != disk::FILE_MAGIC {
            return Err(DiskError::BadMagic(header.magic));
        }
        if header.version != disk::FILE_VERSION {
            return Err(DiskError::UnsupportedVersion(header.version));
        }

        let (mut msg_count, first_seq, last_seq, cleanly_closed) = if header.is_consistent() {
            (
                header.msg_count,
                header.first_seq,
                header.last_seq,
                header.is_clean_close(),
            )
        } else {
            // Likely a crash inside a header update. The count is
            // flushed periodically and remains the best bound we have;
            // the sequence range is not trustworthy.
            warn!(
                path = %path.display(),
                count = header.msg_count,
                first_seq = header.first_seq,
                last_seq = header.last_seq,
                "log header inconsistent, trusting count only"
            );
            (header.msg_count.max(0), INVALID_SEQ, INVALID_SEQ, false)
        };

        // The header never vouches for more records than the file
        // holds, but a crash can leave it ahead of the data pages.
        let available = ((mmap.len() - HEADER_SIZE) / Msg::SIZE) as i64;
        if msg_count > available {
            warn!(
                path = %path.display(),
                count = msg_count,
                available,
                "log header count exceeds file contents, clamping"
            );
            msg_count = available;
        }

        Ok(Self {
            path,
            mmap,
            msg_count,
            first_seq,
            last_seq,
            cleanly_closed,
            current_seq: 0,
        })
    }

    /// Read the record at the current position and advance.
    pub fn next(&mut self) -> Option<Msg> {
        let msg = self.record_at(self.current_seq)?;
        self.current_seq += 1;
        Some(msg)
    }

    /// Read the record at the current position without advancing.
    pub fn peek(&self) -> Option<Msg> {
        self.record_at(self.current_seq)
    }

    /// Position the reader at record index `seq` (offset
    /// `64 + seq * 24`). Returns false if `seq` is out of range.
    pub fn seek(&mut self, seq: i64) -> bool {
        if seq < 0 || seq >= self.msg_count {
            return false;
        }
        self.current_seq = seq;
        true
    }

    /// Number of records the header vouches for.
    pub fn message_count(&self) -> i64 {
        self.msg_count
    }

    /// Current read position as a record index.
    pub fn current_seq(&self) -> i64 {
        self.current_seq
    }

    /// Index of the last readable record, sentinel if the file is
    /// empty.
    pub fn latest_seq(&self) -> Seq {
        if self.msg_count > 0 {
            self.msg_count - 1
        } else {
            INVALID_SEQ
        }
    }

    /// First sequence number recorded in the header, sentinel if empty
    /// or untrusted.
    pub fn first_seq(&self) -> Seq {
        self.first_seq
    }

    /// Last sequence number recorded in the header, sentinel if empty
    /// or untrusted.
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Whether the writer set the cleanly-closed flag. False means the
    /// data may be truncated at the tail; it is not an error.
    pub fn was_cleanly_closed(&self) -> bool {
        self.cleanly_closed
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_at(&self, index: i64) -> Option<Msg> {
        if index < 0 || index >= self.msg_count {
            return None;
        }
        let offset = HEADER_SIZE + index as usize * Msg::SIZE;
        Some(disk::decode_record(&self.mmap, offset))
    }
}
