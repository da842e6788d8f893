//! On-disk log format
//!
//! A log file is a fixed 64-byte header followed by tightly packed
//! 24-byte message records, no per-record framing. All integers are
//! little-endian two's-complement; the codec here byte-swaps explicitly
//! so the format is identical on any host.
//!
//! Header invariants:
//!
//! - magic and version must match on open; version-1 files (which lack
//!   the first/last/flags fields) are rejected
//! - `msg_count == 0` implies both `first_seq` and `last_seq` are the
//!   invalid sentinel; otherwise both are non-negative and
//!   `last_seq - first_seq + 1 == msg_count`
//! - the cleanly-closed flag (bit 0 of `flags`) is set only by the
//!   writer's explicit close

pub mod reader;
pub mod writer;

use crate::ring::{Msg, Seq, INVALID_SEQ};
use chrono::{Datelike, Local};
use thiserror::Error;

/// Log file magic number ("MKTD").
pub const FILE_MAGIC: u32 = 0x4D4B_5444;

/// Current log format version.
pub const FILE_VERSION: u16 = 2;

/// Header flag bit: the writer closed the file cleanly.
pub const FLAG_CLEAN_CLOSE: u16 = 0x0001;

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Errors surfaced by the log writer and reader.
#[derive(Debug, Error)]
pub enum DiskError {
    /// Underlying file I/O failed.
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with the expected magic number.
    #[error("bad log magic 0x{0:08x}")]
    BadMagic(u32),
    /// The file uses a format version this reader does not support.
    #[error("unsupported log version {0}")]
    UnsupportedVersion(u16),
    /// The file is too short to hold a header.
    #[error("log header truncated: file is {0} bytes")]
    HeaderTruncated(u64),
}

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, DiskError>;

/// The 64-byte log file header.
///
/// Field layout on disk, all little-endian: magic (4), version (2),
/// flags (2), date YYYYMMDD (4), 4 reserved bytes, msg_count (8),
/// first_seq (8), last_seq (8), 24 reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format identification magic, [`FILE_MAGIC`].
    pub magic: u32,
    /// Format version, [`FILE_VERSION`].
    pub version: u16,
    /// Flag bitfield; see [`FLAG_CLEAN_CLOSE`].
    pub flags: u16,
    /// Recording date as decimal YYYYMMDD.
    pub date: u32,
    /// Number of records in the file.
    pub msg_count: i64,
    /// First sequence number in the file, sentinel if empty.
    pub first_seq: Seq,
    /// Last sequence number in the file, sentinel if empty.
    pub last_seq: Seq,
}

impl FileHeader {
    /// Create an empty header stamped with `date`.
    pub fn new(date: u32) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            flags: 0,
            date,
            msg_count: 0,
            first_seq: INVALID_SEQ,
            last_seq: INVALID_SEQ,
        }
    }

    /// Whether magic and version identify a file this crate can read.
    pub fn is_valid(&self) -> bool {
        self.magic == FILE_MAGIC && self.version == FILE_VERSION
    }

    /// Structural consistency of the count and sequence-range fields.
    ///
    /// An inconsistent header usually means the writer crashed inside a
    /// header update; readers then trust the count alone.
    pub fn is_consistent(&self) -> bool {
        if !self.is_valid() || self.msg_count < 0 {
            return false;
        }
        if self.msg_count == 0 {
            return self.first_seq == INVALID_SEQ && self.last_seq == INVALID_SEQ;
        }
        self.first_seq >= 0
            && self.last_seq >= 0
            && self.first_seq <= self.last_seq
            && self.last_seq - self.first_seq + 1 == self.msg_count
    }

    /// Whether the writer set the cleanly-closed flag.
    pub fn is_clean_close(&self) -> bool {
        self.flags & FLAG_CLEAN_CLOSE != 0
    }

    /// Serialise to the on-disk little-endian layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.date.to_le_bytes());
        // buf[12..16] reserved
        buf[16..24].copy_from_slice(&self.msg_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_seq.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_seq.to_le_bytes());
        // buf[40..64] reserved
        buf
    }

    /// Deserialise from the on-disk layout. Performs no validation;
    /// call [`is_valid`](Self::is_valid) afterwards.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: read_u32(buf, 0),
            version: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            date: read_u32(buf, 8),
            msg_count: read_i64(buf, 16),
            first_seq: read_i64(buf, 24),
            last_seq: read_i64(buf, 32),
        }
    }
}

/// Serialise a message record to its 24-byte on-disk form.
pub fn encode_record(msg: &Msg) -> [u8; Msg::SIZE] {
    let mut buf = [0u8; Msg::SIZE];
    buf[0..8].copy_from_slice(&msg.seq_num.to_le_bytes());
    buf[8..16].copy_from_slice(&msg.timestamp_ns.to_le_bytes());
    buf[16..24].copy_from_slice(&msg.payload.to_le_bytes());
    buf
}

/// Deserialise a 24-byte record. `buf` must hold at least
/// [`Msg::SIZE`] bytes from `offset`.
pub fn decode_record(buf: &[u8], offset: usize) -> Msg {
    Msg {
        seq_num: read_i64(buf, offset),
        timestamp_ns: read_i64(buf, offset + 8),
        payload: f64::from_bits(read_i64(buf, offset + 16) as u64),
    }
}

/// Today's local date as decimal YYYYMMDD, the header date stamp.
pub fn current_date_yyyymmdd() -> u32 {
    let today = Local::now().date_naive();
    today.year() as u32 * 10_000 + today.month() * 100 + today.day()
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}
