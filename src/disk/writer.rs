//! Append-only log writer
//!
//! The writer owns the output file exclusively. Records are appended
//! through a buffered writer; the header is rewritten in place only on
//! [`flush`](LogWriter::flush) and [`close`](LogWriter::close), so
//! every flush leaves the file in a state a reader can open: a
//! well-formed header whose count bounds the records it vouches for,
//! plus possibly some unflushed records beyond that count which readers
//! ignore.
//!
//! The cleanly-closed flag is set exclusively by `close`. A reader that
//! finds it missing knows the writer died and the tail may be
//! truncated.

use crate::disk::{self, FileHeader, Result};
use crate::ring::{Msg, Seq, INVALID_SEQ};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Appends fixed-size message records to a log file.
///
/// Sequence bookkeeping invariants: `first_seq` is set by the first
/// accepted write and never mutated afterwards, `last_seq` tracks the
/// most recent accepted write, and `msg_count` counts accepted writes.
pub struct LogWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    header: FileHeader,
    msg_count: i64,
    first_seq: Seq,
    last_seq: Seq,
}

impl LogWriter {
    /// Create or truncate the log at `path` and write the placeholder
    /// header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let header = FileHeader::new(disk::current_date_yyyymmdd());
        writer.write_all(&header.encode())?;
        writer.flush()?;

        info!(path = %path.display(), "log writer opened");

        Ok(Self {
            path,
            file: Some(writer),
            header,
            msg_count: 0,
            first_seq: INVALID_SEQ,
            last_seq: INVALID_SEQ,
        })
    }

    /// Append one record.
    ///
    /// Updates the in-memory sequence bookkeeping only; the on-disk
    /// header is untouched until the next flush.
    pub fn write(&mut self, msg: &Msg) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.write_all(&disk::encode_record(msg))?;

        if self.first_seq == INVALID_SEQ {
            self.first_seq = msg.seq_num;
        }
        self.last_seq = msg.seq_num;
        self.msg_count += 1;
        Ok(())
    }

    /// Push buffered records to the file, rewrite the header in place
    /// and sync.
    ///
    /// The cleanly-closed flag is NOT set here; a crash after this
    /// point leaves a readable file that reports itself as possibly
    /// truncated.
    pub fn flush(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Err(closed_error().into());
        }
        self.update_header()?;
        debug!(count = self.msg_count, last_seq = self.last_seq, "log header flushed");
        Ok(())
    }

    /// Set the cleanly-closed flag, write the final header and close
    /// the file.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.header.flags |= disk::FLAG_CLEAN_CLOSE;
        self.update_header()?;
        self.file = None;
        info!(
            path = %self.path.display(),
            count = self.msg_count,
            first_seq = self.first_seq,
            last_seq = self.last_seq,
            "log writer closed"
        );
        Ok(())
    }

    /// Number of records accepted so far.
    pub fn message_count(&self) -> i64 {
        self.msg_count
    }

    /// Sequence number of the first accepted record, sentinel if none.
    pub fn first_seq(&self) -> Seq {
        self.first_seq
    }

    /// Sequence number of the last accepted record, sentinel if none.
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the writer still has the file open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn update_header(&mut self) -> Result<()> {
        let writer = self.file.as_mut().ok_or_else(closed_error)?;
        writer.flush()?;

        self.header.msg_count = self.msg_count;
        self.header.first_seq = self.first_seq;
        self.header.last_seq = self.last_seq;

        // Rewrite the header in place, then restore the append
        // position so subsequent writes continue at the tail.
        let file = writer.get_mut();
        let append_pos = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.encode())?;
        file.seek(SeekFrom::Start(append_pos))?;
        file.sync_data()?;
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!(path = %self.path.display(), "log writer dropped without close");
            let _ = self.close();
        }
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "log writer is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{decode_record, FileHeader, HEADER_SIZE};
    use tempfile::tempdir;

    fn raw_header(path: &Path) -> FileHeader {
        let bytes = std::fs::read(path).unwrap();
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&bytes[..HEADER_SIZE]);
        FileHeader::decode(&buf)
    }

    #[test]
    fn create_writes_placeholder_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writer_create.bin");

        let writer = LogWriter::create(&path).unwrap();
        assert!(writer.is_open());
        assert_eq!(writer.message_count(), 0);

        let header = raw_header(&path);
        assert!(header.is_valid());
        assert_eq!(header.msg_count, 0);
        assert_eq!(header.first_seq, INVALID_SEQ);
        assert!(!header.is_clean_close());
    }

    #[test]
    fn write_does_not_touch_header_until_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writer_flush.bin");

        let mut writer = LogWriter::create(&path).unwrap();
        for seq in 0..5 {
            writer.write(&Msg::new(seq, seq * 10, seq as f64)).unwrap();
        }
        writer.flush().unwrap();

        // Buffered appends only; header still reports the last flush.
        writer.write(&Msg::new(5, 50, 5.0)).unwrap();

        let header = raw_header(&path);
        assert_eq!(header.msg_count, 5);
        assert_eq!(header.first_seq, 0);
        assert_eq!(header.last_seq, 4);
        assert!(!header.is_clean_close());
    }

    #[test]
    fn close_sets_clean_flag_and_final_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writer_close.bin");

        let mut writer = LogWriter::create(&path).unwrap();
        for seq in 0..10 {
            writer.write(&Msg::new(seq, 0, 1.5)).unwrap();
        }
        writer.close().unwrap();
        assert!(!writer.is_open());

        let header = raw_header(&path);
        assert!(header.is_clean_close());
        assert!(header.is_consistent());
        assert_eq!(header.msg_count, 10);
        assert_eq!(header.last_seq, 9);

        // Records follow the header tightly packed.
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 10 * Msg::SIZE);
        let first = decode_record(&bytes, HEADER_SIZE);
        assert_eq!(first.seq_num, 0);
    }

    #[test]
    fn drop_closes_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writer_drop.bin");

        {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.write(&Msg::new(0, 0, 1.0)).unwrap();
        }

        let header = raw_header(&path);
        assert!(header.is_clean_close());
        assert_eq!(header.msg_count, 1);
    }

    #[test]
    fn first_seq_is_never_mutated_after_first_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writer_first.bin");

        let mut writer = LogWriter::create(&path).unwrap();
        writer.write(&Msg::new(7, 0, 0.0)).unwrap();
        writer.write(&Msg::new(8, 0, 0.0)).unwrap();
        writer.write(&Msg::new(9, 0, 0.0)).unwrap();

        assert_eq!(writer.first_seq(), 7);
        assert_eq!(writer.last_seq(), 9);
        assert_eq!(writer.message_count(), 3);
    }
}
