//! # recorder
//!
//! why: give the log manager an append-only record stream over one segment file
//! relations: wraps codec.rs framing around a std::fs::File, used by manager.rs
//! what: LogRecorder (sequential next/put, tail truncation, durable sync)

use crate::codec::{encode_record, RecordDecoder};
use crate::error::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sequential reader and appender for one wal segment.
///
/// Records are read front to back with `next`; writes always land at the end
/// of the file. There is no random access and nothing is edited in place.
#[derive(Debug)]
pub struct LogRecorder {
    path: PathBuf,
    file: File,
    decoder: RecordDecoder,
    len: u64,
    scratch: Vec<u8>,
}

impl LogRecorder {
    /// Create a fresh segment; fails if the file already exists
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self::with_file(path, file, 0))
    }

    /// Open an existing segment for replay followed by appends
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_file(path, file, len))
    }

    fn with_file(path: PathBuf, file: File, len: u64) -> Self {
        Self {
            path,
            file,
            decoder: RecordDecoder::new(),
            len,
            scratch: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length, padding included
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// End of the last complete record returned by `next`
    pub fn bytes_read(&self) -> u64 {
        self.decoder.valid_offset()
    }

    /// Next record, or `None` once the segment is exhausted
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        self.decoder
            .next_record(&mut self.file)
            .map_err(|err| StorageError::from_codec(err, &self.path))
    }

    /// Append one record. Call `sync` to make it durable.
    pub fn put(&mut self, record: &[u8]) -> Result<()> {
        self.scratch.clear();
        let written = encode_record(self.len, record, &mut self.scratch);
        self.file.write_all(&self.scratch)?;
        self.len += written as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Cut the file back to `len` bytes, dropping a damaged tail
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_come_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        let mut writer = LogRecorder::create(&path).unwrap();
        for i in 0..10u8 {
            writer.put(&vec![i; i as usize * 1000]).unwrap();
        }
        writer.sync().unwrap();
        drop(writer);

        let mut reader = LogRecorder::open(&path).unwrap();
        for i in 0..10u8 {
            assert_eq!(reader.next().unwrap().unwrap(), vec![i; i as usize * 1000]);
        }
        assert!(reader.next().unwrap().is_none());
        assert_eq!(reader.bytes_read(), reader.len());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        LogRecorder::create(&path).unwrap();
        assert!(LogRecorder::create(&path).is_err());
    }

    #[test]
    fn truncated_tail_resumes_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        let mut writer = LogRecorder::create(&path).unwrap();
        writer.put(b"kept").unwrap();
        writer.put(b"torn record").unwrap();
        writer.sync().unwrap();
        let full = writer.len();
        drop(writer);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let mut recorder = LogRecorder::open(&path).unwrap();
        assert_eq!(recorder.next().unwrap().unwrap(), b"kept".to_vec());
        let err = recorder.next().unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
        let valid = recorder.bytes_read();
        recorder.truncate(valid).unwrap();
        recorder.put(b"after repair").unwrap();
        recorder.sync().unwrap();
        drop(recorder);

        let mut reader = LogRecorder::open(&path).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), b"kept".to_vec());
        assert_eq!(reader.next().unwrap().unwrap(), b"after repair".to_vec());
        assert!(reader.next().unwrap().is_none());
    }
}
