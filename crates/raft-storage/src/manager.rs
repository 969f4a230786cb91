//! # manager
//!
//! why: one durable log abstraction that replays to the exact pre-crash state
//! relations: composes raft-core's MemoryLog with recorder.rs, wal.rs and snapshot.rs; owned by raft-node
//! what: LogManager (write-ahead mutations, term/vote, snapshot compaction, wal rotation and replay)
//!
//! every mutation is encoded as a WalRecord, appended, flushed and synced
//! before the in-memory state changes.

use crate::error::{Result, StorageError};
use crate::recorder::LogRecorder;
use crate::snapshot::SnapshotStore;
use crate::wal::{
    list_segments, remove_staging, Segment, WalRecord, WAL_DIR_NAME, WAL_SEGMENT_LIMIT,
};
use raft_core::{LogEntry, LogError, LogIndex, MemoryLog, NodeId, Term, NIL_LOG_INDEX, NIL_LOG_TERM};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct LogManager {
    wal_dir: PathBuf,
    log: MemoryLog,
    snapshot: SnapshotStore,
    writer: Option<LogRecorder>,
    wal_seq: u64,
    segment_limit: u64,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_index: LogIndex,
}

impl LogManager {
    /// Open `data_dir`, load the newest snapshot and replay the wal on top
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_segment_limit(data_dir, WAL_SEGMENT_LIMIT)
    }

    /// Like `open`, rotating segments once they reach `segment_limit` bytes
    pub fn open_with_segment_limit(data_dir: impl AsRef<Path>, segment_limit: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let snapshot = SnapshotStore::open(data_dir)?;
        let mut log = MemoryLog::new();
        log.reset(snapshot.last_index() + 1);

        let wal_dir = data_dir.join(WAL_DIR_NAME);
        fs::create_dir_all(&wal_dir)?;

        let mut manager = Self {
            wal_dir,
            log,
            snapshot,
            writer: None,
            wal_seq: 0,
            segment_limit,
            current_term: 0,
            voted_for: None,
            commit_index: NIL_LOG_INDEX,
        };
        manager.load_wal()?;
        info!(
            start_index = manager.start_index(),
            last_index = manager.last_index(),
            term = manager.current_term,
            commit_index = manager.commit_index,
            "log manager loaded"
        );
        Ok(manager)
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Sequence number of the segment currently appended to
    pub fn wal_seq(&self) -> u64 {
        self.wal_seq
    }

    pub fn snapshot(&self) -> &SnapshotStore {
        &self.snapshot
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Highest commit index persisted so far; may trail the cluster's
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn start_index(&self) -> LogIndex {
        self.log.begin()
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn next_index(&self) -> LogIndex {
        self.log.end()
    }

    pub fn entry_count(&self) -> usize {
        self.log.len()
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.at(index)
    }

    /// Entries in `[first, last)` still held in the log
    pub fn entries(&self, first: LogIndex, last: LogIndex) -> impl Iterator<Item = &LogEntry> {
        self.log.range(first, last)
    }

    /// Term of `index`, answering for the snapshot boundary and the empty prefix too
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == NIL_LOG_INDEX {
            return Some(NIL_LOG_TERM);
        }
        if index == self.snapshot.last_index() {
            return Some(self.snapshot.last_term());
        }
        self.log.term_at(index)
    }

    pub fn last_log_term(&self) -> Term {
        self.log
            .last()
            .map_or_else(|| self.snapshot.last_term(), |entry| entry.term)
    }

    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.log.end();
        for entry in entries.iter().filter(|e| e.index >= self.log.begin()) {
            if entry.index != expected {
                return Err(LogError::NonContiguous {
                    expected,
                    got: entry.index,
                }
                .into());
            }
            expected += 1;
        }
        if expected == self.log.end() {
            return Ok(());
        }
        let record = WalRecord::EntriesAppended { entries };
        self.add_record(&record)?;
        if let WalRecord::EntriesAppended { entries } = record {
            self.log.append(entries)?;
        }
        Ok(())
    }

    /// Remove `[first, last)`; the range must touch either end of the log
    pub fn erase_entries(&mut self, first: LogIndex, last: LogIndex) -> Result<()> {
        let clamped_first = first.max(self.log.begin());
        let clamped_last = last.min(self.log.end());
        if clamped_first >= clamped_last {
            return Ok(());
        }
        if clamped_first != self.log.begin() && clamped_last != self.log.end() {
            return Err(LogError::InteriorErase {
                first: clamped_first,
                last: clamped_last,
            }
            .into());
        }
        self.add_record(&WalRecord::EntriesErased { first, last })?;
        self.log.erase(first, last)?;
        Ok(())
    }

    pub fn set_current_term(&mut self, term: Term) -> Result<()> {
        if self.current_term == term {
            return Ok(());
        }
        self.add_record(&WalRecord::TermChanged { term })?;
        self.current_term = term;
        Ok(())
    }

    pub fn incr_current_term(&mut self) -> Result<Term> {
        self.set_current_term(self.current_term + 1)?;
        Ok(self.current_term)
    }

    pub fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> Result<()> {
        if self.voted_for == voted_for {
            return Ok(());
        }
        self.add_record(&WalRecord::VoteChanged { voted_for })?;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Record that `index` is committed; lower values are ignored
    pub fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        self.add_record(&WalRecord::CommitAdvanced { index })?;
        self.commit_index = index;
        Ok(())
    }

    /// Persist a locally produced snapshot and compact the log behind it
    pub fn save_snapshot(&mut self, index: LogIndex, term: Term, data: &[u8]) -> Result<()> {
        if index <= self.snapshot.last_index() {
            debug!(index, "snapshot already covers index, skipping save");
            return Ok(());
        }
        self.snapshot.save(index, term, data)?;
        self.compact_to(index, term)
    }

    /// Feed one received snapshot chunk; `true` once the snapshot is live
    pub fn install_snapshot(
        &mut self,
        index: LogIndex,
        term: Term,
        offset: u64,
        chunk: &[u8],
        done: bool,
    ) -> Result<bool> {
        let installed = self.snapshot.install(index, term, offset, chunk, done)?;
        if installed {
            self.compact_to(index, term)?;
        }
        Ok(installed)
    }

    /// Drop everything the snapshot at `(index, term)` covers and start a
    /// fresh, self-contained segment
    fn compact_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if self.log.term_at(index) != Some(term) {
            // a different history: nothing after the snapshot can be trusted
            self.log.erase(self.log.begin(), self.log.end())?;
        }
        self.log.reset(index + 1);
        self.writer = Some(self.rotate(true)?);
        for segment in list_segments(&self.wal_dir)? {
            if segment.seq < self.wal_seq {
                fs::remove_file(&segment.path)?;
                debug!(seq = segment.seq, "removed compacted wal segment");
            }
        }
        info!(index, term, start_index = self.log.begin(), "log compacted");
        Ok(())
    }

    fn add_record(&mut self, record: &WalRecord) -> Result<()> {
        let bytes = record.encode()?;
        let mut writer = match self.writer.take() {
            Some(writer) if writer.len() < self.segment_limit => writer,
            _ => self.rotate(false)?,
        };
        writer.put(&bytes)?;
        writer.sync()?;
        self.writer = Some(writer);
        Ok(())
    }

    /// Open the next segment, opening it with a checkpoint of term, vote and
    /// commit index, plus every retained entry when `with_entries` is set.
    ///
    /// The segment is written under a staging name and renamed into place
    /// once synced, so a listed segment always carries its whole checkpoint.
    fn rotate(&mut self, with_entries: bool) -> Result<LogRecorder> {
        let start_index = if with_entries {
            self.log.begin()
        } else {
            self.log.end()
        };
        let seq = self.wal_seq + 1;
        let staging = self.wal_dir.join(Segment::staging_name(seq, start_index));
        let path = self.wal_dir.join(Segment::file_name(seq, start_index));
        {
            let mut staged = LogRecorder::create(&staging)?;
            staged.put(&WalRecord::TermChanged { term: self.current_term }.encode()?)?;
            staged.put(&WalRecord::VoteChanged { voted_for: self.voted_for }.encode()?)?;
            if self.commit_index != NIL_LOG_INDEX {
                staged.put(&WalRecord::CommitAdvanced { index: self.commit_index }.encode()?)?;
            }
            if with_entries && !self.log.is_empty() {
                let entries = self.log.range(self.log.begin(), self.log.end()).cloned().collect();
                staged.put(&WalRecord::EntriesAppended { entries }.encode()?)?;
            }
            staged.sync()?;
        }
        fs::rename(&staging, &path)?;
        fs::File::open(&self.wal_dir)?.sync_all()?;
        let writer = LogRecorder::open(&path)?;
        self.wal_seq = seq;
        info!(seq, start_index, "rotated wal segment");
        Ok(writer)
    }

    fn load_wal(&mut self) -> Result<()> {
        remove_staging(&self.wal_dir)?;
        let segments = list_segments(&self.wal_dir)?;
        if segments.is_empty() {
            return Ok(());
        }
        let snapshot_index = self.snapshot.last_index();
        let base = segments
            .iter()
            .rposition(|segment| segment.start_index <= snapshot_index + 1)
            .ok_or(StorageError::WalNotCovering {
                snapshot_index,
                start_index: segments[0].start_index,
            })?;
        let (obsolete, replay) = segments.split_at(base);
        for pair in replay.windows(2) {
            if pair[1].seq != pair[0].seq + 1 {
                return Err(StorageError::WalGap {
                    expected: pair[0].seq + 1,
                    found: pair[1].seq,
                });
            }
        }
        for (i, segment) in replay.iter().enumerate() {
            self.replay_segment(segment, i + 1 == replay.len())?;
        }
        for segment in obsolete {
            fs::remove_file(&segment.path)?;
            debug!(seq = segment.seq, "removed obsolete wal segment");
        }
        Ok(())
    }

    fn replay_segment(&mut self, segment: &Segment, is_tail: bool) -> Result<()> {
        let mut recorder = LogRecorder::open(&segment.path)?;
        loop {
            match recorder.next() {
                Ok(Some(bytes)) => self.apply_record(WalRecord::decode(&bytes)?)?,
                Ok(None) => break,
                Err(StorageError::Corruption { offset, reason, .. }) if is_tail => {
                    let valid = recorder.bytes_read();
                    warn!(
                        file = ?segment.path,
                        offset,
                        valid,
                        reason,
                        "wal tail corrupted, truncating"
                    );
                    recorder.truncate(valid)?;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if is_tail {
            self.wal_seq = segment.seq;
            self.writer = Some(recorder);
        }
        Ok(())
    }

    fn apply_record(&mut self, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::ConfChanged => {}
            WalRecord::TermChanged { term } => self.current_term = term,
            WalRecord::VoteChanged { voted_for } => self.voted_for = voted_for,
            WalRecord::EntriesAppended { entries } => {
                self.log.append(entries)?;
            }
            WalRecord::EntriesErased { first, last } => {
                self.log.erase(first, last)?;
            }
            WalRecord::CommitAdvanced { index } => {
                self.commit_index = self.commit_index.max(index);
            }
        }
        Ok(())
    }
}
