//! # wal
//!
//! why: name the state changes that must hit disk before they take effect
//! relations: records are bincode-encoded into recorder.rs frames by manager.rs
//! what: WalRecord tagged union, segment file naming and directory listing

use crate::error::Result;
use raft_core::{LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const WAL_DIR_NAME: &str = "wal";
pub const WAL_FILE_EXT: &str = "wal";
/// Suffix of a segment still being written by a rotation
pub const WAL_STAGING_EXT: &str = "tmp";

/// Segments rotate once they reach this size
pub const WAL_SEGMENT_LIMIT: u64 = 64 * 1024 * 1024;

/// One durable state change, replayed in file order at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Reserved for membership changes; ignored on replay
    ConfChanged,
    TermChanged { term: Term },
    VoteChanged { voted_for: Option<NodeId> },
    EntriesAppended { entries: Vec<LogEntry> },
    EntriesErased { first: LogIndex, last: LogIndex },
    /// Highest index known to be committed cluster-wide
    CommitAdvanced { index: LogIndex },
}

impl WalRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A segment file identified by its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u64,
    /// Lowest log index this segment may append
    pub start_index: LogIndex,
    pub path: PathBuf,
}

impl Segment {
    pub fn file_name(seq: u64, start_index: LogIndex) -> String {
        format!("{seq:016}-{start_index:016}.{WAL_FILE_EXT}")
    }

    pub fn staging_name(seq: u64, start_index: LogIndex) -> String {
        format!("{}.{WAL_STAGING_EXT}", Self::file_name(seq, start_index))
    }

    /// Parse `<seq>-<start>.wal`
    pub fn parse_name(name: &str) -> Option<(u64, LogIndex)> {
        let stem = name.strip_suffix(WAL_FILE_EXT)?.strip_suffix('.')?;
        let (seq, start) = stem.split_once('-')?;
        Some((seq.parse().ok()?, start.parse().ok()?))
    }
}

/// All recognizable segments in `dir`, ordered by sequence number
pub fn list_segments(dir: &Path) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(WAL_FILE_EXT) {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().and_then(Segment::parse_name) {
            Some((seq, start_index)) => segments.push(Segment {
                seq,
                start_index,
                path,
            }),
            None => warn!(file = ?path, "unrecognized wal file, skipping"),
        }
    }
    segments.sort_by_key(|segment| segment.seq);
    Ok(segments)
}

/// Delete rotations that never made it into place
pub fn remove_staging(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(WAL_STAGING_EXT) {
            warn!(file = ?path, "removing unfinished wal segment");
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
