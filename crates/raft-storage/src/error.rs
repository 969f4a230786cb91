//! # error
//!
//! why: separate recoverable tail damage from fatal load failures
//! relations: returned by every raft-storage api, wrapped by raft-node's RaftError
//! what: StorageError, CodecError and the crate Result alias

use raft_core::{LogError, LogIndex};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Failures while decoding a framed record stream, before a path is known
#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("corrupt fragment at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: &'static str },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt wal {path:?} at offset {offset}: {reason}")]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: &'static str,
    },

    #[error("wal segments are not continuous: expected sequence {expected}, found {found}")]
    WalGap { expected: u64, found: u64 },

    #[error("wal starts at index {start_index} but the snapshot only covers up to {snapshot_index}")]
    WalNotCovering {
        snapshot_index: LogIndex,
        start_index: LogIndex,
    },

    #[error("corrupt snapshot {path:?}: {reason}")]
    SnapshotCorrupt { path: PathBuf, reason: &'static str },

    #[error("snapshot transfer for index {index} rejected at offset {offset}: {reason}")]
    SnapshotStream {
        index: LogIndex,
        offset: u64,
        reason: &'static str,
    },

    #[error("wal record encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("snapshot payload of {0} bytes does not fit the 4-byte length prefix")]
    SnapshotTooLarge(usize),
}

impl StorageError {
    /// Attach the file path to a codec failure
    pub fn from_codec(err: CodecError, path: &std::path::Path) -> Self {
        match err {
            CodecError::Io(err) => Self::Io(err),
            CodecError::Corrupt { offset, reason } => Self::Corruption {
                path: path.to_path_buf(),
                offset,
                reason,
            },
        }
    }

    /// True for failures of a single snapshot transfer that leave the store intact
    pub fn is_transfer_rejection(&self) -> bool {
        matches!(self, Self::SnapshotStream { .. })
    }
}
