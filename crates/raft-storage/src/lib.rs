//! # raft-storage
//!
//! why: make raft term, vote and log changes crash-durable before they take effect
//! relations: used by raft-node's RaftNode through LogManager, builds on raft-core's MemoryLog
//! what: block-framed record codec, segment recorder, wal records, snapshot store, log manager
//!
//! on-disk layout under a node's data directory:
//!
//! ```text
//! <data_dir>/wal/<seq:016>-<start_index:016>.wal
//! <data_dir>/snap/<index:016>-<term:016>.snap
//! ```

pub mod codec;
pub mod error;
pub mod manager;
pub mod recorder;
pub mod snapshot;
pub mod wal;

pub use error::{Result, StorageError};
pub use manager::LogManager;
pub use recorder::LogRecorder;
pub use snapshot::{Snapshot, SnapshotStore};
pub use wal::{Segment, WalRecord, WAL_SEGMENT_LIMIT};
