//! # snapshot
//!
//! why: keep the compacted state-machine image on disk and hand it out without copies
//! relations: owned by manager.rs; the leader streams `file_bytes()` to lagging followers
//! what: SnapshotStore (load newest, atomic save, chunked install), memory-mapped view
//!
//! file layout: `<index:016>-<term:016>.snap` holding a 4-byte little-endian
//! payload length followed by the payload. writes go to `<name>.staging`
//! first and are renamed into place when complete.

use crate::error::{Result, StorageError};
use memmap2::Mmap;
use raft_core::{LogIndex, Term};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SNAP_DIR_NAME: &str = "snap";
pub const SNAP_FILE_EXT: &str = "snap";
pub const STAGING_EXT: &str = "staging";

const LEN_PREFIX: usize = 4;

/// A loaded, read-only snapshot file
#[derive(Debug)]
pub struct Snapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    path: PathBuf,
    map: Mmap,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole file, length prefix included
    pub fn file_bytes(&self) -> &[u8] {
        &self.map
    }

    /// Application bytes only
    pub fn data(&self) -> &[u8] {
        &self.map[LEN_PREFIX..]
    }

    fn load(path: PathBuf, last_index: LogIndex, last_term: Term) -> Result<Self> {
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < LEN_PREFIX as u64 {
            return Err(StorageError::SnapshotCorrupt {
                path,
                reason: "shorter than its length prefix",
            });
        }
        // SAFETY: snapshot files are never modified after the rename that
        // publishes them; superseded files are unlinked, not rewritten.
        let map = unsafe { Mmap::map(&file)? };
        let declared = u32::from_le_bytes([map[0], map[1], map[2], map[3]]) as u64;
        if declared + LEN_PREFIX as u64 != file_len {
            return Err(StorageError::SnapshotCorrupt {
                path,
                reason: "length prefix does not match file size",
            });
        }
        Ok(Self {
            last_index,
            last_term,
            path,
            map,
        })
    }
}

/// Receiving side of a chunked transfer
#[derive(Debug)]
struct Staging {
    index: LogIndex,
    term: Term,
    path: PathBuf,
    file: File,
    received: u64,
}

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    current: Option<Snapshot>,
    staging: Option<Staging>,
}

impl SnapshotStore {
    /// Open `<data_dir>/snap`, loading the newest snapshot.
    ///
    /// Older snapshots and leftover staging files are removed. A damaged
    /// newest snapshot fails the open.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(SNAP_DIR_NAME);
        fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(STAGING_EXT) => {
                    warn!(file = ?path, "removing stale snapshot staging file");
                    fs::remove_file(&path)?;
                }
                Some(SNAP_FILE_EXT) => match path.file_name().and_then(|n| n.to_str()).and_then(parse_name) {
                    Some((index, term)) => found.push((index, term, path)),
                    None => warn!(file = ?path, "unrecognized snapshot file, skipping"),
                },
                _ => {}
            }
        }
        found.sort_by_key(|(index, term, _)| (*index, *term));

        let current = match found.pop() {
            Some((index, term, path)) => {
                let snapshot = Snapshot::load(path, index, term)?;
                info!(index, term, "loaded snapshot");
                Some(snapshot)
            }
            None => None,
        };
        for (_, _, path) in found {
            fs::remove_file(path)?;
        }
        Ok(Self {
            dir,
            current,
            staging: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    /// Index covered by the snapshot, 0 without one
    pub fn last_index(&self) -> LogIndex {
        self.current.as_ref().map_or(0, |s| s.last_index)
    }

    pub fn last_term(&self) -> Term {
        self.current.as_ref().map_or(0, |s| s.last_term)
    }

    pub fn data(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], Snapshot::data)
    }

    pub fn file_bytes(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], Snapshot::file_bytes)
    }

    /// Write a snapshot of `data` covering everything up to `index`
    pub fn save(&mut self, index: LogIndex, term: Term, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| StorageError::SnapshotTooLarge(data.len()))?;
        let final_path = self.dir.join(file_name(index, term));
        let staging_path = staging_path(&final_path);
        {
            let mut file = File::create(&staging_path)?;
            file.write_all(&len.to_le_bytes())?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&staging_path, &final_path)?;
        self.publish(final_path, index, term)
    }

    /// Receive one chunk of a snapshot file streamed from the leader.
    ///
    /// Offset 0 starts a new transfer. Returns `true` once the final chunk
    /// has been written and the snapshot is live.
    pub fn install(
        &mut self,
        index: LogIndex,
        term: Term,
        offset: u64,
        chunk: &[u8],
        done: bool,
    ) -> Result<bool> {
        if offset == 0 {
            self.abort_install()?;
            let path = staging_path(&self.dir.join(file_name(index, term)));
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            self.staging = Some(Staging {
                index,
                term,
                path,
                file,
                received: 0,
            });
        }
        let staging = match self.staging.as_mut() {
            Some(s) if s.index == index && s.term == term => s,
            _ => {
                return Err(StorageError::SnapshotStream {
                    index,
                    offset,
                    reason: "no transfer in progress for this snapshot",
                })
            }
        };
        if offset > staging.received {
            return Err(StorageError::SnapshotStream {
                index,
                offset,
                reason: "chunk leaves a gap",
            });
        }
        staging.file.seek(SeekFrom::Start(offset))?;
        staging.file.write_all(chunk)?;
        staging.received = staging.received.max(offset + chunk.len() as u64);
        if !done {
            return Ok(false);
        }

        staging.file.sync_all()?;
        let received_path = staging.path.clone();
        self.staging = None;
        let final_path = self.dir.join(file_name(index, term));
        fs::rename(&received_path, &final_path)?;
        if let Err(err) = self.publish(final_path.clone(), index, term) {
            let _ = fs::remove_file(&final_path);
            return Err(match err {
                StorageError::SnapshotCorrupt { .. } => StorageError::SnapshotStream {
                    index,
                    offset,
                    reason: "received file is malformed",
                },
                other => other,
            });
        }
        Ok(true)
    }

    fn abort_install(&mut self) -> Result<()> {
        if let Some(staging) = self.staging.take() {
            drop(staging.file);
            if staging.path.exists() {
                fs::remove_file(&staging.path)?;
            }
        }
        Ok(())
    }

    fn publish(&mut self, path: PathBuf, index: LogIndex, term: Term) -> Result<()> {
        let snapshot = Snapshot::load(path.clone(), index, term)?;
        if let Some(previous) = self.current.replace(snapshot) {
            let old_path = previous.path.clone();
            drop(previous);
            if old_path != path {
                fs::remove_file(old_path)?;
            }
        }
        info!(index, term, "snapshot published");
        Ok(())
    }
}

fn file_name(index: LogIndex, term: Term) -> String {
    format!("{index:016}-{term:016}.{SNAP_FILE_EXT}")
}

fn staging_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".");
    name.push(STAGING_EXT);
    PathBuf::from(name)
}

fn parse_name(name: &str) -> Option<(LogIndex, Term)> {
    let stem = name.strip_suffix(SNAP_FILE_EXT)?.strip_suffix('.')?;
    let (index, term) = stem.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}
