//! # log
//!
//! why: hold the replicated log in memory, addressed by absolute index
//! relations: owned by raft-storage's LogManager, which makes every mutation durable first
//! what: LogEntry struct, MemoryLog (dense [begin, end) window with front/back truncation)

use crate::error::LogError;
use crate::node::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// Opaque command bytes handed to the state machine once committed
    pub data: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self { term, index, data }
    }
}

/// Dense in-memory window over the log.
///
/// Entries occupy the half-open range `[begin, end)`. Everything below
/// `begin` has been folded into a snapshot. Lookups outside the window
/// return `None`; no index passed in from outside can make this panic.
#[derive(Debug)]
pub struct MemoryLog {
    entries: VecDeque<LogEntry>,
    start_index: LogIndex,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            start_index: 1,
        }
    }

    /// First index held in memory.
    pub fn begin(&self) -> LogIndex {
        self.start_index
    }

    /// One past the last index held in memory.
    pub fn end(&self) -> LogIndex {
        self.start_index + self.entries.len() as u64
    }

    /// Index of the last entry, or `begin() - 1` when the window is empty.
    pub fn last_index(&self) -> LogIndex {
        self.end() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.to_pos(index).and_then(|pos| self.entries.get(pos))
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.at(index).map(|entry| entry.term)
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Entries in `[first, last)`, clamped to the window.
    pub fn range(&self, first: LogIndex, last: LogIndex) -> impl Iterator<Item = &LogEntry> {
        let first = first.max(self.begin());
        let last = last.min(self.end());
        let (skip, take) = if first < last {
            ((first - self.start_index) as usize, (last - first) as usize)
        } else {
            (0, 0)
        };
        self.entries.iter().skip(skip).take(take)
    }

    /// Append entries at the tail.
    ///
    /// Entries below `begin()` are already covered by a snapshot and are
    /// skipped. Every other entry must land exactly at `end()`.
    pub fn append<I>(&mut self, entries: I) -> Result<usize, LogError>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut appended = 0;
        for entry in entries {
            if entry.index < self.start_index {
                continue;
            }
            let expected = self.end();
            if entry.index != expected {
                return Err(LogError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            self.entries.push_back(entry);
            appended += 1;
        }
        Ok(appended)
    }

    /// Remove `[first, last)` from the window.
    ///
    /// The clamped range has to touch one end of the window: a range that
    /// starts at `begin()` compacts the front, one that reaches `end()`
    /// rolls back the tail. Returns the number of entries removed.
    pub fn erase(&mut self, first: LogIndex, last: LogIndex) -> Result<usize, LogError> {
        let first = first.max(self.begin());
        let last = last.min(self.end());
        if first >= last {
            return Ok(0);
        }
        let removed = (last - first) as usize;
        if last == self.end() {
            self.entries.truncate((first - self.start_index) as usize);
        } else if first == self.begin() {
            self.entries.drain(..removed);
            self.start_index = last;
        } else {
            return Err(LogError::InteriorErase { first, last });
        }
        Ok(removed)
    }

    /// Drop everything below `start_index` and make it the new `begin()`.
    ///
    /// Moving past `end()` empties the window. Moving backwards is only
    /// possible while the window is empty.
    pub fn reset(&mut self, start_index: LogIndex) {
        if start_index >= self.end() {
            self.entries.clear();
            self.start_index = start_index;
        } else if start_index > self.start_index {
            let drop = (start_index - self.start_index) as usize;
            self.entries.drain(..drop);
            self.start_index = start_index;
        } else if self.entries.is_empty() {
            self.start_index = start_index;
        }
    }

    fn to_pos(&self, index: LogIndex) -> Option<usize> {
        if index < self.begin() || index >= self.end() {
            return None;
        }
        Some((index - self.start_index) as usize)
    }
}
