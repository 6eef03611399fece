//! Bounded log of accepted operations.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                  OperationLog                      │
//! │                                                    │
//! │  floor ◄── v(floor+1) ◄── v(floor+2) ◄── … ◄── head│
//! │  (discarded)   (retained, version order)           │
//! │                                                    │
//! │  Retention: last N ops, or back to the slowest     │
//! │  attached client, whichever keeps more; capped at  │
//! │  max_len.                                          │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! A client authored against `v >= floor` can be caught up by replaying
//! or transforming through `since(v)`; anything older needs a snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::Operation;

/// An operation together with the version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOp {
    pub version: u64,
    pub op: Operation,
}

/// Log range errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// The requested version has been compacted away.
    #[error("version {base} predates the retained log (floor {floor})")]
    Compacted { base: u64, floor: u64 },
    /// The requested version has not happened yet.
    #[error("version {base} is ahead of the log head {head}")]
    Ahead { base: u64, head: u64 },
    /// Appended entry does not directly follow the head.
    #[error("log gap: expected version {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
}

/// Snapshot of log bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub floor: u64,
    pub head: u64,
    pub retained: usize,
    pub discarded: u64,
}

pub struct OperationLog {
    /// Version immediately before the oldest retained entry
    floor: u64,
    /// Retained entries, contiguous versions floor+1..=head
    entries: Vec<LoggedOp>,
    /// Minimum number of entries kept regardless of client progress
    retention: usize,
    /// Hard cap, even if a slow client still needs older entries
    max_len: usize,
    /// Total entries dropped since creation
    discarded: u64,
}

impl OperationLog {
    /// Create an empty log whose first entry will be `floor + 1`.
    pub fn new(floor: u64, retention: usize, max_len: usize) -> Self {
        Self {
            floor,
            entries: Vec::with_capacity(retention.min(1024)),
            retention,
            max_len: max_len.max(retention),
            discarded: 0,
        }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Version of the newest entry (equals `floor` when empty).
    pub fn head(&self) -> u64 {
        self.floor + self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the entry for `version`, which must be `head + 1`.
    pub fn append(&mut self, version: u64, op: Operation) -> Result<(), LogError> {
        let expected = self.head() + 1;
        if version != expected {
            return Err(LogError::Gap {
                expected,
                got: version,
            });
        }
        self.entries.push(LoggedOp { version, op });
        Ok(())
    }

    /// Entries with version greater than `base`, in version order.
    pub fn since(&self, base: u64) -> Result<&[LoggedOp], LogError> {
        if base < self.floor {
            return Err(LogError::Compacted {
                base,
                floor: self.floor,
            });
        }
        let head = self.head();
        if base > head {
            return Err(LogError::Ahead { base, head });
        }
        Ok(&self.entries[(base - self.floor) as usize..])
    }

    /// Apply the retention policy.
    ///
    /// `slowest_acked` is the lowest `last_acked_version` among attached
    /// clients (None when nobody is attached). Returns entries dropped.
    pub fn retain(&mut self, slowest_acked: Option<u64>) -> usize {
        let head = self.head();
        let by_count = head.saturating_sub(self.retention as u64);
        let mut boundary = match slowest_acked {
            Some(acked) => by_count.min(acked),
            None => by_count,
        };
        boundary = boundary.max(head.saturating_sub(self.max_len as u64));
        self.discard_through(boundary)
    }

    /// Drop every entry with version lower than `keep_from`.
    pub fn compact_to(&mut self, keep_from: u64) -> usize {
        self.discard_through(keep_from.saturating_sub(1))
    }

    /// Forget everything and restart at `floor`.
    pub fn reset(&mut self, floor: u64) {
        self.discarded += self.entries.len() as u64;
        self.entries.clear();
        self.floor = floor;
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            floor: self.floor,
            head: self.head(),
            retained: self.entries.len(),
            discarded: self.discarded,
        }
    }

    fn discard_through(&mut self, boundary: u64) -> usize {
        let boundary = boundary.min(self.head());
        if boundary <= self.floor {
            return 0;
        }
        let count = (boundary - self.floor) as usize;
        self.entries.drain(..count);
        self.floor = boundary;
        self.discarded += count as u64;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(count: u64, retention: usize, max_len: usize) -> OperationLog {
        let mut log = OperationLog::new(0, retention, max_len);
        for v in 1..=count {
            log.append(v, Operation::insert(0, "x", v - 1)).unwrap();
        }
        log
    }

    #[test]
    fn test_append_and_since() {
        let log = filled(5, 100, 1000);
        assert_eq!(log.head(), 5);
        assert_eq!(log.since(5).unwrap().len(), 0);

        let tail = log.since(2).unwrap();
        let versions: Vec<u64> = tail.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn test_append_gap_rejected() {
        let mut log = filled(2, 100, 1000);
        let err = log.append(4, Operation::insert(0, "x", 3)).unwrap_err();
        assert_eq!(err, LogError::Gap { expected: 3, got: 4 });
        assert_eq!(log.head(), 2);
    }

    #[test]
    fn test_since_ahead_of_head() {
        let log = filled(2, 100, 1000);
        assert_eq!(log.since(3).unwrap_err(), LogError::Ahead { base: 3, head: 2 });
    }

    #[test]
    fn test_compact_to() {
        let mut log = filled(20, 100, 1000);
        assert_eq!(log.compact_to(15), 14);
        assert_eq!(log.floor(), 14);
        assert_eq!(log.since(14).unwrap()[0].version, 15);
        assert_eq!(
            log.since(10).unwrap_err(),
            LogError::Compacted { base: 10, floor: 14 }
        );
        assert!(log.since(20).unwrap().is_empty());
    }

    #[test]
    fn test_retain_by_count() {
        let mut log = filled(10, 4, 1000);
        assert_eq!(log.retain(None), 6);
        assert_eq!(log.floor(), 6);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_retain_keeps_slow_client() {
        let mut log = filled(10, 4, 1000);
        // A client stuck at version 3 keeps entries 4..=10 alive
        assert_eq!(log.retain(Some(3)), 3);
        assert_eq!(log.floor(), 3);
        assert!(log.since(3).is_ok());
    }

    #[test]
    fn test_retain_respects_hard_cap() {
        let mut log = filled(10, 2, 5);
        log.retain(Some(0));
        assert_eq!(log.floor(), 5);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_reset_and_stats() {
        let mut log = filled(6, 100, 1000);
        log.compact_to(3);
        log.reset(42);

        let stats = log.stats();
        assert_eq!(stats.floor, 42);
        assert_eq!(stats.head, 42);
        assert_eq!(stats.retained, 0);
        assert_eq!(stats.discarded, 6);
    }
}
