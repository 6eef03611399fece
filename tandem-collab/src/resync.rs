//! Replay-or-snapshot decision for reconnecting and lagging clients.
//!
//! ```text
//!   last_acked < floor            → Snapshot (ops discarded)
//!   floor <= last_acked <= head   → Replay   (ops in (last_acked, head])
//!   last_acked > head             → Snapshot (server went back in time)
//! ```

use crate::document::DocumentState;
use crate::oplog::{LoggedOp, OperationLog};
use crate::protocol::ServerMessage;

/// Catch-up payload for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncPlan {
    /// Missing operations, in version order. Empty when already current.
    Replay { from_version: u64, ops: Vec<LoggedOp> },
    /// Full state; the client drops unacknowledged edits older than `version`.
    Snapshot { content: String, version: u64 },
}

impl ResyncPlan {
    /// Decide how to bring a client at `last_acked` up to `document`.
    pub fn plan(document: &DocumentState, log: &OperationLog, last_acked: u64) -> Self {
        match log.since(last_acked) {
            Ok(ops) => Self::Replay {
                from_version: last_acked,
                ops: ops.to_vec(),
            },
            Err(err) => {
                log::debug!("resync from v{last_acked} needs a snapshot: {err}");
                let (content, version) = document.snapshot();
                Self::Snapshot { content, version }
            }
        }
    }

    /// Version the client is at once the plan has been applied.
    pub fn version(&self) -> u64 {
        match self {
            Self::Replay { from_version, ops } => {
                ops.last().map(|entry| entry.version).unwrap_or(*from_version)
            }
            Self::Snapshot { version, .. } => *version,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot { .. })
    }

    pub fn into_message(self) -> ServerMessage {
        match self {
            Self::Replay { from_version, ops } => ServerMessage::Replay { from_version, ops },
            Self::Snapshot { content, version } => ServerMessage::Snapshot { content, version },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn history(count: u64) -> (DocumentState, OperationLog) {
        let mut doc = DocumentState::empty();
        let mut log = OperationLog::new(0, 1024, 1024);
        for v in 0..count {
            let (version, op) = doc.apply(Operation::insert(0, "a", v)).unwrap();
            log.append(version, op).unwrap();
        }
        (doc, log)
    }

    #[test]
    fn test_replay_within_log() {
        let (doc, log) = history(12);
        let plan = ResyncPlan::plan(&doc, &log, 10);

        match &plan {
            ResyncPlan::Replay { from_version, ops } => {
                assert_eq!(*from_version, 10);
                let versions: Vec<u64> = ops.iter().map(|e| e.version).collect();
                assert_eq!(versions, vec![11, 12]);
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(plan.version(), 12);
    }

    #[test]
    fn test_up_to_date_client_gets_empty_replay() {
        let (doc, log) = history(3);
        let plan = ResyncPlan::plan(&doc, &log, 3);
        assert!(!plan.is_snapshot());
        assert_eq!(plan.version(), 3);
    }

    #[test]
    fn test_snapshot_after_compaction() {
        let (doc, mut log) = history(20);
        log.compact_to(15);

        let plan = ResyncPlan::plan(&doc, &log, 10);
        assert_eq!(
            plan,
            ResyncPlan::Snapshot {
                content: "a".repeat(20),
                version: 20
            }
        );
    }

    #[test]
    fn test_snapshot_when_client_is_ahead() {
        let (doc, log) = history(4);
        let plan = ResyncPlan::plan(&doc, &log, 9);
        assert!(plan.is_snapshot());
        assert_eq!(plan.version(), 4);
    }

    #[test]
    fn test_into_message() {
        let (doc, log) = history(2);
        let msg = ResyncPlan::plan(&doc, &log, 1).into_message();
        assert!(matches!(msg, ServerMessage::Replay { from_version: 1, ref ops } if ops.len() == 1));
    }
}
