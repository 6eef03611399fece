//! Operational transform for character-offset insert/delete.
//!
//! A candidate authored against version `v` is walked through every
//! accepted operation in `(v, head]`, one at a time, until it is valid
//! against `head`:
//!
//! ```text
//!   candidate@v ──► prior(v+1) ──► prior(v+2) ──► … ──► candidate@head
//! ```
//!
//! Rules against a prior insert at `p` of length `L`:
//!   - `p < pos`            → shift right by `L`
//!   - `p == pos` (insert)  → lower origin id stays left; same origin keeps
//!                            log order (the prior one stays left)
//!   - `p > pos`            → unchanged
//!
//! Rules against a prior delete of `[p, p+L)`:
//!   - `pos <= p`           → unchanged
//!   - `pos >= p+L`         → shift left by `L`
//!   - inside               → clamp to `p`, mark clamped
//!
//! Delete candidates map both ends of their range, so an insert strictly
//! inside grows the range and an overlapping delete shrinks it, down to a
//! zero-length no-op.
//!
//! Everything here is pure: inputs are borrowed, outputs are new values.
//! Offset arithmetic saturates, so a candidate that starts out of range
//! stays out of range and is rejected when applied.

use thiserror::Error;

use crate::operation::{OpKind, Operation};
use crate::oplog::{LogError, LoggedOp, OperationLog};

/// Why a candidate could not be rebased onto the log head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The ops between `base` and head were discarded; the client needs
    /// a full snapshot.
    #[error("base version {base} is older than retained floor {floor}")]
    ResyncRequired { base: u64, floor: u64 },
    /// The client claims a version the server never produced.
    #[error("base version {base} is ahead of current version {current}")]
    FutureVersion { base: u64, current: u64 },
}

impl From<LogError> for TransformError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Compacted { base, floor } => Self::ResyncRequired { base, floor },
            LogError::Ahead { base, head } => Self::FutureVersion {
                base,
                current: head,
            },
            // `since` never reports gaps
            LogError::Gap { expected, .. } => Self::FutureVersion {
                base: expected,
                current: expected.saturating_sub(1),
            },
        }
    }
}

/// Rebase `candidate` onto the head of `log`.
pub fn rebase(candidate: &Operation, log: &OperationLog) -> Result<Operation, TransformError> {
    let prior = log.since(candidate.base_version)?;
    Ok(transform(candidate, prior))
}

/// Transform `candidate` through `prior`, which must be the contiguous,
/// version-ordered ops following `candidate.base_version`.
pub fn transform(candidate: &Operation, prior: &[LoggedOp]) -> Operation {
    prior
        .iter()
        .fold(candidate.clone(), |op, entry| transform_against(&op, entry))
}

/// Transform `candidate` past a single accepted operation.
pub fn transform_against(candidate: &Operation, prior: &LoggedOp) -> Operation {
    let mut next = candidate.clone();
    next.base_version = prior.version;

    match (&candidate.kind, &prior.op.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { .. }) => {
            if insert_goes_first(&prior.op, candidate) {
                next.position = next.position.saturating_add(prior.op.len());
            }
        }
        (OpKind::Insert { .. }, OpKind::Delete { len }) => {
            let (position, clamped) = through_delete(candidate.position, prior.op.position, *len);
            next.position = position;
            next.clamped |= clamped;
        }
        (OpKind::Delete { len }, OpKind::Insert { .. }) => {
            let start = candidate.position;
            let end = start.saturating_add(*len);
            let at = prior.op.position;
            let inserted = prior.op.len();
            if at <= start {
                next.position = start.saturating_add(inserted);
            } else if at < end {
                next.kind = OpKind::Delete {
                    len: len.saturating_add(inserted),
                };
            }
        }
        (OpKind::Delete { len }, OpKind::Delete { len: prior_len }) => {
            let start = candidate.position;
            let end = start.saturating_add(*len);
            let (new_start, start_clamped) = through_delete(start, prior.op.position, *prior_len);
            let (new_end, end_clamped) = through_delete(end, prior.op.position, *prior_len);
            let overlaps = start.max(prior.op.position) < end.min(prior.op.position.saturating_add(*prior_len));
            next.position = new_start;
            next.kind = OpKind::Delete {
                len: new_end.saturating_sub(new_start),
            };
            next.clamped |= start_clamped || end_clamped || overlaps;
        }
    }
    next
}

/// Where an offset ends up after `op` is applied. Used for cursors, which
/// move right with text inserted at their position.
pub fn map_position(position: usize, op: &Operation) -> usize {
    match &op.kind {
        OpKind::Insert { .. } if op.position <= position => position.saturating_add(op.len()),
        OpKind::Insert { .. } => position,
        OpKind::Delete { len } => through_delete(position, op.position, *len).0,
    }
}

fn insert_goes_first(prior: &Operation, candidate: &Operation) -> bool {
    if prior.position != candidate.position {
        return prior.position < candidate.position;
    }
    prior.origin <= candidate.origin
}

fn through_delete(position: usize, start: usize, len: usize) -> (usize, bool) {
    if position <= start {
        (position, false)
    } else if position >= start.saturating_add(len) {
        (position - len, false)
    } else {
        (start, true)
    }
}
