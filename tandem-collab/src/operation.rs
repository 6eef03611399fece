//! Edit primitives: identifiers and the insert/delete `Operation`.
//!
//! Positions are character offsets (Unicode scalar values), never byte
//! offsets, so the same operation means the same thing to every client
//! regardless of how its editor stores text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-connection client identity.
///
/// Ordering is used by the transform tie-break: concurrent inserts at the
/// same offset are laid out in ascending `ClientId` order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random identity. `ClientId::default()` is the nil id that
    /// the server overwrites when it stamps inbound edits.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an operation does to the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { text: String },
    Delete { len: usize },
}

/// An atomic edit authored against `base_version`.
///
/// Operations are values: transforming one produces a new `Operation`,
/// the input is never touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Character offset of the insertion point or of the first deleted char.
    pub position: usize,
    /// Document version the author observed when creating the edit.
    pub base_version: u64,
    /// Author connection; stamped by the server on receipt.
    #[serde(default)]
    pub origin: ClientId,
    /// Client-local sequence number, echoed back in the acknowledgement.
    #[serde(default)]
    pub seq: u64,
    /// Set when a concurrent delete swallowed this edit's position.
    #[serde(default)]
    pub clamped: bool,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, base_version: u64) -> Self {
        Self {
            kind: OpKind::Insert { text: text.into() },
            position,
            base_version,
            origin: ClientId::default(),
            seq: 0,
            clamped: false,
        }
    }

    pub fn delete(position: usize, len: usize, base_version: u64) -> Self {
        Self {
            kind: OpKind::Delete { len },
            position,
            base_version,
            origin: ClientId::default(),
            seq: 0,
            clamped: false,
        }
    }

    pub fn with_origin(mut self, origin: ClientId) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Number of characters inserted or deleted.
    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { text } => text.chars().count(),
            OpKind::Delete { len } => *len,
        }
    }

    /// A zero-length delete (or empty insert) changes nothing but still
    /// occupies a version once accepted.
    pub fn is_noop(&self) -> bool {
        self.len() == 0
    }

    /// Apply to `content` in place.
    ///
    /// Fails without modifying `content` when the position or range lies
    /// outside the text.
    pub fn apply_to(&self, content: &mut String) -> Result<(), OutOfBounds> {
        match &self.kind {
            OpKind::Insert { text } => {
                let at = byte_offset(content, self.position)
                    .ok_or_else(|| self.out_of_bounds(content))?;
                content.insert_str(at, text);
            }
            OpKind::Delete { len } => {
                let start = byte_offset(content, self.position)
                    .ok_or_else(|| self.out_of_bounds(content))?;
                let end = byte_offset(&content[start..], *len)
                    .map(|offset| start + offset)
                    .ok_or_else(|| self.out_of_bounds(content))?;
                content.replace_range(start..end, "");
            }
        }
        Ok(())
    }

    fn out_of_bounds(&self, content: &str) -> OutOfBounds {
        OutOfBounds {
            position: self.position,
            len: self.len(),
            doc_len: content.chars().count(),
        }
    }
}

/// Operation range does not fit the document it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation at {position} (len {len}) exceeds document length {doc_len}")]
pub struct OutOfBounds {
    pub position: usize,
    pub len: usize,
    pub doc_len: usize,
}

/// Byte index of the `chars`-th character, or `text.len()` when `chars`
/// equals the character count.
fn byte_offset(text: &str, chars: usize) -> Option<usize> {
    text.char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(text.len()))
        .nth(chars)
}
