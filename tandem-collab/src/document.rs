//! Canonical text and version counter for one document.
//!
//! The store only accepts an operation authored against its exact current
//! version. Older operations are rebased by `transform` first.

use thiserror::Error;

use crate::operation::{Operation, OutOfBounds};

/// Reasons the store refuses an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Caller forgot to transform the operation first.
    #[error("stale base version {base}, document is at {current}")]
    StaleVersion { current: u64, base: u64 },
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBounds),
}

/// Text plus the number of operations ever applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    content: String,
    version: u64,
}

impl DocumentState {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }

    pub fn empty() -> Self {
        Self::new(String::new(), 0)
    }

    /// Apply `op` and bump the version by exactly one.
    ///
    /// Returns the new version and the operation as applied. A failed
    /// apply leaves both content and version unchanged.
    pub fn apply(&mut self, op: Operation) -> Result<(u64, Operation), StoreError> {
        if op.base_version != self.version {
            return Err(StoreError::StaleVersion {
                current: self.version,
                base: op.base_version,
            });
        }
        op.apply_to(&mut self.content)?;
        self.version += 1;
        Ok((self.version, op))
    }

    /// Owned copy of `(content, version)`.
    pub fn snapshot(&self) -> (String, u64) {
        (self.content.clone(), self.version)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_bumps_version() {
        let mut doc = DocumentState::empty();
        let (v1, _) = doc.apply(Operation::insert(0, "abc", 0)).unwrap();
        let (v2, _) = doc.apply(Operation::delete(0, 1, 1)).unwrap();

        assert_eq!((v1, v2), (1, 2));
        assert_eq!(doc.snapshot(), ("bc".to_string(), 2));
    }

    #[test]
    fn test_stale_version_rejected() {
        let mut doc = DocumentState::new("abc", 3);
        let err = doc.apply(Operation::insert(0, "x", 2)).unwrap_err();

        assert_eq!(err, StoreError::StaleVersion { current: 3, base: 2 });
        assert_eq!(doc.version(), 3);
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_out_of_bounds_does_not_bump() {
        let mut doc = DocumentState::new("abc", 0);
        let err = doc.apply(Operation::delete(1, 5, 0)).unwrap_err();

        assert!(matches!(err, StoreError::OutOfBounds(_)));
        assert_eq!(doc.version(), 0);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let ops = [
            Operation::insert(0, "hello", 0),
            Operation::insert(5, " world", 1),
            Operation::delete(0, 1, 2),
            Operation::insert(0, "J", 3),
        ];

        let mut a = DocumentState::empty();
        let mut b = DocumentState::empty();
        for op in ops.iter().cloned() {
            a.apply(op.clone()).unwrap();
            b.apply(op).unwrap();
        }

        assert_eq!(a, b);
        assert_eq!(a.content(), "Jello world");
        assert_eq!(a.char_len(), 11);
    }
}
