//! Persistence collaborator: where sessions load from and checkpoint to.
//!
//! ```text
//! ┌─────────────────┐   load on first join   ┌──────────────────────┐
//! │ SessionRegistry │ ◄───────────────────── │ dyn Persistence      │
//! │                 │ ─────────────────────► │  MemoryStore         │
//! └─────────────────┘  checkpoint / teardown │  RocksStore (feature)│
//!                                            └──────────────────────┘
//! ```
//!
//! Only snapshots are stored. The operation log is in-memory; a client
//! that reconnects across a restart gets a snapshot.

#[cfg(feature = "rocksdb")]
pub mod rocks;

#[cfg(feature = "rocksdb")]
pub use rocks::{RocksConfig, RocksStore, SnapshotMetadata};

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::operation::DocumentId;

/// A persisted document snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub content: String,
    pub version: u64,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("stored content for {0} is not valid UTF-8")]
    Encoding(DocumentId),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Durable snapshot storage. Calls are synchronous and short; the
/// registry never holds a session lock across them.
pub trait Persistence: Send + Sync {
    /// Latest snapshot, or `None` for a document never persisted.
    fn load(&self, id: &DocumentId) -> Result<Option<StoredDocument>, PersistError>;

    /// Replace the stored snapshot. Older versions never overwrite newer ones.
    fn persist(&self, id: &DocumentId, content: &str, version: u64) -> Result<(), PersistError>;
}

/// Process-local store. Survives session teardown, not restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, e.g. in tests.
    pub fn with_document(self, id: impl Into<DocumentId>, content: impl Into<String>, version: u64) -> Self {
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(
                id.into(),
                StoredDocument {
                    content: content.into(),
                    version,
                },
            );
        }
        self
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn load(&self, id: &DocumentId) -> Result<Option<StoredDocument>, PersistError> {
        let documents = self.documents.read().map_err(|_| PersistError::Poisoned)?;
        Ok(documents.get(id).cloned())
    }

    fn persist(&self, id: &DocumentId, content: &str, version: u64) -> Result<(), PersistError> {
        let mut documents = self.documents.write().map_err(|_| PersistError::Poisoned)?;
        match documents.get_mut(id) {
            Some(stored) if stored.version > version => {
                log::debug!("skip persisting {id}@{version}, store has v{}", stored.version);
            }
            Some(stored) => {
                stored.content.clear();
                stored.content.push_str(content);
                stored.version = version;
            }
            None => {
                documents.insert(
                    id.clone(),
                    StoredDocument {
                        content: content.to_string(),
                        version,
                    },
                );
            }
        }
        Ok(())
    }
}
