//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: document text (LZ4 compressed, keyed by document id)
//! - `metadata`: version and sizes (bincode, keyed by document id)
//!
//! Both are written in one batch so a reader never sees text from one
//! checkpoint with the version of another.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{PersistError, Persistence, StoredDocument};
use crate::operation::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every checkpoint (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::new(path)
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u64,
    /// Uncompressed text size in bytes
    pub content_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, PersistError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for PersistError {
    fn from(e: rocksdb::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DB,
    config: RocksConfig,
}

impl RocksStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: RocksConfig) -> Result<Self, PersistError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 compressed
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn metadata(&self, id: &DocumentId) -> Result<Option<SnapshotMetadata>, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| PersistError::Serialization(e.to_string()))?;
            ids.push(DocumentId::new(id));
        }
        Ok(ids)
    }

    pub fn delete(&self, id: &DocumentId) -> Result<(), PersistError> {
        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistError::Database(format!("column family '{name}' not found")))
    }
}

impl Persistence for RocksStore {
    fn load(&self, id: &DocumentId) -> Result<Option<StoredDocument>, PersistError> {
        let Some(meta) = self.metadata(id)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(cf, id.as_str().as_bytes())? else {
            log::warn!("metadata without content for {id}, treating as new");
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| PersistError::Compression(e.to_string()))?;
        let content = String::from_utf8(bytes).map_err(|_| PersistError::Encoding(id.clone()))?;
        Ok(Some(StoredDocument {
            content,
            version: meta.version,
        }))
    }

    fn persist(&self, id: &DocumentId, content: &str, version: u64) -> Result<(), PersistError> {
        if let Some(existing) = self.metadata(id)? {
            if existing.version > version {
                log::debug!("skip persisting {id}@{version}, store has v{}", existing.version);
                return Ok(());
            }
        }

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        let meta = SnapshotMetadata {
            version,
            content_size: content.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}
