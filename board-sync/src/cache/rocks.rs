//! RocksDB-backed document cache.
//!
//! Column families:
//! - `documents`: full snapshots, LZ4 compressed, keyed `yjs-doc-{id}`
//! - `metadata`: per-document [`CacheMetadata`] (bincode)
//!
//! Each save writes both families in one batch, so a crash never leaves
//! a snapshot without its metadata.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{cache_key, CacheError, DocumentCache, KEY_PREFIX};
use crate::protocol::wire_config;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every save (default: false, flushed on close)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("board_cache"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Small caches for tests; point `path` at a temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 32,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub document_id: String,
    /// Number of saves so far
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl CacheMetadata {
    fn new(document_id: &str) -> Self {
        let now = unix_now();
        Self {
            document_id: document_id.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable snapshot cache.
pub struct RocksCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl RocksCache {
    /// Open (or create) the cache at `config.path`.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document cache at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("Column family '{name}' not found")))
    }

    pub fn metadata(&self, document_id: &str) -> Result<Option<CacheMetadata>, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, cache_key(document_id))? {
            Some(bytes) => Ok(Some(CacheMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every cached document.
    pub fn list_documents(&self) -> Result<Vec<String>, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(id) = key.strip_prefix(KEY_PREFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Forget a document. Missing documents are not an error.
    pub fn remove(&self, document_id: &str) -> Result<(), CacheError> {
        let key = cache_key(document_id);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, &key);
        batch.delete_cf(self.cf(CF_METADATA)?, &key);
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), CacheError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl DocumentCache for RocksCache {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(cf, cache_key(document_id))? else {
            return Ok(None);
        };
        let corrupt = |reason: String| CacheError::Corrupt {
            document_id: document_id.to_string(),
            reason,
        };

        // The lz4 size prefix must agree with the recorded snapshot size
        let prefix: [u8; 4] = compressed
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| corrupt("missing size prefix".into()))?;
        let claimed = u32::from_le_bytes(prefix) as u64;
        let expected = self
            .metadata(document_id)?
            .ok_or_else(|| corrupt("snapshot has no metadata".into()))?
            .snapshot_size;
        if claimed != expected {
            return Err(corrupt(format!(
                "size prefix {claimed} does not match recorded size {expected}"
            )));
        }

        lz4_flex::decompress_size_prepended(&compressed)
            .map(Some)
            .map_err(|e| corrupt(e.to_string()))
    }

    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), CacheError> {
        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| CacheMetadata::new(document_id));
        meta.version += 1;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = cache_key(document_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, &key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::trace!(
            "Cached {document_id} v{} ({} -> {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

impl Drop for RocksCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("Failed to flush document cache on close: {e}");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
