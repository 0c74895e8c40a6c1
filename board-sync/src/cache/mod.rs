//! Client-side durable cache of full document snapshots.
//!
//! ```text
//! session start ──► load(id) ──► apply to document ──► provider subscribes
//!                                                          │
//!          save(id, full_state) ◄── flush tick, if dirty ◄─┘
//! ```
//!
//! Saves are best effort: a failing cache is logged and the session keeps
//! running in memory.

pub mod rocks;

pub use rocks::{CacheConfig, CacheMetadata, RocksCache};

use std::collections::HashMap;
use std::sync::RwLock;

/// Cache key prefix, one entry per document.
pub const KEY_PREFIX: &str = "yjs-doc-";

/// Storage key for a document id.
pub fn cache_key(document_id: &str) -> String {
    format!("{KEY_PREFIX}{document_id}")
}

/// Persists one opaque snapshot per document id.
pub trait DocumentCache: Send + Sync + 'static {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), CacheError>;
}

/// Cache errors. The provider logs them and carries on in memory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt cache entry for {document_id}: {reason}")]
    Corrupt { document_id: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cache lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// In-process cache. Survives provider restarts within one process only.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentCache for MemoryCache {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(&cache_key(document_id)).cloned())
    }

    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.insert(cache_key(document_id), state.to_vec());
        Ok(())
    }
}

impl<C: DocumentCache> DocumentCache for std::sync::Arc<C> {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).load(document_id)
    }

    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), CacheError> {
        (**self).save(document_id, state)
    }
}
