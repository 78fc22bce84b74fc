//! Storage module for durable document and board snapshots.
//!
//! The sync core only talks to [`PersistenceStore`]. Documents are stored as
//! opaque CRDT bytes; boards as their last explicitly saved JSON content.
//! Two backends ship: a Sled embedded database and an in-memory map.

mod memory;
mod sled_store;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource not found: {0}")]
    NotFound(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable home of documents and boards
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Last persisted CRDT state, `None` if the document is unknown
    async fn load_document(&self, document_id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the persisted CRDT state
    async fn save_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()>;

    /// Register a new document with its initial state
    async fn create_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()>;

    /// Last saved board content, `None` if the board is unknown
    async fn load_board(&self, board_id: &str) -> StorageResult<Option<Value>>;

    /// Replace the content of an existing board; `NotFound` if it was never created
    async fn save_board(&self, board_id: &str, content: &Value) -> StorageResult<()>;

    /// Register a new board with its initial content
    async fn create_board(&self, board_id: &str, content: &Value) -> StorageResult<()>;
}

/// Which persistence backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            other => Err(format!("Unknown storage backend: {}", other)),
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend to open
    pub backend: StorageBackend,
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: "./data/codraw.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

/// Open the configured backend
pub fn open(config: &StorageConfig) -> StorageResult<Arc<dyn PersistenceStore>> {
    match config.backend {
        StorageBackend::Sled => Ok(Arc::new(SledStore::open(config.clone())?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
