//! Sled-based persistence for documents and boards.
//!
//! Document states are stored as raw CRDT bytes in the `documents` tree,
//! board content as JSON in the `boards` tree. Creation uses
//! compare-and-swap so that two concurrent creates cannot clobber each other.

use async_trait::async_trait;
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{PersistenceStore, StorageConfig, StorageError, StorageResult};

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_BOARDS: &str = "boards";

/// Sled-based store
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    documents: Tree,
    boards: Tree,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let boards = db.open_tree(TREE_BOARDS)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            boards,
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn insert_new(tree: &Tree, id: &str, value: Vec<u8>) -> StorageResult<()> {
        tree.compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(value))?
            .map_err(|_| StorageError::AlreadyExists(id.to_string()))
    }
}

#[async_trait]
impl PersistenceStore for SledStore {
    async fn load_document(&self, document_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .documents
            .get(document_id.as_bytes())?
            .map(|data| data.to_vec()))
    }

    async fn save_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        self.documents.insert(document_id.as_bytes(), state)?;
        Ok(())
    }

    async fn create_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        Self::insert_new(&self.documents, document_id, state.to_vec())
    }

    async fn load_board(&self, board_id: &str) -> StorageResult<Option<Value>> {
        match self.boards.get(board_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        let bytes = serde_json::to_vec(content)?;
        // only replaces an existing key, in one atomic step
        let previous = self
            .boards
            .fetch_and_update(board_id.as_bytes(), |old| old.map(|_| bytes.clone()))?;
        match previous {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(board_id.to_string())),
        }
    }

    async fn create_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        Self::insert_new(&self.boards, board_id, serde_json::to_vec(content)?)
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
