//! In-memory persistence, used for ephemeral deployments and tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::{PersistenceStore, StorageError, StorageResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<String, Vec<u8>>,
    boards: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load_document(&self, document_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.documents.get(document_id).map(|d| d.clone()))
    }

    async fn save_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        self.documents.insert(document_id.to_string(), state.to_vec());
        Ok(())
    }

    async fn create_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        match self.documents.entry(document_id.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(document_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(state.to_vec());
                Ok(())
            }
        }
    }

    async fn load_board(&self, board_id: &str) -> StorageResult<Option<Value>> {
        Ok(self.boards.get(board_id).map(|b| b.clone()))
    }

    async fn save_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        match self.boards.get_mut(board_id) {
            Some(mut board) => {
                *board = content.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(board_id.to_string())),
        }
    }

    async fn create_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        match self.boards.entry(board_id.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(board_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(content.clone());
                Ok(())
            }
        }
    }
}
