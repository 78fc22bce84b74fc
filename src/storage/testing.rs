//! Store wrappers for exercising persistence paths in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{MemoryStore, PersistenceStore, StorageError, StorageResult};

/// Memory store that records every document save and can be told to fail
/// or hold them
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    saves: AtomicUsize,
    saved: Mutex<Vec<(String, Vec<u8>)>>,
    fail_saves: AtomicBool,
    held: Mutex<HashMap<String, Arc<Notify>>>,
    waiting: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Bytes of the most recent successful save of `document_id`
    pub fn last_saved(&self, document_id: &str) -> Option<Vec<u8>> {
        self.saved
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == document_id)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make saves of `document_id` wait until [`CountingStore::release`]
    pub fn hold_saves(&self, document_id: &str) {
        self.held
            .lock()
            .insert(document_id.to_string(), Arc::new(Notify::new()));
    }

    /// Let held saves of `document_id` through
    pub fn release(&self, document_id: &str) {
        if let Some(gate) = self.held.lock().remove(document_id) {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    /// Saves currently parked behind a hold
    pub fn waiting_saves(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceStore for CountingStore {
    async fn load_document(&self, document_id: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.load_document(document_id).await
    }

    async fn save_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        let gate = self.held.lock().get(document_id).cloned();
        if let Some(gate) = gate {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.saved
            .lock()
            .push((document_id.to_string(), state.to_vec()));
        self.inner.save_document(document_id, state).await
    }

    async fn create_document(&self, document_id: &str, state: &[u8]) -> StorageResult<()> {
        self.inner.create_document(document_id, state).await
    }

    async fn load_board(&self, board_id: &str) -> StorageResult<Option<Value>> {
        self.inner.load_board(board_id).await
    }

    async fn save_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        self.inner.save_board(board_id, content).await
    }

    async fn create_board(&self, board_id: &str, content: &Value) -> StorageResult<()> {
        self.inner.create_board(board_id, content).await
    }
}
