//! Registry of live CRDT documents.
//!
//! A document becomes live the first time a subscriber loads it and stays
//! cached while anyone is present. When presence drops to zero the gateway
//! asks the registry to flush: encode, write once, evict. Load and flush of
//! one document serialize on that document's lifecycle lock, so a flush
//! cannot interleave with a load or re-subscribe of the same document while
//! other documents proceed. Merges only take the entry lock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::crdt::{CrdtInstance, MergeCapability};
use super::{ResourceId, SyncError, SyncResult};
use crate::storage::PersistenceStore;

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// State written and entry evicted
    Flushed,
    /// The document gained a viewer again; entry kept
    StillInUse,
    /// No live entry existed
    NotLoaded,
}

struct LiveState {
    crdt: Box<dyn CrdtInstance>,
    /// Changed since the last successful write
    dirty: bool,
    /// Set once the entry has been flushed and removed
    evicted: bool,
}

struct LiveDocument {
    state: Mutex<LiveState>,
}

type LifecycleLock = Arc<Mutex<()>>;

pub struct LiveDocumentRegistry {
    store: Arc<dyn PersistenceStore>,
    merge: Arc<dyn MergeCapability>,
    entries: DashMap<ResourceId, Arc<LiveDocument>>,
    /// Per-document load/flush serialization
    lifecycle: DashMap<ResourceId, LifecycleLock>,
}

impl LiveDocumentRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>, merge: Arc<dyn MergeCapability>) -> Self {
        Self {
            store,
            merge,
            entries: DashMap::new(),
            lifecycle: DashMap::new(),
        }
    }

    /// Return the full state of a document, loading it into the cache first if needed
    pub async fn acquire(&self, document_id: &str) -> SyncResult<Vec<u8>> {
        let lock = self.lifecycle_lock(document_id);
        let result = {
            let _lifecycle = lock.lock().await;
            self.acquire_locked(document_id).await
        };
        self.release_lifecycle(document_id, lock);
        result
    }

    async fn acquire_locked(&self, document_id: &str) -> SyncResult<Vec<u8>> {
        if let Some(entry) = self.entry(document_id) {
            let mut state = entry.state.lock().await;
            return Ok(state.crdt.encode_full_state());
        }

        let persisted = self
            .store
            .load_document(document_id)
            .await
            .map_err(|e| SyncError::persistence(document_id, e))?
            .ok_or_else(|| SyncError::ResourceNotFound(document_id.to_string()))?;

        let mut crdt = self.merge.new_instance();
        if !persisted.is_empty() {
            crdt.apply_update(&persisted)
                .map_err(|e| SyncError::PersistenceFailure {
                    resource_id: document_id.to_string(),
                    reason: format!("persisted state unreadable: {}", e),
                })?;
        }
        let snapshot = crdt.encode_full_state();

        self.entries.insert(
            document_id.to_string(),
            Arc::new(LiveDocument {
                state: Mutex::new(LiveState {
                    crdt,
                    dirty: false,
                    evicted: false,
                }),
            }),
        );
        info!("Loaded document {} ({} bytes)", document_id, persisted.len());

        Ok(snapshot)
    }

    /// Merge a client update into the live replica
    pub async fn apply_remote_update(
        &self,
        document_id: &str,
        update: &[u8],
        origin: &str,
    ) -> SyncResult<()> {
        let entry = self
            .entry(document_id)
            .ok_or_else(|| SyncError::NotLoaded(document_id.to_string()))?;

        let mut state = entry.state.lock().await;
        if state.evicted {
            return Err(SyncError::NotLoaded(document_id.to_string()));
        }

        state
            .crdt
            .apply_update(update)
            .map_err(|e| malformed(document_id, e))?;
        state.dirty = true;
        debug!(
            "Merged {} byte update into {} from {}",
            update.len(),
            document_id,
            origin
        );
        Ok(())
    }

    /// Check an update against a scratch replica, for documents with no live entry
    pub fn validate_update(&self, document_id: &str, update: &[u8]) -> SyncResult<()> {
        self.merge
            .validate(update)
            .map_err(|e| malformed(document_id, e))
    }

    /// Flush and evict unconditionally
    pub async fn flush(&self, document_id: &str) -> SyncResult<FlushOutcome> {
        self.flush_if(document_id, || async { true }).await
    }

    /// Flush and evict if `still_idle` holds once the lifecycle lock is taken.
    ///
    /// On a write failure the entry stays cached and the error is returned.
    pub async fn flush_if<F, Fut>(&self, document_id: &str, still_idle: F) -> SyncResult<FlushOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let lock = self.lifecycle_lock(document_id);
        let result = {
            let _lifecycle = lock.lock().await;
            self.flush_locked(document_id, still_idle).await
        };
        self.release_lifecycle(document_id, lock);
        result
    }

    async fn flush_locked<F, Fut>(&self, document_id: &str, still_idle: F) -> SyncResult<FlushOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let Some(entry) = self.entry(document_id) else {
            debug!("Flush of {} skipped: not loaded", document_id);
            return Ok(FlushOutcome::NotLoaded);
        };

        if !still_idle().await {
            debug!("Flush of {} skipped: document in use again", document_id);
            return Ok(FlushOutcome::StillInUse);
        }

        let mut state = entry.state.lock().await;
        self.write_state(document_id, &mut state).await?;

        state.evicted = true;
        drop(state);
        self.entries.remove(document_id);
        info!("Flushed and evicted document {}", document_id);

        Ok(FlushOutcome::Flushed)
    }

    /// Persist a live document without evicting it.
    ///
    /// Returns `false` when the document is not live.
    pub async fn checkpoint(&self, document_id: &str) -> SyncResult<bool> {
        let Some(entry) = self.entry(document_id) else {
            return Ok(false);
        };

        let mut state = entry.state.lock().await;
        if state.evicted {
            return Ok(false);
        }
        self.write_state(document_id, &mut state).await?;
        Ok(true)
    }

    /// Persist every live document changed since its last write
    pub async fn checkpoint_dirty(&self) -> usize {
        let mut saved = 0;

        for (document_id, entry) in self.snapshot_entries() {
            let mut state = entry.state.lock().await;
            if state.evicted || !state.dirty {
                continue;
            }
            match self.write_state(&document_id, &mut state).await {
                Ok(()) => saved += 1,
                Err(e) => warn!("Checkpoint failed: {}", e),
            }
        }

        saved
    }

    /// Flush every live document, returning how many were written
    pub async fn shutdown(&self) -> usize {
        let mut flushed = 0;

        for (document_id, _) in self.snapshot_entries() {
            match self.flush(&document_id).await {
                Ok(FlushOutcome::Flushed) => flushed += 1,
                Ok(_) => {}
                Err(e) => warn!("Shutdown flush failed: {}", e),
            }
        }

        info!("Registry shut down, {} documents flushed", flushed);
        flushed
    }

    #[cfg(test)]
    pub fn is_loaded(&self, document_id: &str) -> bool {
        self.entries.contains_key(document_id)
    }

    /// Number of live documents
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, document_id: &str) -> Option<Arc<LiveDocument>> {
        self.entries.get(document_id).map(|e| e.value().clone())
    }

    fn snapshot_entries(&self) -> Vec<(ResourceId, Arc<LiveDocument>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn lifecycle_lock(&self, document_id: &str) -> LifecycleLock {
        self.lifecycle
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget a document's lock once nobody else holds or awaits it
    fn release_lifecycle(&self, document_id: &str, lock: LifecycleLock) {
        drop(lock);
        self.lifecycle
            .remove_if(document_id, |_, held| Arc::strong_count(held) == 1);
    }

    async fn write_state(&self, document_id: &str, state: &mut LiveState) -> SyncResult<()> {
        let bytes = state.crdt.encode_full_state();
        if let Err(e) = self.store.save_document(document_id, &bytes).await {
            error!("Failed to save document {}: {}", document_id, e);
            return Err(SyncError::persistence(document_id, e));
        }
        state.dirty = false;
        debug!("Saved document {} ({} bytes)", document_id, bytes.len());
        Ok(())
    }
}

fn malformed(document_id: &str, err: impl std::fmt::Display) -> SyncError {
    SyncError::MalformedUpdate {
        resource_id: document_id.to_string(),
        reason: err.to_string(),
    }
}
