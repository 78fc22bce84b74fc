//! CRDT merge capability used by the live document registry.
//!
//! The registry never looks inside an update blob. It only needs an
//! instance that can absorb updates in any order and encode its full state,
//! which is what [`MergeCapability`] and [`CrdtInstance`] describe. The
//! shipped backend is Automerge.

use automerge::AutoCommit;
use thiserror::Error;

/// Leading bytes of every Automerge storage chunk
const CHUNK_MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];

/// Errors raised by a merge backend
#[derive(Error, Debug, Clone)]
pub enum MergeError {
    #[error("Empty update")]
    Empty,

    #[error("Rejected update: {0}")]
    Rejected(String),
}

/// A single mutable CRDT replica.
///
/// `apply_update` must be commutative, associative and idempotent so that
/// relayed updates can be merged in arrival order without sequencing.
pub trait CrdtInstance: Send {
    /// Merge an opaque update (or full-state snapshot) into this replica
    fn apply_update(&mut self, update: &[u8]) -> Result<(), MergeError>;

    /// Encode everything this replica knows as one self-contained blob
    fn encode_full_state(&mut self) -> Vec<u8>;
}

/// Factory for CRDT replicas
pub trait MergeCapability: Send + Sync {
    fn new_instance(&self) -> Box<dyn CrdtInstance>;

    /// Check that a blob would merge, without any live replica
    fn validate(&self, update: &[u8]) -> Result<(), MergeError> {
        self.new_instance().apply_update(update)
    }
}

/// Automerge-backed merge capability
#[derive(Debug, Default, Clone, Copy)]
pub struct AutomergeCapability;

impl MergeCapability for AutomergeCapability {
    fn new_instance(&self) -> Box<dyn CrdtInstance> {
        Box::new(AutomergeInstance::new())
    }
}

/// Automerge replica wrapper
pub struct AutomergeInstance {
    doc: AutoCommit,
}

impl AutomergeInstance {
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }
}

impl Default for AutomergeInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtInstance for AutomergeInstance {
    fn apply_update(&mut self, update: &[u8]) -> Result<(), MergeError> {
        if update.is_empty() {
            return Err(MergeError::Empty);
        }

        // load_incremental silently loads nothing from garbage, so reject
        // anything that does not start with a chunk header.
        if !update.starts_with(&CHUNK_MAGIC) {
            return Err(MergeError::Rejected("missing chunk header".to_string()));
        }

        self.doc
            .load_incremental(update)
            .map_err(|e| MergeError::Rejected(e.to_string()))?;
        Ok(())
    }

    fn encode_full_state(&mut self) -> Vec<u8> {
        self.doc.save()
    }
}
