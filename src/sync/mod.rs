//! Synchronization module for real-time document and whiteboard collaboration.
//!
//! This module implements the core synchronization logic:
//! - JSON event protocol over WebSocket
//! - Room fan-out through the [`topic::Topic`] abstraction
//! - Presence tracking keyed by user, not by connection
//! - Live CRDT documents with flush-on-last-leave
//! - Whiteboard object relay with last-writer-wins semantics

pub mod board_sync;
pub mod crdt;
pub mod doc_sync;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod topic;

pub use server::{Gateway, GatewayConfig};

use crate::storage::StorageError;
use protocol::ErrorCode;

/// Identifier of a document or board
pub type ResourceId = String;

/// Identifier of an authenticated user
pub type UserId = String;

/// Identifier of a single live connection
pub type ConnectionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Connection has no verified identity
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Document or board id is unknown to persistence
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// Merge capability rejected an update blob
    #[error("Malformed update for {resource_id}: {reason}")]
    MalformedUpdate {
        resource_id: ResourceId,
        reason: String,
    },

    /// Flush or checkpoint could not be written
    #[error("Persistence failure for {resource_id}: {reason}")]
    PersistenceFailure {
        resource_id: ResourceId,
        reason: String,
    },

    /// Update targeted a document with no live entry
    #[error("Document not loaded: {0}")]
    NotLoaded(ResourceId),

    /// Connection is not a member of the resource's room
    #[error("Not subscribed to {0}")]
    NotSubscribed(ResourceId),

    /// Frame or payload did not satisfy the protocol
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Connection joined more rooms than allowed
    #[error("Room limit reached ({0})")]
    RoomLimit(usize),

    /// Presence store operation failed
    #[error("Presence store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Wire error code reported to the offending client
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Unauthenticated(_) => ErrorCode::Unauthorized,
            SyncError::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            SyncError::MalformedUpdate { .. } => ErrorCode::MalformedUpdate,
            SyncError::PersistenceFailure { .. } | SyncError::Store(_) => ErrorCode::ServerError,
            SyncError::NotLoaded(_) => ErrorCode::NotLoaded,
            SyncError::NotSubscribed(_) => ErrorCode::NotSubscribed,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::RoomLimit(_) => ErrorCode::RoomLimit,
        }
    }

    /// Resource the error refers to, if any
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            SyncError::ResourceNotFound(id)
            | SyncError::NotLoaded(id)
            | SyncError::NotSubscribed(id) => Some(id),
            SyncError::MalformedUpdate { resource_id, .. }
            | SyncError::PersistenceFailure { resource_id, .. } => Some(resource_id),
            _ => None,
        }
    }

    /// Whether the connection must be dropped after reporting this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Unauthenticated(_))
    }

    pub(crate) fn persistence(resource_id: &str, err: StorageError) -> Self {
        SyncError::PersistenceFailure {
            resource_id: resource_id.to_string(),
            reason: err.to_string(),
        }
    }
}
