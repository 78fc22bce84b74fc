//! Whiteboard relay.
//!
//! The server keeps no canonical copy of a board's objects. Shape events are
//! forwarded to the rest of the room and clients apply them last-writer-wins
//! by object id. Only `board:load` touches persistence.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::protocol::{BoardObject, ServerEvent};
use super::topic::Topic;
use super::{SyncError, SyncResult};
use crate::storage::{PersistenceStore, StorageError};

pub struct BoardSync {
    store: Arc<dyn PersistenceStore>,
    topic: Arc<dyn Topic>,
}

impl BoardSync {
    pub fn new(store: Arc<dyn PersistenceStore>, topic: Arc<dyn Topic>) -> Self {
        Self { store, topic }
    }

    /// Send the last saved board content to the requester
    pub async fn load(&self, connection: &str, board_id: &str) -> SyncResult<()> {
        let content = self
            .store
            .load_board(board_id)
            .await
            .map_err(|e| SyncError::persistence(board_id, e))?
            .ok_or_else(|| SyncError::ResourceNotFound(board_id.to_string()))?;

        self.topic.send_to(
            connection,
            ServerEvent::BoardState {
                board_id: board_id.to_string(),
                content,
            },
        );
        Ok(())
    }

    pub fn drawing(&self, connection: &str, board_id: &str, object: BoardObject) -> SyncResult<usize> {
        require_id(&object)?;
        Ok(self.relay(
            connection,
            board_id,
            ServerEvent::Drawing {
                board_id: board_id.to_string(),
                object,
            },
        ))
    }

    pub fn object_modified(
        &self,
        connection: &str,
        board_id: &str,
        object: BoardObject,
    ) -> SyncResult<usize> {
        require_id(&object)?;
        Ok(self.relay(
            connection,
            board_id,
            ServerEvent::ObjectModified {
                board_id: board_id.to_string(),
                object,
            },
        ))
    }

    pub fn objects_removed(&self, connection: &str, board_id: &str, object_ids: Vec<String>) -> usize {
        self.relay(
            connection,
            board_id,
            ServerEvent::ObjectsRemoved {
                board_id: board_id.to_string(),
                object_ids,
            },
        )
    }

    /// Broadcast to the whole room, the sender included
    pub fn canvas_cleared(&self, connection: &str, board_id: &str) -> usize {
        debug!("Canvas {} cleared by {}", board_id, connection);
        self.topic.publish(
            board_id,
            ServerEvent::CanvasCleared {
                board_id: board_id.to_string(),
            },
            None,
        )
    }

    /// Persist board content supplied by the save endpoint
    pub async fn save(&self, board_id: &str, content: &Value) -> SyncResult<()> {
        self.store
            .save_board(board_id, content)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => SyncError::ResourceNotFound(board_id.to_string()),
                other => SyncError::persistence(board_id, other),
            })
    }

    fn relay(&self, connection: &str, board_id: &str, event: ServerEvent) -> usize {
        self.topic.publish(board_id, event, Some(connection))
    }
}

fn require_id(object: &BoardObject) -> SyncResult<()> {
    match object.id() {
        Some(_) => Ok(()),
        None => Err(SyncError::InvalidMessage(
            "board object is missing a non-empty id".to_string(),
        )),
    }
}
