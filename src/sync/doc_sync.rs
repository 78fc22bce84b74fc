//! Document sync handlers: `doc:load`, `doc:update`, `doc:awareness`.

use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::ServerEvent;
use super::registry::LiveDocumentRegistry;
use super::topic::Topic;
use super::{SyncError, SyncResult};

pub struct DocumentSync {
    registry: Arc<LiveDocumentRegistry>,
    topic: Arc<dyn Topic>,
}

impl DocumentSync {
    pub fn new(registry: Arc<LiveDocumentRegistry>, topic: Arc<dyn Topic>) -> Self {
        Self { registry, topic }
    }

    /// Send the full live state to the requester
    pub async fn load(&self, connection: &str, document_id: &str) -> SyncResult<()> {
        if !self.topic.is_subscribed(document_id, connection) {
            return Err(SyncError::NotSubscribed(document_id.to_string()));
        }

        let state = self.registry.acquire(document_id).await?;
        self.topic.send_to(
            connection,
            ServerEvent::DocState {
                document_id: document_id.to_string(),
                state,
            },
        );
        Ok(())
    }

    /// Merge an update and relay it verbatim to the rest of the room.
    ///
    /// Malformed updates are reported to the caller and not relayed. An
    /// update for a document with no live entry is checked against a scratch
    /// replica and relayed without merging.
    pub async fn update(
        &self,
        connection: &str,
        document_id: &str,
        update: Vec<u8>,
    ) -> SyncResult<usize> {
        match self
            .registry
            .apply_remote_update(document_id, &update, connection)
            .await
        {
            Ok(()) => {}
            Err(SyncError::NotLoaded(_)) => {
                if let Err(e) = self.registry.validate_update(document_id, &update) {
                    warn!("Dropping update from {}: {}", connection, e);
                    return Err(e);
                }
                warn!(
                    "Update from {} for unloaded document {}; relaying without merge",
                    connection, document_id
                );
            }
            Err(e) => {
                warn!("Dropping update from {}: {}", connection, e);
                return Err(e);
            }
        }

        let delivered = self.topic.publish(
            document_id,
            ServerEvent::DocUpdate {
                document_id: document_id.to_string(),
                update,
            },
            Some(connection),
        );
        Ok(delivered)
    }

    /// Relay an awareness blob; never stored
    pub fn awareness(&self, connection: &str, document_id: &str, awareness_update: Vec<u8>) -> usize {
        debug!(
            "Awareness from {} on {} ({} bytes)",
            connection,
            document_id,
            awareness_update.len()
        );
        self.topic.publish(
            document_id,
            ServerEvent::DocAwareness {
                document_id: document_id.to_string(),
                awareness_update,
            },
            Some(connection),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PersistenceStore};
    use crate::sync::crdt::AutomergeCapability;
    use crate::sync::topic::LocalTopic;
    use automerge::{transaction::Transactable, AutoCommit, ROOT};
    use tokio::sync::mpsc;

    struct Fixture {
        sync: DocumentSync,
        registry: Arc<LiveDocumentRegistry>,
        a: mpsc::UnboundedReceiver<ServerEvent>,
        b: mpsc::UnboundedReceiver<ServerEvent>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.create_document("doc-1", &[]).await.unwrap();
        let registry = Arc::new(LiveDocumentRegistry::new(store, Arc::new(AutomergeCapability)));
        let topic = Arc::new(LocalTopic::new());

        let (tx_a, a) = mpsc::unbounded_channel();
        let (tx_b, b) = mpsc::unbounded_channel();
        topic.attach("a", tx_a);
        topic.attach("b", tx_b);
        topic.subscribe("doc-1", "a");
        topic.subscribe("doc-1", "b");

        Fixture {
            sync: DocumentSync::new(registry.clone(), topic),
            registry,
            a,
            b,
        }
    }

    fn edit() -> Vec<u8> {
        let mut doc = AutoCommit::new();
        doc.put(ROOT, "title", "Notes").unwrap();
        doc.save()
    }

    #[tokio::test]
    async fn test_load_sends_state_to_requester_only() {
        let mut f = fixture().await;

        f.sync.load("a", "doc-1").await.unwrap();

        assert!(matches!(f.a.try_recv().unwrap(), ServerEvent::DocState { .. }));
        assert!(f.b.try_recv().is_err());
        assert!(f.registry.is_loaded("doc-1"));
    }

    #[tokio::test]
    async fn test_load_requires_subscription() {
        let f = fixture().await;
        let result = f.sync.load("stranger", "doc-1").await;
        assert!(matches!(result, Err(SyncError::NotSubscribed(_))));
        assert!(!f.registry.is_loaded("doc-1"));
    }

    #[tokio::test]
    async fn test_update_relayed_verbatim_without_echo() {
        let mut f = fixture().await;
        f.sync.load("a", "doc-1").await.unwrap();
        f.a.try_recv().unwrap();

        let update = edit();
        assert_eq!(f.sync.update("a", "doc-1", update.clone()).await.unwrap(), 1);

        assert_eq!(
            f.b.try_recv().unwrap(),
            ServerEvent::DocUpdate {
                document_id: "doc-1".to_string(),
                update,
            }
        );
        assert!(f.a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_update_not_relayed() {
        let mut f = fixture().await;
        f.sync.load("a", "doc-1").await.unwrap();

        let result = f.sync.update("a", "doc-1", vec![1, 2, 3]).await;
        assert!(matches!(result, Err(SyncError::MalformedUpdate { .. })));
        assert!(f.b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_for_unloaded_document_still_relayed() {
        let mut f = fixture().await;

        assert_eq!(f.sync.update("a", "doc-1", edit()).await.unwrap(), 1);
        assert!(matches!(f.b.try_recv().unwrap(), ServerEvent::DocUpdate { .. }));
        assert!(!f.registry.is_loaded("doc-1"));
    }

    #[tokio::test]
    async fn test_malformed_update_for_unloaded_document_not_relayed() {
        let mut f = fixture().await;

        let result = f.sync.update("a", "doc-1", vec![0xde, 0xad]).await;
        assert!(matches!(
            result,
            Err(SyncError::MalformedUpdate { ref resource_id, .. }) if resource_id == "doc-1"
        ));
        assert!(f.b.try_recv().is_err());
        assert!(!f.registry.is_loaded("doc-1"));
    }

    #[tokio::test]
    async fn test_awareness_relayed_not_stored() {
        let mut f = fixture().await;

        assert_eq!(f.sync.awareness("b", "doc-1", vec![7, 7]), 1);
        assert_eq!(
            f.a.try_recv().unwrap(),
            ServerEvent::DocAwareness {
                document_id: "doc-1".to_string(),
                awareness_update: vec![7, 7],
            }
        );
        assert!(!f.registry.is_loaded("doc-1"));
    }
}
