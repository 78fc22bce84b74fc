//! Connection and room gateway.
//!
//! The gateway owns every live connection and routes decoded client events
//! to the presence, document and board handlers:
//! - DashMap from connection id to its verified identity
//! - [`Topic`] fan-out over per-connection unbounded channels
//! - presence-driven cleanup that flushes a document when its last viewer leaves
//!
//! Each connection's events are handled one at a time by its socket task, so
//! per-sender ordering follows from the order the gateway is called in.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::board_sync::BoardSync;
use super::crdt::{AutomergeCapability, MergeCapability};
use super::doc_sync::DocumentSync;
use super::presence::{LocalPresenceStore, PresenceRegistry, PresenceStore};
use super::protocol::{ClientEvent, EventCodec, ServerEvent, UserInfo};
use super::registry::{FlushOutcome, LiveDocumentRegistry};
use super::topic::{LocalTopic, Topic};
use super::{ConnectionId, ResourceId, SyncError, SyncResult, UserId};
use crate::auth::Identity;
use crate::storage::PersistenceStore;

/// Configuration for the Gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum rooms a single connection may join
    pub max_rooms_per_connection: usize,
    /// Dirty-document checkpoint period (`None` = only flush on last leave)
    pub checkpoint_interval: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 64,
            checkpoint_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// A single authenticated connection
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub identity: Identity,
    pub connected_at: Instant,
}

/// What the socket task should do after an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Gateway statistics
#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub connections: usize,
    pub rooms: usize,
    pub live_documents: usize,
    pub uptime_seconds: u64,
}

pub struct Gateway {
    config: GatewayConfig,
    connections: DashMap<ConnectionId, ClientConnection>,
    topic: Arc<dyn Topic>,
    presence: Arc<PresenceRegistry>,
    registry: Arc<LiveDocumentRegistry>,
    documents: DocumentSync,
    boards: BoardSync,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        merge: Arc<dyn MergeCapability>,
        presence_store: Arc<dyn PresenceStore>,
        config: GatewayConfig,
    ) -> Self {
        let topic: Arc<dyn Topic> = Arc::new(LocalTopic::new());
        let registry = Arc::new(LiveDocumentRegistry::new(store.clone(), merge));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            connections: DashMap::new(),
            documents: DocumentSync::new(registry.clone(), topic.clone()),
            boards: BoardSync::new(store, topic.clone()),
            presence: Arc::new(PresenceRegistry::new(presence_store)),
            registry,
            topic,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Automerge documents, in-process presence
    pub fn with_store(store: Arc<dyn PersistenceStore>, config: GatewayConfig) -> Self {
        Self::new(
            store,
            Arc::new(AutomergeCapability),
            Arc::new(LocalPresenceStore::new()),
            config,
        )
    }

    /// Register an authenticated connection and return its outbound channel.
    ///
    /// Connecting broadcasts nothing.
    pub fn connect(&self, identity: Identity) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        self.topic.attach(&connection_id, tx);
        info!(
            "Connection {} opened for {} ({})",
            connection_id, identity.username, identity.user_id
        );
        self.connections.insert(
            connection_id.clone(),
            ClientConnection {
                identity,
                connected_at: Instant::now(),
            },
        );

        (connection_id, rx)
    }

    /// Tear down a connection, running presence cleanup for every room it was in
    pub async fn disconnect(&self, connection: &str) {
        let left = self.leave_all_rooms(connection).await;
        self.topic.detach(connection);
        if let Some((_, conn)) = self.connections.remove(connection) {
            info!(
                "Connection {} closed for {} after {}s, left {} rooms",
                connection,
                conn.identity.user_id,
                conn.connected_at.elapsed().as_secs(),
                left
            );
        }
    }

    /// Verified identity of a live connection
    pub fn identity(&self, connection: &str) -> Option<Identity> {
        self.connections.get(connection).map(|c| c.identity.clone())
    }

    fn verified(&self, connection: &str) -> SyncResult<Identity> {
        let identity = self
            .identity(connection)
            .ok_or_else(|| SyncError::Unauthenticated("unknown connection".to_string()))?;
        if identity.is_expired() {
            return Err(SyncError::Unauthenticated("credential expired".to_string()));
        }
        Ok(identity)
    }

    /// Subscribe a connection to a resource room.
    ///
    /// Membership is idempotent; the `user:joined` broadcast and the
    /// `subscribed` ack happen on every call.
    pub async fn join_room(&self, connection: &str, resource_id: &str) -> SyncResult<()> {
        let identity = self.verified(connection)?;

        if !self.topic.is_subscribed(resource_id, connection)
            && self.topic.room_count(connection) >= self.config.max_rooms_per_connection
        {
            return Err(SyncError::RoomLimit(self.config.max_rooms_per_connection));
        }

        // presence first: a flush racing this join re-checks presence
        self.presence
            .subscribe(resource_id, &identity.user_id, connection)
            .await?;
        self.topic.subscribe(resource_id, connection);

        self.broadcast(
            resource_id,
            ServerEvent::UserJoined {
                resource_id: resource_id.to_string(),
                user: UserInfo {
                    id: identity.user_id.clone(),
                    username: identity.username.clone(),
                    color: self.presence.color_for(&identity.user_id),
                },
            },
            None,
        );
        self.emit_to(
            connection,
            ServerEvent::Subscribed {
                resource_id: resource_id.to_string(),
            },
        );

        info!("{} subscribed to {}", identity.username, resource_id);
        Ok(())
    }

    /// Unsubscribe a connection from one room, flushing on the last leave
    pub async fn leave_room(&self, connection: &str, resource_id: &str) -> SyncResult<()> {
        let identity = self
            .identity(connection)
            .ok_or_else(|| SyncError::Unauthenticated("unknown connection".to_string()))?;
        self.leave_as(&identity.user_id, connection, resource_id).await
    }

    /// Leave every room of a connection, returning how many were left
    pub async fn leave_all_rooms(&self, connection: &str) -> usize {
        let Some(identity) = self.identity(connection) else {
            return 0;
        };

        let mut rooms: BTreeSet<ResourceId> = match self
            .presence
            .list_memberships(&identity.user_id)
            .await
        {
            Ok(rooms) => rooms.into_iter().collect(),
            Err(e) => {
                warn!("Presence unavailable during disconnect of {}: {}", connection, e);
                BTreeSet::new()
            }
        };

        // the user's memberships span all of their connections; keep only this one's
        rooms.retain(|room| self.topic.is_subscribed(room, connection));

        let mut left = 0;
        for room in rooms {
            match self.leave_as(&identity.user_id, connection, &room).await {
                Ok(()) => left += 1,
                Err(e) => error!(
                    "Cleanup of {} in {} failed: {}",
                    identity.user_id, room, e
                ),
            }
        }
        left
    }

    async fn leave_as(&self, user_id: &str, connection: &str, resource_id: &str) -> SyncResult<()> {
        let removal = self
            .presence
            .unsubscribe(resource_id, user_id, connection)
            .await?;
        self.topic.unsubscribe(resource_id, connection);

        if removal.user_removed() {
            self.broadcast(
                resource_id,
                ServerEvent::UserLeft {
                    resource_id: resource_id.to_string(),
                    user_id: user_id.to_string(),
                },
                None,
            );
            debug!("{} left {}", user_id, resource_id);
        }

        if removal.online() == Some(0) {
            // presence is already gone, so the flush must finish even if this
            // call is cancelled
            let flush = tokio::spawn(flush_when_idle(
                self.registry.clone(),
                self.presence.clone(),
                resource_id.to_string(),
            ));
            if let Err(e) = flush.await {
                error!("Flush task for {} failed: {}", resource_id, e);
            }
        }

        Ok(())
    }

    /// Deliver to every connection in a room except `exclude`
    pub fn broadcast(&self, resource_id: &str, event: ServerEvent, exclude: Option<&str>) -> usize {
        self.topic.publish(resource_id, event, exclude)
    }

    /// Deliver to one connection
    pub fn emit_to(&self, connection: &str, event: ServerEvent) -> bool {
        self.topic.send_to(connection, event)
    }

    /// Handle one client event
    pub async fn handle(&self, connection: &str, event: ClientEvent) -> SyncResult<()> {
        self.verified(connection)?;
        debug!("{} on {} from {}", event.name(), event.resource_id(), connection);

        match event {
            ClientEvent::Subscribe { resource_id } => {
                self.join_room(connection, &resource_id).await?;
            }
            ClientEvent::Unsubscribe { resource_id } => {
                self.leave_room(connection, &resource_id).await?;
                self.emit_to(connection, ServerEvent::Unsubscribed { resource_id });
            }
            ClientEvent::PresenceGet(resource_id) => {
                let user_ids = self.presence.list_online(&resource_id).await?;
                self.emit_to(
                    connection,
                    ServerEvent::PresenceState {
                        resource_id,
                        user_ids,
                    },
                );
            }
            ClientEvent::BoardLoad { board_id } => {
                self.boards.load(connection, &board_id).await?;
            }
            ClientEvent::Drawing { board_id, object } => {
                self.boards.drawing(connection, &board_id, object)?;
            }
            ClientEvent::ObjectModified { board_id, object } => {
                self.boards.object_modified(connection, &board_id, object)?;
            }
            ClientEvent::ObjectsRemoved {
                board_id,
                object_ids,
            } => {
                self.boards.objects_removed(connection, &board_id, object_ids);
            }
            ClientEvent::CanvasCleared { board_id } => {
                self.boards.canvas_cleared(connection, &board_id);
            }
            ClientEvent::DocLoad { document_id } => {
                self.documents.load(connection, &document_id).await?;
            }
            ClientEvent::DocUpdate {
                document_id,
                update,
            } => {
                self.documents.update(connection, &document_id, update).await?;
            }
            ClientEvent::DocAwareness {
                document_id,
                awareness_update,
            } => {
                self.documents
                    .awareness(connection, &document_id, awareness_update);
            }
        }

        Ok(())
    }

    /// Handle an event and report any error to the offending connection
    pub async fn dispatch(&self, connection: &str, event: ClientEvent) -> Flow {
        match self.handle(connection, event).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.report(connection, &e);
                if e.is_fatal() {
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Send an `error` event for a failed operation
    pub fn report(&self, connection: &str, err: &SyncError) {
        warn!("Error for {}: {}", connection, err);
        self.emit_to(
            connection,
            EventCodec::error_response(
                err.code(),
                err.to_string(),
                err.resource_id().map(str::to_string),
            ),
        );
    }

    pub async fn online_users(&self, resource_id: &str) -> SyncResult<Vec<UserId>> {
        self.presence.list_online(resource_id).await
    }

    pub fn registry(&self) -> &Arc<LiveDocumentRegistry> {
        &self.registry
    }

    pub fn boards(&self) -> &BoardSync {
        &self.boards
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.connections.len(),
            rooms: self.topic.room_total(),
            live_documents: self.registry.live_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop background tasks and flush every live document
    pub async fn shutdown(&self) -> usize {
        let _ = self.shutdown_tx.send(());
        self.registry.shutdown().await
    }

    /// Start the periodic checkpoint task, if configured
    pub fn start_background_tasks(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let period = self.config.checkpoint_interval?;
        let gateway = self.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut shutdown = gateway.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = gateway.registry.checkpoint_dirty().await;
                        if saved > 0 {
                            debug!("Checkpointed {} documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Checkpoint task shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

/// Flush a document whose presence dropped to zero, unless someone rejoined
async fn flush_when_idle(
    registry: Arc<LiveDocumentRegistry>,
    presence: Arc<PresenceRegistry>,
    resource_id: ResourceId,
) {
    let idle_id = resource_id.clone();
    let still_idle = || async move {
        matches!(presence.online_count(&idle_id).await, Ok(0))
    };
    match registry.flush_if(&resource_id, still_idle).await {
        Ok(FlushOutcome::Flushed) => info!("Last viewer left {}, flushed", resource_id),
        Ok(FlushOutcome::StillInUse) => debug!("{} rejoined before flush", resource_id),
        Ok(FlushOutcome::NotLoaded) => {}
        // logged by the registry; entry retained for a later flush
        Err(e) => warn!("Flush of {} deferred: {}", resource_id, e),
    }
}
