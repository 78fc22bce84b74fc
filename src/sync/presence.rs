//! Presence tracking for documents and boards.
//!
//! Presence is keyed by user: a user is online on a resource while at least
//! one of their connections is subscribed to it. Each store call mutates the
//! online set and the per-user membership index together, and every removal
//! reports the remaining online count from the same critical section so the
//! caller can branch on "last one out" without racing a concurrent join.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ConnectionId, ResourceId, SyncError, SyncResult, UserId};

/// Upper bound on a single presence store call
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of removing one connection from a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The connection was not subscribed
    NotMember,
    /// The user still has other connections on the resource
    ConnectionRemoved { online: usize },
    /// The user's last connection left
    UserRemoved { online: usize },
}

impl Removal {
    /// Remaining online users, `None` when nothing changed
    pub fn online(&self) -> Option<usize> {
        match self {
            Removal::NotMember => None,
            Removal::ConnectionRemoved { online } | Removal::UserRemoved { online } => {
                Some(*online)
            }
        }
    }

    pub fn user_removed(&self) -> bool {
        matches!(self, Removal::UserRemoved { .. })
    }
}

/// Shared presence store. Every method is a single atomic operation.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add a connection of `user` to `resource`, returning the online user count
    async fn add_member(&self, resource: &str, user: &str, connection: &str)
        -> SyncResult<usize>;

    /// Remove a connection of `user` from `resource` and read the remaining count
    async fn remove_member(
        &self,
        resource: &str,
        user: &str,
        connection: &str,
    ) -> SyncResult<Removal>;

    /// Users currently online on a resource
    async fn members(&self, resource: &str) -> SyncResult<Vec<UserId>>;

    /// Resources a user is subscribed to through any connection
    async fn memberships(&self, user: &str) -> SyncResult<Vec<ResourceId>>;

    /// Number of users online on a resource
    async fn cardinality(&self, resource: &str) -> SyncResult<usize>;
}

#[derive(Debug, Default)]
struct PresenceTables {
    /// resource -> user -> live connections
    online: HashMap<ResourceId, HashMap<UserId, HashSet<ConnectionId>>>,
    /// user -> resources
    memberships: HashMap<UserId, HashSet<ResourceId>>,
}

/// In-process presence store guarded by a single mutex
#[derive(Debug, Default)]
pub struct LocalPresenceStore {
    tables: Mutex<PresenceTables>,
}

impl LocalPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for LocalPresenceStore {
    async fn add_member(
        &self,
        resource: &str,
        user: &str,
        connection: &str,
    ) -> SyncResult<usize> {
        let mut tables = self.tables.lock();
        let users = tables.online.entry(resource.to_string()).or_default();
        users
            .entry(user.to_string())
            .or_default()
            .insert(connection.to_string());
        let online = users.len();
        tables
            .memberships
            .entry(user.to_string())
            .or_default()
            .insert(resource.to_string());
        Ok(online)
    }

    async fn remove_member(
        &self,
        resource: &str,
        user: &str,
        connection: &str,
    ) -> SyncResult<Removal> {
        let mut tables = self.tables.lock();
        let PresenceTables {
            online,
            memberships,
        } = &mut *tables;

        let Some(users) = online.get_mut(resource) else {
            return Ok(Removal::NotMember);
        };
        let Some(connections) = users.get_mut(user) else {
            return Ok(Removal::NotMember);
        };
        if !connections.remove(connection) {
            return Ok(Removal::NotMember);
        }

        if !connections.is_empty() {
            return Ok(Removal::ConnectionRemoved {
                online: users.len(),
            });
        }

        users.remove(user);
        let remaining = users.len();
        if remaining == 0 {
            online.remove(resource);
        }
        if let Some(resources) = memberships.get_mut(user) {
            resources.remove(resource);
            if resources.is_empty() {
                memberships.remove(user);
            }
        }
        Ok(Removal::UserRemoved { online: remaining })
    }

    async fn members(&self, resource: &str) -> SyncResult<Vec<UserId>> {
        let tables = self.tables.lock();
        let mut users: Vec<UserId> = tables
            .online
            .get(resource)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        Ok(users)
    }

    async fn memberships(&self, user: &str) -> SyncResult<Vec<ResourceId>> {
        let tables = self.tables.lock();
        Ok(tables
            .memberships
            .get(user)
            .map(|resources| resources.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn cardinality(&self, resource: &str) -> SyncResult<usize> {
        Ok(self
            .tables
            .lock()
            .online
            .get(resource)
            .map(|users| users.len())
            .unwrap_or(0))
    }
}

/// Presence operations used by the gateway
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    /// Display colour per user, stable for the life of the process
    colors: DashMap<UserId, String>,
    timeout: Duration,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self::with_timeout(store, PRESENCE_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn PresenceStore>, timeout: Duration) -> Self {
        Self {
            store,
            colors: DashMap::new(),
            timeout,
        }
    }

    /// Mark a user's connection present, returning the online count
    pub async fn subscribe(
        &self,
        resource: &str,
        user: &str,
        connection: &str,
    ) -> SyncResult<usize> {
        let online = self
            .call("add_member", self.store.add_member(resource, user, connection))
            .await?;
        debug!("{} online on {} ({})", user, resource, online);
        Ok(online)
    }

    /// Drop a user's connection; `online() == Some(0)` signals the last leave
    pub async fn unsubscribe(
        &self,
        resource: &str,
        user: &str,
        connection: &str,
    ) -> SyncResult<Removal> {
        self.call("remove_member", self.store.remove_member(resource, user, connection))
            .await
    }

    pub async fn list_online(&self, resource: &str) -> SyncResult<Vec<UserId>> {
        self.call("members", self.store.members(resource)).await
    }

    pub async fn list_memberships(&self, user: &str) -> SyncResult<Vec<ResourceId>> {
        self.call("memberships", self.store.memberships(user)).await
    }

    pub async fn online_count(&self, resource: &str) -> SyncResult<usize> {
        self.call("cardinality", self.store.cardinality(resource)).await
    }

    pub fn color_for(&self, user: &str) -> String {
        self.colors
            .entry(user.to_string())
            .or_insert_with(generate_peer_color)
            .clone()
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        pending: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Presence {} timed out after {:?}", operation, self.timeout);
                Err(SyncError::Store(format!("{} timed out", operation)))
            }
        }
    }
}

/// Helper to generate a random color for a user
pub fn generate_peer_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#6366f1", // indigo
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
