//! Room fan-out.
//!
//! A [`Topic`] maps room names to the connections subscribed to them and
//! delivers server events to those connections. Every connection owns one
//! unbounded channel, so publishing never blocks on a slow receiver and the
//! events one sender publishes reach each receiver in publish order.

use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::protocol::ServerEvent;
use super::{ConnectionId, ResourceId};

/// Outbound channel of a single connection
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

pub trait Topic: Send + Sync {
    /// Register a connection's outbound channel
    fn attach(&self, connection: &str, sender: EventSender);

    /// Forget a connection, returning the rooms it was still subscribed to
    fn detach(&self, connection: &str) -> Vec<ResourceId>;

    /// Add a connection to a room; `false` if it was already a member
    fn subscribe(&self, room: &str, connection: &str) -> bool;

    /// Remove a connection from a room; `false` if it was not a member
    fn unsubscribe(&self, room: &str, connection: &str) -> bool;

    /// Deliver to every room member except `exclude`, returning the delivery count
    fn publish(&self, room: &str, event: ServerEvent, exclude: Option<&str>) -> usize;

    /// Deliver to a single connection
    fn send_to(&self, connection: &str, event: ServerEvent) -> bool;

    fn is_subscribed(&self, room: &str, connection: &str) -> bool;

    /// Number of rooms a connection is subscribed to
    fn room_count(&self, connection: &str) -> usize;

    /// Number of rooms with at least one member
    fn room_total(&self) -> usize;
}

/// In-process topic backed by concurrent maps
#[derive(Default)]
pub struct LocalTopic {
    senders: DashMap<ConnectionId, EventSender>,
    rooms: DashMap<ResourceId, HashSet<ConnectionId>>,
    joined: DashMap<ConnectionId, HashSet<ResourceId>>,
}

impl LocalTopic {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Topic for LocalTopic {
    fn attach(&self, connection: &str, sender: EventSender) {
        self.senders.insert(connection.to_string(), sender);
        self.joined.entry(connection.to_string()).or_default();
    }

    fn detach(&self, connection: &str) -> Vec<ResourceId> {
        self.senders.remove(connection);
        let rooms: Vec<ResourceId> = self
            .joined
            .remove(connection)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            self.rooms.remove_if_mut(room, |_, members| {
                members.remove(connection);
                members.is_empty()
            });
        }
        debug!("Connection {} detached from {} rooms", connection, rooms.len());
        rooms
    }

    fn subscribe(&self, room: &str, connection: &str) -> bool {
        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection.to_string());
        self.joined
            .entry(connection.to_string())
            .or_default()
            .insert(room.to_string());
        added
    }

    fn unsubscribe(&self, room: &str, connection: &str) -> bool {
        let mut removed = false;
        self.rooms.remove_if_mut(room, |_, members| {
            removed = members.remove(connection);
            members.is_empty()
        });
        if let Some(mut rooms) = self.joined.get_mut(connection) {
            rooms.remove(room);
        }
        removed
    }

    fn publish(&self, room: &str, event: ServerEvent, exclude: Option<&str>) -> usize {
        let mut delivered = 0;
        for member in self.members(room) {
            if Some(member.as_str()) == exclude {
                continue;
            }
            if self.send_to(&member, event.clone()) {
                delivered += 1;
            }
        }
        trace!("Published to {} members of {}", delivered, room);
        delivered
    }

    fn send_to(&self, connection: &str, event: ServerEvent) -> bool {
        match self.senders.get(connection) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    fn is_subscribed(&self, room: &str, connection: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(connection))
    }

    fn room_count(&self, connection: &str) -> usize {
        self.joined.get(connection).map(|r| r.len()).unwrap_or(0)
    }

    fn room_total(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(room: &str) -> ServerEvent {
        ServerEvent::Subscribed {
            resource_id: room.to_string(),
        }
    }

    #[test]
    fn test_publish_excludes_sender() {
        let topic = LocalTopic::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        topic.attach("a", tx_a);
        topic.attach("b", tx_b);
        topic.subscribe("room", "a");
        topic.subscribe("room", "b");

        assert_eq!(topic.publish("room", joined("room"), Some("a")), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), joined("room"));

        assert_eq!(topic.publish("room", joined("room"), None), 2);
    }

    #[test]
    fn test_per_sender_order() {
        let topic = LocalTopic::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        topic.attach("b", tx);
        topic.subscribe("room", "b");

        for i in 0..10 {
            topic.publish("room", joined(&format!("r{}", i)), Some("a"));
        }
        for i in 0..10 {
            assert_eq!(rx.try_recv().unwrap(), joined(&format!("r{}", i)));
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let topic = LocalTopic::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        topic.attach("a", tx);

        assert!(topic.subscribe("room", "a"));
        assert!(!topic.subscribe("room", "a"));
        assert_eq!(topic.room_count("a"), 1);

        assert!(topic.unsubscribe("room", "a"));
        assert!(!topic.unsubscribe("room", "a"));
        assert!(!topic.is_subscribed("room", "a"));
        assert_eq!(topic.room_total(), 0);
    }

    #[test]
    fn test_detach_returns_rooms() {
        let topic = LocalTopic::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        topic.attach("a", tx);
        topic.subscribe("r1", "a");
        topic.subscribe("r2", "a");

        let mut rooms = topic.detach("a");
        rooms.sort();
        assert_eq!(rooms, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(topic.room_total(), 0);
        assert!(!topic.send_to("a", joined("r1")));
    }
}
