//! Room registry: room identifier → connections currently in that room.
//!
//! Shared by every ingress handler and the broadcast loop's eviction path.
//! All access goes through one `RwLock`; fan-out iterates a [`snapshot`]
//! rather than the live map.
//!
//! [`snapshot`]: Registry::snapshot

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};

#[derive(Clone, Default)]
pub struct Registry {
    rooms: Arc<RwLock<HashMap<String, Vec<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `room`.
    ///
    /// Returns `false` (and changes nothing) if it is already a member.
    pub async fn register(&self, room: &str, connection: &Connection) -> bool {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        if members.iter().any(|c| c.id() == connection.id()) {
            return false;
        }
        members.push(connection.clone());
        true
    }

    /// Remove the connection from `room` if present.
    ///
    /// Member order is not preserved. Rooms left empty are dropped.
    pub async fn unregister(&self, room: &str, id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let Some(pos) = members.iter().position(|c| c.id() == id) else {
            return false;
        };
        members.swap_remove(pos);
        if members.is_empty() {
            rooms.remove(room);
        }
        true
    }

    /// Point-in-time copy of the members of `room`.
    pub async fn snapshot(&self, room: &str) -> Vec<Connection> {
        self.rooms
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn contains(&self, room: &str, id: ConnectionId) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|members| members.iter().any(|c| c.id() == id))
    }

    pub async fn connection_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, Vec::len)
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
