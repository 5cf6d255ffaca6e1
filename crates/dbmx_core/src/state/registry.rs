//! Registry of known connections.

use std::collections::{BTreeMap, HashMap};

use super::tracker::LoadTracker;
use crate::models::{Connection, ConnectionConfig, ConnectionId};

/// Authoritative set of connections plus their connect/disconnect status.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    tracker: LoadTracker<ConnectionId>,
    /// Bumped every time a connection's active flag flips
    epochs: HashMap<ConnectionId, u64>,
    last_id: i64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a connection with no persistent store behind it.
    pub fn allocate_id(&mut self) -> ConnectionId {
        self.last_id += 1;
        ConnectionId(self.last_id)
    }

    /// Insert or replace a connection.
    pub fn insert(&mut self, connection: Connection) {
        self.last_id = self.last_id.max(connection.id.0);
        self.connections.insert(connection.id, connection);
    }

    /// Remove a connection.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.tracker.forget(&id);
        self.epochs.remove(&id);
        self.connections.remove(&id)
    }

    /// Get a connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Get a connection mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Check if a connection exists and is active.
    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).is_some_and(|c| c.is_active)
    }

    /// Set the active flag. Returns true if it changed.
    ///
    /// A change starts a new epoch for the connection.
    pub fn set_active(&mut self, id: ConnectionId, active: bool) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) if connection.is_active != active => {
                connection.is_active = active;
                *self.epochs.entry(id).or_default() += 1;
                true
            }
            _ => false,
        }
    }

    /// Current epoch of a connection.
    ///
    /// Work started in one epoch belongs to a server link that is gone once
    /// the epoch moves on.
    pub fn epoch(&self, id: ConnectionId) -> u64 {
        self.epochs.get(&id).copied().unwrap_or_default()
    }

    /// All connections in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Ids of active connections.
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.connections.values().filter(|c| c.is_active).map(|c| c.id).collect()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Find another connection with the same name, engine and environment.
    pub fn find_duplicate(
        &self,
        config: &ConnectionConfig,
        exclude: Option<ConnectionId>,
    ) -> Option<ConnectionId> {
        self.connections
            .values()
            .filter(|c| Some(c.id) != exclude)
            .find(|c| {
                c.config.name == config.name
                    && c.config.engine == config.engine
                    && c.config.environment == config.environment
            })
            .map(|c| c.id)
    }

    /// Connect/disconnect status per connection.
    pub fn tracker(&self) -> &LoadTracker<ConnectionId> {
        &self.tracker
    }

    /// Connect/disconnect status per connection, mutably.
    pub fn tracker_mut(&mut self) -> &mut LoadTracker<ConnectionId> {
        &mut self.tracker
    }
}
