//! Database catalog entries exposed by a connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::connection::{Connection, ConnectionId};
use super::query::ColumnTable;

/// Identifier of a database within the catalog: `"{connection_id}:{name}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Compose the id of database `name` on connection `connection_id`.
    pub fn new(connection_id: ConnectionId, name: &str) -> Self {
        Self(format!("{connection_id}:{name}"))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One database exposed by a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    /// Composite identifier
    pub id: DatabaseId,
    /// Owning connection
    pub connection_id: ConnectionId,
    /// Owning connection's display name
    pub connection_name: String,
    /// Database name
    pub name: String,
    /// Accent color inherited from the connection
    pub color: String,
    /// Backend pool identifier, empty until the schema is loaded
    pub pool_id: String,
    /// Set once the schema has been loaded through a live pool
    pub is_active: bool,
    /// Table names, in backend order
    pub tables: Vec<String>,
    /// Column names across all tables, in backend order
    pub columns: Vec<String>,
    /// Raw structure table from the last schema load
    pub structure: ColumnTable,
    /// Raw index table from the last schema load
    pub indexes: ColumnTable,
    /// Raw constraint table from the last schema load
    pub rules: ColumnTable,
}

impl Database {
    /// Create an unloaded entry for `name` on `connection`.
    pub fn unloaded(connection: &Connection, name: &str) -> Self {
        Self {
            id: DatabaseId::new(connection.id, name),
            connection_id: connection.id,
            connection_name: connection.name().to_string(),
            name: name.to_string(),
            color: connection.color().to_string(),
            ..Default::default()
        }
    }

    /// Label shown in the selection bar: `"{connection} - {database}"`.
    pub fn label(&self) -> String {
        format!("{} - {}", self.connection_name, self.name)
    }
}
