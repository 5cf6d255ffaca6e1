//! Per-connection database catalog.

use std::collections::{HashMap, HashSet};

use super::tracker::LoadTracker;
use crate::models::{Connection, ConnectionId, Database, DatabaseId, SchemaPayload};

/// Database names per connection plus one entry per database.
///
/// The name list of a connection and the entries whose `connection_id` is
/// that connection always have the same membership.
#[derive(Debug, Default)]
pub struct DatabaseCatalog {
    names: HashMap<ConnectionId, Vec<String>>,
    databases: HashMap<DatabaseId, Database>,
    list_tracker: LoadTracker<ConnectionId>,
    schema_tracker: LoadTracker<DatabaseId>,
}

impl DatabaseCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Database names of a connection, in backend order.
    pub fn database_names(&self, connection_id: ConnectionId) -> &[String] {
        self.names.get(&connection_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Databases of a connection, in backend order.
    pub fn databases_for(&self, connection_id: ConnectionId) -> Vec<&Database> {
        self.database_names(connection_id)
            .iter()
            .filter_map(|name| self.databases.get(&DatabaseId::new(connection_id, name)))
            .collect()
    }

    /// Get a database.
    pub fn get(&self, id: &DatabaseId) -> Option<&Database> {
        self.databases.get(id)
    }

    /// Check if a database exists.
    pub fn contains(&self, id: &DatabaseId) -> bool {
        self.databases.contains_key(id)
    }

    /// All databases, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &Database> {
        self.databases.values()
    }

    /// Replace a connection's database list wholesale.
    ///
    /// Entries for names still present are kept as they are; new names get
    /// unloaded entries. Returns the ids that were removed.
    pub fn replace_list(&mut self, connection: &Connection, names: Vec<String>) -> Vec<DatabaseId> {
        let mut seen = HashSet::new();
        let names: Vec<String> = names.into_iter().filter(|name| seen.insert(name.clone())).collect();

        let removed: Vec<DatabaseId> = self
            .database_names(connection.id)
            .iter()
            .filter(|name| !seen.contains(*name))
            .map(|name| DatabaseId::new(connection.id, name))
            .collect();
        for id in &removed {
            self.databases.remove(id);
            self.schema_tracker.forget(id);
        }

        for name in &names {
            self.databases
                .entry(DatabaseId::new(connection.id, name))
                .or_insert_with(|| Database::unloaded(connection, name));
        }
        self.names.insert(connection.id, names);
        removed
    }

    /// Drop every database of a connection. Returns the removed ids.
    ///
    /// List and schema statuses go back to idle even if a load is in
    /// flight; that load belongs to a link that is gone.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Vec<DatabaseId> {
        let removed: Vec<DatabaseId> = self
            .names
            .remove(&connection_id)
            .unwrap_or_default()
            .iter()
            .map(|name| DatabaseId::new(connection_id, name))
            .collect();
        for id in &removed {
            self.databases.remove(id);
            self.schema_tracker.clear(id);
        }
        self.list_tracker.clear(&connection_id);
        removed
    }

    /// Drop one database.
    pub fn remove_database(&mut self, id: &DatabaseId) -> Option<Database> {
        let database = self.databases.remove(id)?;
        if let Some(names) = self.names.get_mut(&database.connection_id) {
            names.retain(|name| name != &database.name);
        }
        self.schema_tracker.forget(id);
        Some(database)
    }

    /// Store a loaded schema on its database. Returns false if the database
    /// no longer exists.
    pub fn apply_schema(&mut self, id: &DatabaseId, payload: SchemaPayload) -> bool {
        let Some(database) = self.databases.get_mut(id) else {
            return false;
        };
        database.tables = payload.tables();
        database.columns = payload.columns();
        database.pool_id = payload.pool_id;
        database.is_active = true;
        database.structure = payload.structure;
        database.indexes = payload.indexes;
        database.rules = payload.rules;
        true
    }

    /// Push a connection's display name and color into its databases.
    /// Returns the ids that changed.
    pub fn refresh_connection(&mut self, connection: &Connection) -> Vec<DatabaseId> {
        let mut changed = Vec::new();
        for name in self.names.get(&connection.id).into_iter().flatten() {
            let id = DatabaseId::new(connection.id, name);
            if let Some(database) = self.databases.get_mut(&id) {
                if database.connection_name != connection.name() || database.color != connection.color() {
                    database.connection_name = connection.name().to_string();
                    database.color = connection.color().to_string();
                    changed.push(id);
                }
            }
        }
        changed
    }

    /// Check that name lists and entries have the same membership.
    pub fn check_lockstep(&self) -> Result<(), String> {
        let listed: usize = self.names.values().map(Vec::len).sum();
        if listed != self.databases.len() {
            return Err(format!(
                "{listed} listed database names but {} database entries",
                self.databases.len()
            ));
        }
        for (connection_id, names) in &self.names {
            for name in names {
                let id = DatabaseId::new(*connection_id, name);
                match self.databases.get(&id) {
                    Some(database) if database.connection_id == *connection_id => {}
                    _ => return Err(format!("listed database {id} has no matching entry")),
                }
            }
        }
        Ok(())
    }

    /// Database-list status per connection.
    pub fn list_tracker(&self) -> &LoadTracker<ConnectionId> {
        &self.list_tracker
    }

    /// Database-list status per connection, mutably.
    pub fn list_tracker_mut(&mut self) -> &mut LoadTracker<ConnectionId> {
        &mut self.list_tracker
    }

    /// Schema-load status per database.
    pub fn schema_tracker(&self) -> &LoadTracker<DatabaseId> {
        &self.schema_tracker
    }

    /// Schema-load status per database, mutably.
    pub fn schema_tracker_mut(&mut self) -> &mut LoadTracker<DatabaseId> {
        &mut self.schema_tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cell, ColumnTable, ConnectionConfig, Credentials, Engine};

    fn connection(id: i64) -> Connection {
        let config = ConnectionConfig::new(Engine::Postgres, "local", "localhost", Credentials::default());
        Connection::new(ConnectionId(id), config)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_replace_list_keeps_entries_in_lockstep() {
        let mut catalog = DatabaseCatalog::new();
        let conn = connection(1);

        let removed = catalog.replace_list(&conn, names(&["postgres", "template1"]));
        assert!(removed.is_empty());
        assert_eq!(catalog.database_names(conn.id), ["postgres", "template1"]);
        assert!(catalog.contains(&DatabaseId::from("1:postgres")));
        assert!(catalog.contains(&DatabaseId::from("1:template1")));

        let removed = catalog.replace_list(&conn, names(&["postgres", "app", "app"]));
        assert_eq!(removed, vec![DatabaseId::from("1:template1")]);
        assert_eq!(catalog.database_names(conn.id), ["postgres", "app"]);
        assert!(!catalog.contains(&DatabaseId::from("1:template1")));
        assert!(catalog.check_lockstep().is_ok());
    }

    #[test]
    fn test_replace_list_preserves_loaded_schema() {
        let mut catalog = DatabaseCatalog::new();
        let conn = connection(1);
        catalog.replace_list(&conn, names(&["postgres"]));

        let payload = SchemaPayload {
            pool_id: "p1".into(),
            structure: ColumnTable::new(
                vec!["table_name".into(), "column_name".into()],
                vec![vec![Cell::new("table_name", "users"), Cell::new("column_name", "id")]],
            ),
            ..Default::default()
        };
        let id = DatabaseId::from("1:postgres");
        assert!(catalog.apply_schema(&id, payload));

        catalog.replace_list(&conn, names(&["postgres", "app"]));
        let db = catalog.get(&id).unwrap();
        assert_eq!(db.tables, vec!["users"]);
        assert_eq!(db.columns, vec!["id"]);
        assert_eq!(db.pool_id, "p1");
        assert!(db.is_active);
    }

    #[test]
    fn test_remove_connection_and_database() {
        let mut catalog = DatabaseCatalog::new();
        catalog.replace_list(&connection(1), names(&["a", "b"]));
        catalog.replace_list(&connection(2), names(&["a"]));

        let removed = catalog.remove_database(&DatabaseId::from("1:a"));
        assert!(removed.is_some());
        assert_eq!(catalog.database_names(ConnectionId(1)), ["b"]);

        let removed = catalog.remove_connection(ConnectionId(1));
        assert_eq!(removed, vec![DatabaseId::from("1:b")]);
        assert!(catalog.database_names(ConnectionId(1)).is_empty());
        assert!(catalog.contains(&DatabaseId::from("2:a")));
        assert!(catalog.check_lockstep().is_ok());
    }

    #[test]
    fn test_remove_connection_settles_inflight_statuses() {
        let mut catalog = DatabaseCatalog::new();
        catalog.replace_list(&connection(1), names(&["a"]));
        let db = DatabaseId::from("1:a");
        catalog.list_tracker_mut().begin(&ConnectionId(1));
        catalog.schema_tracker_mut().begin(&db);

        catalog.remove_connection(ConnectionId(1));

        assert!(!catalog.list_tracker().is_pending(&ConnectionId(1)));
        assert!(!catalog.schema_tracker().is_pending(&db));
    }

    #[test]
    fn test_apply_schema_to_missing_database_is_rejected() {
        let mut catalog = DatabaseCatalog::new();
        assert!(!catalog.apply_schema(&DatabaseId::from("9:x"), SchemaPayload::default()));
    }

    #[test]
    fn test_refresh_connection_updates_name_and_color() {
        let mut catalog = DatabaseCatalog::new();
        let mut conn = connection(1);
        catalog.replace_list(&conn, names(&["postgres"]));

        conn.config.name = "renamed".into();
        conn.config.color = "#000000".into();
        let changed = catalog.refresh_connection(&conn);
        assert_eq!(changed, vec![DatabaseId::from("1:postgres")]);
        assert_eq!(catalog.get(&changed[0]).unwrap().label(), "renamed - postgres");
        assert!(catalog.refresh_connection(&conn).is_empty());
    }
}
