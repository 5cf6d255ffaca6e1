//! Session coordinator.
//!
//! Owns the connection registry, the database catalog and the tabs, drives
//! the [`Backend`] and keeps the three consistent while operations on
//! different keys run concurrently.
//!
//! Locks are taken in the order registry, catalog, tabs and never held
//! across an `.await`. Every mutation ends, under the same locks, with a
//! repair pass, a selection recompute and the events it caused.

use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{DbmxError, DbmxResult};
use crate::events::{EventBus, StateEvent};
use crate::models::query::{COLUMN_NAME_COLUMN, TABLE_NAME_COLUMN};
use crate::models::{
    build_table_query, Connection, ConnectionConfig, ConnectionId, Database, DatabaseId,
    QueryResult, QueryType, Tab, TabContext, TabId, TabKind, TableFilters, TableInfo,
};
use crate::services::{Backend, ConnectionStore};
use crate::settings::CoreSettings;
use crate::state::inflight::Ticket;
use crate::state::{
    self, ConnectionRegistry, DatabaseCatalog, InFlight, LoadStatus, PendingGuard, SelectionView,
    TabManager,
};

/// Output of a tab that runs a statement without a database.
pub const NO_DATABASE_MESSAGE: &str = "Connect to a database first";

/// What became of a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Written to the tab
    Applied(QueryResult),
    /// The tab was closed or started a newer run meanwhile
    Discarded,
}

impl QueryOutcome {
    /// The applied result, if any.
    pub fn result(&self) -> Option<&QueryResult> {
        match self {
            Self::Applied(result) => Some(result),
            Self::Discarded => None,
        }
    }
}

/// Write access to all three components during one mutation.
struct Txn<'a> {
    registry: &'a mut ConnectionRegistry,
    catalog: &'a mut DatabaseCatalog,
    tabs: &'a mut TabManager,
    events: Vec<StateEvent>,
}

impl Txn<'_> {
    fn emit(&mut self, event: StateEvent) {
        self.events.push(event);
    }

    fn tabs_changed(&mut self, ids: impl IntoIterator<Item = TabId>) {
        self.events.extend(ids.into_iter().map(StateEvent::TabChanged));
    }

    /// Mark a connection inactive and drop its databases along with every
    /// tab reference to them.
    fn detach_connection(&mut self, id: ConnectionId) {
        if self.registry.set_active(id, false) {
            self.emit(StateEvent::ConnectionStatusChanged(id));
        }
        let removed = self.catalog.remove_connection(id);
        if !removed.is_empty() {
            self.emit(StateEvent::DatabasesChanged(id));
        }
        let affected = self.tabs.clear_database_refs(&removed);
        self.tabs_changed(affected);
    }

    /// Database of the active tab.
    fn current_database(&self) -> Option<Database> {
        self.tabs
            .active()
            .and_then(|tab| tab.active_database_id.as_ref())
            .and_then(|id| self.catalog.get(id))
            .cloned()
    }

    /// Execution context of a tab, or `None` if it has no database.
    fn context(&self, tab_id: TabId) -> DbmxResult<Option<TabContext>> {
        let tab = self.tabs.get(tab_id).ok_or_else(|| DbmxError::not_found("Tab", tab_id))?;
        Ok(tab
            .active_database_id
            .as_ref()
            .and_then(|id| self.catalog.get(id))
            .map(|database| TabContext {
                tab_id,
                connection_id: database.connection_id,
                database_id: database.id.clone(),
                database_name: database.name.clone(),
                pool_id: database.pool_id.clone(),
            }))
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    store: Option<Arc<dyn ConnectionStore>>,
    settings: CoreSettings,
    events: EventBus,
    registry: RwLock<ConnectionRegistry>,
    catalog: RwLock<DatabaseCatalog>,
    tabs: RwLock<TabManager>,
    /// Last published selection
    selection: RwLock<SelectionView>,
    listings: InFlight<(ConnectionId, u64), Vec<String>>,
    schemas: InFlight<(DatabaseId, u64), Database>,
}

impl Inner {
    /// Run `f` with all components write-locked, then repair, recompute the
    /// selection and publish the collected events.
    fn mutate<R>(&self, f: impl FnOnce(&mut Txn<'_>) -> R) -> R {
        let mut registry = self.registry.write();
        let mut catalog = self.catalog.write();
        let mut tabs = self.tabs.write();

        let mut txn = Txn {
            registry: &mut *registry,
            catalog: &mut *catalog,
            tabs: &mut *tabs,
            events: Vec::new(),
        };
        let result = f(&mut txn);
        let mut events = txn.events;

        let report = state::repair(&registry, &mut catalog, &mut tabs);
        for violation in &report.violations {
            tracing::error!(error = %violation, "Repaired inconsistent session state");
        }
        events.extend(report.connections.into_iter().map(StateEvent::DatabasesChanged));
        events.extend(report.tabs.into_iter().map(StateEvent::TabChanged));

        let selection =
            SelectionView::compute(&registry, &catalog, &tabs, &self.settings.placeholder_label);
        let mut current = self.selection.write();
        if *current != selection {
            *current = selection.clone();
            events.push(StateEvent::SelectionChanged(selection));
        }

        self.persist_tabs(&tabs, &events);
        self.events.emit_all(events);
        result
    }

    /// Write changed tabs through to the store. Failures are logged; memory
    /// stays authoritative.
    fn persist_tabs(&self, tabs: &TabManager, events: &[StateEvent]) {
        let Some(store) = &self.store else {
            return;
        };
        for event in events {
            if let StateEvent::TabChanged(id) = event {
                if let Some(tab) = tabs.get(*id) {
                    if let Err(e) = store.save_tab(tab) {
                        tracing::warn!(tab_id = %id, error = %e, "Failed to save tab");
                    }
                }
            }
        }
        if events.contains(&StateEvent::TabsChanged) {
            let open: Vec<TabId> = tabs.tabs().iter().map(|tab| tab.id).collect();
            if let Err(e) = store.sync_tabs(&open, tabs.active_id()) {
                tracing::warn!(error = %e, "Failed to save open tabs");
            }
        }
    }
}

/// Map a list or schema failure onto the catalog error kind, keeping link
/// and login failures as they are.
fn catalog_error(err: DbmxError) -> DbmxError {
    match err {
        DbmxError::CatalogLoad { .. }
        | DbmxError::Connection { .. }
        | DbmxError::Authentication { .. }
        | DbmxError::NotConnected { .. } => err,
        other => DbmxError::catalog_load_with_source(other.to_string(), other),
    }
}

fn table_of(tab: &Tab) -> DbmxResult<&str> {
    match (tab.kind, tab.table.as_deref()) {
        (TabKind::Table, Some(table)) => Ok(table),
        _ => Err(DbmxError::invalid_input(format!("Tab {} does not browse a table", tab.id))),
    }
}

/// Column names of `table` in a loaded database's structure.
fn table_columns(database: &Database, table: &str) -> Vec<String> {
    database
        .structure
        .rows
        .iter()
        .filter(|row| {
            row.iter()
                .any(|cell| cell.column == TABLE_NAME_COLUMN && cell.value == table)
        })
        .filter_map(|row| row.iter().find(|cell| cell.column == COLUMN_NAME_COLUMN))
        .map(|cell| cell.value.clone())
        .collect()
}

/// Coordinates connections, databases and tabs for one client session.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator with no persistent store.
    pub fn new(backend: Arc<dyn Backend>, settings: CoreSettings) -> Self {
        Self::build(backend, None, settings)
    }

    /// Create a coordinator that persists connection changes to `store`.
    pub fn with_store(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ConnectionStore>,
        settings: CoreSettings,
    ) -> Self {
        Self::build(backend, Some(store), settings)
    }

    fn build(
        backend: Arc<dyn Backend>,
        store: Option<Arc<dyn ConnectionStore>>,
        settings: CoreSettings,
    ) -> Self {
        let events = EventBus::new(settings.event_capacity);
        let selection = SelectionView {
            selected_database_label: settings.placeholder_label.clone(),
            ..Default::default()
        };

        tracing::debug!(persistent = store.is_some(), "Session coordinator created");

        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                settings,
                events,
                registry: RwLock::new(ConnectionRegistry::new()),
                catalog: RwLock::new(DatabaseCatalog::new()),
                tabs: RwLock::new(TabManager::new()),
                selection: RwLock::new(selection),
                listings: InFlight::new(),
                schemas: InFlight::new(),
            }),
        }
    }

    // ========== Snapshots ==========

    /// Subscribe to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// Settings the session runs with.
    pub fn settings(&self) -> &CoreSettings {
        &self.inner.settings
    }

    /// All connections, ordered by id.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.read().iter().cloned().collect()
    }

    /// One connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.registry.read().get(id).cloned()
    }

    /// Status of the last connect or disconnect of `id`.
    pub fn connection_status(&self, id: ConnectionId) -> LoadStatus {
        self.inner.registry.read().tracker().status(&id)
    }

    /// Database names of a connection, in backend order.
    pub fn database_names(&self, connection_id: ConnectionId) -> Vec<String> {
        self.inner.catalog.read().database_names(connection_id).to_vec()
    }

    /// Databases of a connection, in backend order.
    pub fn databases(&self, connection_id: ConnectionId) -> Vec<Database> {
        self.inner
            .catalog
            .read()
            .databases_for(connection_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// One database.
    pub fn database(&self, id: &DatabaseId) -> Option<Database> {
        self.inner.catalog.read().get(id).cloned()
    }

    /// Databases of every active connection.
    pub fn active_databases(&self) -> Vec<Database> {
        let registry = self.inner.registry.read();
        let catalog = self.inner.catalog.read();
        registry
            .active_ids()
            .into_iter()
            .flat_map(|id| catalog.databases_for(id))
            .cloned()
            .collect()
    }

    /// Status of the last database-list load of a connection.
    pub fn list_status(&self, connection_id: ConnectionId) -> LoadStatus {
        self.inner.catalog.read().list_tracker().status(&connection_id)
    }

    /// Status of the last schema load of a database.
    pub fn schema_status(&self, id: &DatabaseId) -> LoadStatus {
        self.inner.catalog.read().schema_tracker().status(id)
    }

    /// All tabs in display order.
    pub fn tabs(&self) -> Vec<Tab> {
        self.inner.tabs.read().tabs().to_vec()
    }

    /// One tab.
    pub fn tab(&self, id: TabId) -> Option<Tab> {
        self.inner.tabs.read().get(id).cloned()
    }

    /// The active tab.
    pub fn active_tab(&self) -> Option<Tab> {
        self.inner.tabs.read().active().cloned()
    }

    /// The current selection projection.
    pub fn selection(&self) -> SelectionView {
        self.inner.selection.read().clone()
    }

    // ========== Connections ==========

    /// Create (`id` is `None`) or update a connection.
    ///
    /// The configuration is normalized and validated, duplicates by name,
    /// engine and environment are rejected, and the store is written before
    /// memory. An update keeps the active flag and refreshes the names and
    /// colors shown by databases and tabs.
    pub fn upsert_connection(
        &self,
        id: Option<ConnectionId>,
        config: ConnectionConfig,
    ) -> DbmxResult<ConnectionId> {
        let config = config.normalized();
        config.validate().map_err(DbmxError::invalid_input)?;

        {
            let registry = self.inner.registry.read();
            if let Some(id) = id {
                if !registry.contains(id) {
                    return Err(DbmxError::not_found("Connection", id));
                }
            }
            if registry.find_duplicate(&config, id).is_some() {
                return Err(DbmxError::invalid_input(format!(
                    "A {} connection named '{}' already exists in environment '{}'",
                    config.engine.as_str(),
                    config.name,
                    config.environment
                )));
            }
        }

        let id = match (id, &self.inner.store) {
            (Some(id), Some(store)) => {
                store.update_connection(id, &config)?;
                id
            }
            (Some(id), None) => id,
            (None, Some(store)) => store.insert_connection(&config)?,
            (None, None) => self.inner.registry.write().allocate_id(),
        };

        self.inner.mutate(|txn| {
            match txn.registry.get_mut(id) {
                Some(connection) => {
                    connection.config = config;
                    let connection = connection.clone();
                    for database_id in txn.catalog.refresh_connection(&connection) {
                        if let Some(database) = txn.catalog.get(&database_id).cloned() {
                            let affected = txn.tabs.relabel(&database);
                            txn.tabs_changed(affected);
                        }
                        txn.emit(StateEvent::DatabaseChanged(database_id));
                    }
                }
                None => txn.registry.insert(Connection::new(id, config)),
            }
            txn.emit(StateEvent::ConnectionsChanged);
        });

        tracing::info!(connection_id = %id, "Connection saved");
        Ok(id)
    }

    /// Remove a connection, disconnecting it first if it is active.
    pub async fn remove_connection(&self, id: ConnectionId) -> DbmxResult<()> {
        let active = {
            let registry = self.inner.registry.read();
            let connection = registry.get(id).ok_or_else(|| DbmxError::not_found("Connection", id))?;
            if registry.tracker().is_pending(&id) {
                return Err(DbmxError::in_progress(format!(
                    "Connection '{}' is connecting or disconnecting",
                    connection.name()
                )));
            }
            connection.is_active
        };

        if active {
            self.disconnect(id).await?;
        }
        if let Some(store) = &self.inner.store {
            store.delete_connection(id)?;
        }

        self.inner.mutate(|txn| {
            txn.detach_connection(id);
            txn.registry.remove(id);
            txn.emit(StateEvent::ConnectionsChanged);
        });

        tracing::info!(connection_id = %id, "Connection removed");
        Ok(())
    }

    /// Load saved connections from the store, all inactive.
    ///
    /// Connections already registered are left alone. Returns how many were
    /// added.
    pub fn load_saved_connections(&self) -> DbmxResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let saved = store.load_all_connections()?;

        let loaded = self.inner.mutate(|txn| {
            let mut loaded = 0;
            for mut connection in saved {
                if txn.registry.contains(connection.id) {
                    continue;
                }
                connection.is_active = false;
                txn.registry.insert(connection);
                loaded += 1;
            }
            if loaded > 0 {
                txn.emit(StateEvent::ConnectionsChanged);
            }
            loaded
        });

        tracing::info!(count = loaded, "Loaded saved connections");
        Ok(loaded)
    }

    /// Restore tabs saved by an earlier session.
    ///
    /// Tabs come back unbound and bind again once their database is loaded;
    /// a tab whose database is already loaded is bound right away. At most
    /// one tab stays active. Returns how many were restored.
    pub fn load_saved_tabs(&self) -> DbmxResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let saved = store.load_tabs()?;

        let restored = self.inner.mutate(|txn| {
            let restored = txn.tabs.restore(saved);
            if restored.is_empty() {
                return 0;
            }
            let loaded: Vec<Database> = txn
                .catalog
                .iter()
                .filter(|database| database.is_active)
                .cloned()
                .collect();
            for database in &loaded {
                txn.tabs.bind_loaded(database);
            }
            txn.emit(StateEvent::TabsChanged);
            txn.tabs_changed(restored.iter().copied());
            restored.len()
        });

        tracing::info!(count = restored, "Loaded saved tabs");
        Ok(restored)
    }

    /// Open the server link of a connection, then load its database list
    /// and the schema of its configured database.
    ///
    /// Connecting an active connection is a no-op. A failed list or schema
    /// load is recorded on its status and does not fail the connect.
    pub async fn connect(&self, id: ConnectionId) -> DbmxResult<()> {
        let connection = self.inner.mutate(|txn| {
            let connection = txn
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| DbmxError::not_found("Connection", id))?;
            if txn.registry.tracker().is_pending(&id) {
                return Err(DbmxError::in_progress(format!(
                    "Connection '{}' is connecting or disconnecting",
                    connection.name()
                )));
            }
            if connection.is_active {
                return Ok(None);
            }
            txn.registry.tracker_mut().begin(&id);
            txn.emit(StateEvent::ConnectionStatusChanged(id));
            Ok(Some(connection))
        })?;
        let Some(connection) = connection else {
            tracing::debug!(connection_id = %id, "Already connected");
            return Ok(());
        };

        tracing::debug!(
            connection_id = %id,
            url = %connection.config.display_url(),
            "Connecting"
        );
        let guard = self.guard_connection_op(id);
        let result = self.inner.backend.connect(&connection).await;
        guard.disarm();

        if let Err(err) = result {
            tracing::warn!(connection_id = %id, error = %err, "Connect failed");
            self.inner.mutate(|txn| {
                txn.registry.tracker_mut().fail(&id, err.clone());
                txn.emit(StateEvent::ConnectionStatusChanged(id));
            });
            return Err(err);
        }

        self.inner.mutate(|txn| {
            txn.registry.set_active(id, true);
            txn.registry.tracker_mut().succeed(&id);
            txn.emit(StateEvent::ConnectionStatusChanged(id));
        });
        tracing::info!(connection_id = %id, name = %connection.name(), "Connected");

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.mark_connected(id) {
                tracing::warn!(connection_id = %id, error = %e, "Failed to record connect time");
            }
        }

        match self.list_databases(id).await {
            Ok(names) if names.contains(&connection.config.database) => {
                let database_id = DatabaseId::new(id, &connection.config.database);
                if let Err(err) = self.load_schema(&database_id).await {
                    tracing::warn!(database_id = %database_id, error = %err, "Schema load after connect failed");
                }
            }
            Ok(_) => tracing::debug!(
                connection_id = %id,
                database = %connection.config.database,
                "Configured database is not listed"
            ),
            Err(err) => {
                tracing::warn!(connection_id = %id, error = %err, "Database list after connect failed")
            }
        }
        Ok(())
    }

    /// Close the server link of a connection and drop its databases.
    ///
    /// Disconnecting an inactive connection is a no-op.
    pub async fn disconnect(&self, id: ConnectionId) -> DbmxResult<()> {
        let active = self.inner.mutate(|txn| {
            let connection = txn.registry.get(id).ok_or_else(|| DbmxError::not_found("Connection", id))?;
            if txn.registry.tracker().is_pending(&id) {
                return Err(DbmxError::in_progress(format!(
                    "Connection '{}' is connecting or disconnecting",
                    connection.name()
                )));
            }
            if !connection.is_active {
                return Ok(false);
            }
            txn.registry.tracker_mut().begin(&id);
            txn.emit(StateEvent::ConnectionStatusChanged(id));
            Ok(true)
        })?;
        if !active {
            tracing::debug!(connection_id = %id, "Already disconnected");
            return Ok(());
        }

        tracing::debug!(connection_id = %id, "Disconnecting");
        let guard = self.guard_connection_op(id);
        let result = self.inner.backend.disconnect(id).await;
        guard.disarm();

        match result {
            Ok(()) => {
                self.inner.mutate(|txn| {
                    txn.detach_connection(id);
                    txn.registry.tracker_mut().clear(&id);
                    txn.emit(StateEvent::ConnectionStatusChanged(id));
                });
                tracing::info!(connection_id = %id, "Disconnected");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(connection_id = %id, error = %err, "Disconnect failed");
                self.inner.mutate(|txn| {
                    txn.registry.tracker_mut().fail(&id, err.clone());
                    txn.emit(StateEvent::ConnectionStatusChanged(id));
                });
                Err(err)
            }
        }
    }

    /// React to a server link that dropped on its own.
    ///
    /// Cascades like a disconnect without calling the backend, and records
    /// `error` as the connection status.
    pub fn handle_connection_lost(&self, id: ConnectionId, error: DbmxError) -> DbmxResult<()> {
        self.inner.mutate(|txn| {
            if !txn.registry.contains(id) {
                return Err(DbmxError::not_found("Connection", id));
            }
            tracing::warn!(connection_id = %id, error = %error, "Connection lost");
            txn.detach_connection(id);
            txn.registry.tracker_mut().fail(&id, error);
            txn.emit(StateEvent::ConnectionStatusChanged(id));
            Ok(())
        })
    }

    /// Disconnect every active connection. Failures are logged.
    pub async fn shutdown(&self) {
        let active = self.inner.registry.read().active_ids();
        for id in active {
            if let Err(err) = self.disconnect(id).await {
                tracing::warn!(connection_id = %id, error = %err, "Disconnect during shutdown failed");
            }
        }
        tracing::info!("Session shut down");
    }

    fn guard_connection_op(&self, id: ConnectionId) -> PendingGuard<impl FnOnce()> {
        let inner = Arc::clone(&self.inner);
        PendingGuard::new(move || {
            inner.mutate(|txn| {
                if txn.registry.tracker_mut().abandon(&id) {
                    tracing::debug!(connection_id = %id, "Connection operation abandoned");
                    txn.emit(StateEvent::ConnectionStatusChanged(id));
                }
            })
        })
    }

    // ========== Catalog ==========

    /// Load the database list of an active connection.
    ///
    /// Concurrent calls for the same connection share one backend request,
    /// as long as the connection was not reconnected in between. Databases
    /// that disappeared from the list are dropped along with tab references
    /// to them. On failure the previous list is kept.
    pub async fn list_databases(&self, connection_id: ConnectionId) -> DbmxResult<Vec<String>> {
        let epoch = self.inner.registry.read().epoch(connection_id);
        let key = (connection_id, epoch);
        let op = self.inner.listings.join_or_start(key, |ticket| {
            self.inner.mutate(|txn| {
                let connection = txn
                    .registry
                    .get(connection_id)
                    .ok_or_else(|| DbmxError::not_found("Connection", connection_id))?;
                if !connection.is_active || txn.registry.epoch(connection_id) != epoch {
                    return Err(DbmxError::not_connected(format!(
                        "Connection '{}' is not connected",
                        connection.name()
                    )));
                }
                txn.catalog.list_tracker_mut().begin(&connection_id);
                txn.emit(StateEvent::DatabasesChanged(connection_id));
                Ok(())
            })?;
            let this = self.clone();
            Ok(async move { this.fetch_database_list(key, ticket).await }.boxed())
        })?;
        op.await
    }

    async fn fetch_database_list(
        self,
        key: (ConnectionId, u64),
        ticket: Ticket,
    ) -> DbmxResult<Vec<String>> {
        let (connection_id, epoch) = key;
        let guard = self.guard_listing(key, ticket);
        tracing::debug!(connection_id = %connection_id, epoch, "Listing databases");
        let result = self.inner.backend.list_databases(connection_id).await;
        guard.disarm();

        let outcome = self.inner.mutate(|txn| {
            let connection = match txn.registry.get(connection_id) {
                Some(connection)
                    if connection.is_active && txn.registry.epoch(connection_id) == epoch =>
                {
                    connection.clone()
                }
                _ => {
                    return Err(DbmxError::not_connected(
                        "Connection closed while its databases were listed",
                    ));
                }
            };
            let names = match result {
                Ok(names) => names,
                Err(err) => {
                    let err = catalog_error(err);
                    txn.catalog.list_tracker_mut().fail(&connection_id, err.clone());
                    txn.emit(StateEvent::DatabasesChanged(connection_id));
                    return Err(err);
                }
            };

            let removed = txn.catalog.replace_list(&connection, names);
            let affected = txn.tabs.clear_database_refs(&removed);
            txn.tabs_changed(affected);
            txn.catalog.list_tracker_mut().succeed(&connection_id);
            txn.emit(StateEvent::DatabasesChanged(connection_id));
            Ok(txn.catalog.database_names(connection_id).to_vec())
        });
        self.inner.listings.finish(&key, ticket);

        match &outcome {
            Ok(names) => {
                tracing::debug!(connection_id = %connection_id, count = names.len(), "Listed databases")
            }
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "Database list failed")
            }
        }
        outcome
    }

    fn guard_listing(&self, key: (ConnectionId, u64), ticket: Ticket) -> PendingGuard<impl FnOnce()> {
        let inner = Arc::clone(&self.inner);
        PendingGuard::new(move || {
            let (connection_id, epoch) = key;
            inner.mutate(|txn| {
                if txn.registry.epoch(connection_id) == epoch
                    && txn.catalog.list_tracker_mut().abandon(&connection_id)
                {
                    txn.emit(StateEvent::DatabasesChanged(connection_id));
                }
            });
            inner.listings.finish(&key, ticket);
            tracing::debug!(connection_id = %connection_id, "Database list abandoned");
        })
    }

    /// Open a pool for a database and load its schema.
    ///
    /// Concurrent calls for the same database share one backend request. On
    /// success, tabs waiting for a database are bound to it. Returns the
    /// loaded database.
    pub async fn load_schema(&self, database_id: &DatabaseId) -> DbmxResult<Database> {
        let epoch = {
            let registry = self.inner.registry.read();
            let catalog = self.inner.catalog.read();
            let database = catalog
                .get(database_id)
                .ok_or_else(|| DbmxError::not_found("Database", database_id))?;
            registry.epoch(database.connection_id)
        };
        let key = (database_id.clone(), epoch);
        let op = self.inner.schemas.join_or_start(key.clone(), |ticket| {
            let database = self.inner.mutate(|txn| {
                let database = txn
                    .catalog
                    .get(database_id)
                    .cloned()
                    .ok_or_else(|| DbmxError::not_found("Database", database_id))?;
                if !txn.registry.is_active(database.connection_id)
                    || txn.registry.epoch(database.connection_id) != epoch
                {
                    return Err(DbmxError::not_connected(format!(
                        "Connection of {} is not connected",
                        database.label()
                    )));
                }
                txn.catalog.schema_tracker_mut().begin(database_id);
                txn.emit(StateEvent::DatabaseChanged(database_id.clone()));
                Ok(database)
            })?;
            let this = self.clone();
            Ok(async move { this.fetch_schema(database, key, ticket).await }.boxed())
        })?;
        op.await
    }

    async fn fetch_schema(
        self,
        database: Database,
        key: (DatabaseId, u64),
        ticket: Ticket,
    ) -> DbmxResult<Database> {
        let (id, epoch) = key.clone();
        let guard = self.guard_schema(database.connection_id, key.clone(), ticket);
        tracing::debug!(database_id = %id, epoch, "Loading schema");
        let result = self.inner.backend.load_schema(&database).await.and_then(|payload| {
            payload.validate().map_err(|e| {
                DbmxError::catalog_load(format!("Malformed schema for {}: {e}", database.label()))
            })?;
            Ok(payload)
        });
        guard.disarm();

        let (outcome, orphan) = self.inner.mutate(|txn| {
            let current = txn.registry.is_active(database.connection_id)
                && txn.registry.epoch(database.connection_id) == epoch;
            let orphan = |pool_id: String| Some(Database { pool_id, ..database.clone() });
            match result {
                Ok(payload) if !current => {
                    let err = DbmxError::catalog_load(format!(
                        "{} was disconnected while its schema loaded",
                        database.label()
                    ));
                    (Err(err), orphan(payload.pool_id))
                }
                Err(err) if !current => (Err(catalog_error(err)), None),
                Ok(payload) => {
                    let pool_id = payload.pool_id.clone();
                    if !txn.catalog.apply_schema(&id, payload) {
                        txn.catalog.schema_tracker_mut().clear(&id);
                        let err = DbmxError::catalog_load(format!(
                            "{} was removed while its schema loaded",
                            database.label()
                        ));
                        return (Err(err), orphan(pool_id));
                    }
                    txn.catalog.schema_tracker_mut().succeed(&id);
                    txn.emit(StateEvent::DatabaseChanged(id.clone()));

                    let Some(loaded) = txn.catalog.get(&id).cloned() else {
                        return (Err(DbmxError::internal(format!("{id} vanished after its schema loaded"))), None);
                    };
                    let mut affected = txn.tabs.bind_loaded(&loaded);
                    affected.extend(txn.tabs.relabel(&loaded));
                    affected.sort();
                    affected.dedup();
                    txn.tabs_changed(affected);
                    (Ok(loaded), None)
                }
                Err(err) => {
                    let err = catalog_error(err);
                    txn.catalog.schema_tracker_mut().fail(&id, err.clone());
                    txn.emit(StateEvent::DatabaseChanged(id.clone()));
                    (Err(err), None)
                }
            }
        });
        self.inner.schemas.finish(&key, ticket);

        if let Some(orphan) = orphan {
            if let Err(e) = self.inner.backend.unload_database(&orphan).await {
                tracing::warn!(database_id = %id, error = %e, "Failed to release pool of removed database");
            }
        }
        match &outcome {
            Ok(loaded) => tracing::debug!(
                database_id = %id,
                tables = loaded.tables.len(),
                pool_id = %loaded.pool_id,
                "Schema loaded"
            ),
            Err(err) => tracing::warn!(database_id = %id, error = %err, "Schema load failed"),
        }
        outcome
    }

    fn guard_schema(
        &self,
        connection_id: ConnectionId,
        key: (DatabaseId, u64),
        ticket: Ticket,
    ) -> PendingGuard<impl FnOnce()> {
        let inner = Arc::clone(&self.inner);
        PendingGuard::new(move || {
            let (id, epoch) = &key;
            inner.mutate(|txn| {
                if txn.registry.epoch(connection_id) == *epoch
                    && txn.catalog.schema_tracker_mut().abandon(id)
                {
                    txn.emit(StateEvent::DatabaseChanged(id.clone()));
                }
            });
            inner.schemas.finish(&key, ticket);
            tracing::debug!(database_id = %id, "Schema load abandoned");
        })
    }

    /// Release a database's pool and drop it from the catalog.
    ///
    /// Tabs bound to it become unbound.
    pub async fn unload_database(&self, database_id: &DatabaseId) -> DbmxResult<()> {
        let database = self
            .database(database_id)
            .ok_or_else(|| DbmxError::not_found("Database", database_id))?;

        tracing::debug!(database_id = %database_id, "Unloading database");
        self.inner.backend.unload_database(&database).await?;

        self.inner.mutate(|txn| {
            if let Some(removed) = txn.catalog.remove_database(database_id) {
                let affected = txn.tabs.clear_database_refs(std::slice::from_ref(&removed.id));
                txn.tabs_changed(affected);
                txn.emit(StateEvent::DatabasesChanged(removed.connection_id));
            }
        });
        Ok(())
    }

    // ========== Tabs ==========

    /// Open a query tab and make it active.
    ///
    /// With a database it is bound to that database, which must belong to
    /// `connection_id` if both are given. With only a connection it takes
    /// the active tab's database if that belongs to the connection, else the
    /// connection's first loaded database, else its first database. With
    /// neither it takes the active tab's database.
    pub fn open_tab(
        &self,
        connection_id: Option<ConnectionId>,
        database_id: Option<DatabaseId>,
    ) -> DbmxResult<TabId> {
        let name = self.inner.settings.default_tab_name.clone();
        self.inner.mutate(|txn| {
            let database = match (connection_id, database_id) {
                (connection_id, Some(database_id)) => {
                    let database = txn
                        .catalog
                        .get(&database_id)
                        .ok_or_else(|| DbmxError::not_found("Database", &database_id))?;
                    if let Some(connection_id) = connection_id.filter(|id| *id != database.connection_id) {
                        return Err(DbmxError::invalid_input(format!(
                            "Database {database_id} does not belong to connection {connection_id}"
                        )));
                    }
                    Some(database.clone())
                }
                (Some(connection_id), None) => {
                    if !txn.registry.contains(connection_id) {
                        return Err(DbmxError::not_found("Connection", connection_id));
                    }
                    txn.current_database()
                        .filter(|database| database.connection_id == connection_id)
                        .or_else(|| {
                            let databases = txn.catalog.databases_for(connection_id);
                            databases
                                .iter()
                                .find(|database| database.is_active)
                                .or(databases.first())
                                .map(|database| (*database).clone())
                        })
                }
                (None, None) => txn.current_database(),
            };

            let id = txn.tabs.open(name, TabKind::Query, database.as_ref());
            txn.emit(StateEvent::TabsChanged);
            txn.emit(StateEvent::TabChanged(id));
            tracing::debug!(tab_id = %id, database = ?database.map(|d| d.id), "Opened tab");
            Ok(id)
        })
    }

    /// Open a table-browser tab on `table` of a database and make it active.
    pub fn open_table_tab(&self, database_id: &DatabaseId, table: &str) -> DbmxResult<TabId> {
        let table = table.trim();
        if table.is_empty() {
            return Err(DbmxError::invalid_input("Table name cannot be empty"));
        }

        self.inner.mutate(|txn| {
            let database = txn
                .catalog
                .get(database_id)
                .cloned()
                .ok_or_else(|| DbmxError::not_found("Database", database_id))?;

            let id = txn.tabs.open(table, TabKind::Table, Some(&database));
            let tab = txn.tabs.get_mut(id)?;
            tab.table = Some(table.to_string());
            tab.table_columns_list = table_columns(&database, table);

            txn.emit(StateEvent::TabsChanged);
            txn.emit(StateEvent::TabChanged(id));
            tracing::debug!(tab_id = %id, database_id = %database_id, table, "Opened table tab");
            Ok(id)
        })
    }

    /// Close a tab. Returns the active tab afterwards.
    pub fn close_tab(&self, id: TabId) -> DbmxResult<Option<TabId>> {
        self.inner.mutate(|txn| {
            let active = txn.tabs.close(id)?;
            txn.emit(StateEvent::TabsChanged);
            tracing::debug!(tab_id = %id, active = ?active, "Closed tab");
            Ok(active)
        })
    }

    /// Focus a tab.
    pub fn set_active_tab(&self, id: TabId) -> DbmxResult<()> {
        self.inner.mutate(|txn| {
            if txn.tabs.set_active(id)? {
                txn.emit(StateEvent::TabsChanged);
            }
            Ok(())
        })
    }

    /// Rename a tab.
    pub fn rename_tab(&self, id: TabId, name: &str) -> DbmxResult<()> {
        self.inner.mutate(|txn| {
            txn.tabs.rename(id, name)?;
            txn.emit(StateEvent::TabChanged(id));
            Ok(())
        })
    }

    /// Replace a tab's editor text.
    pub fn update_editor(&self, id: TabId, text: impl Into<String>) -> DbmxResult<()> {
        let text = text.into();
        self.inner.mutate(|txn| {
            txn.tabs.get_mut(id)?.editor_text = text;
            txn.emit(StateEvent::TabChanged(id));
            Ok(())
        })
    }

    /// Replace the filters of a table tab.
    pub fn update_table_filters(&self, id: TabId, filters: TableFilters) -> DbmxResult<()> {
        self.inner.mutate(|txn| {
            let tab = txn.tabs.get_mut(id)?;
            if tab.kind != TabKind::Table {
                return Err(DbmxError::invalid_input(format!("Tab {id} does not browse a table")));
            }
            tab.filters = filters;
            txn.emit(StateEvent::TabChanged(id));
            Ok(())
        })
    }

    // ========== Queries ==========

    /// Run `sql` on a tab's database and write the result to the tab.
    ///
    /// A tab without a database gets a failure result without a backend
    /// call. Only the newest run of a tab may write; a result arriving after
    /// the tab was closed or ran again is discarded.
    pub async fn run_query(&self, tab_id: TabId, sql: &str) -> DbmxResult<QueryOutcome> {
        self.execute_on_tab(tab_id, Ok(sql.to_string())).await
    }

    /// Run the row query of a table tab built from its filters.
    ///
    /// Invalid filters produce a failure result without a backend call.
    pub async fn run_table_query(&self, tab_id: TabId) -> DbmxResult<QueryOutcome> {
        let prepared = {
            let tabs = self.inner.tabs.read();
            let tab = tabs.get(tab_id).ok_or_else(|| DbmxError::not_found("Tab", tab_id))?;
            let table = table_of(tab)?;
            build_table_query(table, &tab.filters, self.inner.settings.table_row_limit)
        };
        self.execute_on_tab(tab_id, prepared).await
    }

    async fn execute_on_tab(
        &self,
        tab_id: TabId,
        prepared: Result<String, String>,
    ) -> DbmxResult<QueryOutcome> {
        let (generation, context) = self.inner.mutate(|txn| {
            let context = txn.context(tab_id)?;
            let generation = txn.tabs.begin_run(tab_id)?;
            txn.emit(StateEvent::TabChanged(tab_id));
            Ok::<_, DbmxError>((generation, context))
        })?;

        let result = match (context, prepared) {
            (_, Err(message)) => QueryResult::failure(message),
            (None, Ok(_)) => QueryResult::failure(NO_DATABASE_MESSAGE),
            (Some(context), Ok(sql)) => {
                tracing::debug!(
                    tab_id = %tab_id,
                    database_id = %context.database_id,
                    query_type = ?QueryType::detect(&sql),
                    generation,
                    "Running query"
                );
                let guard = self.guard_run(tab_id, generation);
                let result = self.inner.backend.run_query(&context, &sql).await;
                guard.disarm();
                match result.validate() {
                    Ok(()) => result,
                    Err(e) => {
                        tracing::warn!(tab_id = %tab_id, error = %e, "Malformed query result");
                        QueryResult::failure(format!("Malformed query result: {e}"))
                    }
                }
            }
        };

        let applied = self.inner.mutate(|txn| {
            let applied = txn.tabs.apply_result(tab_id, generation, &result);
            if applied {
                txn.emit(StateEvent::TabChanged(tab_id));
            }
            applied
        });

        if !applied {
            tracing::warn!(tab_id = %tab_id, generation, "Discarded stale query result");
            return Ok(QueryOutcome::Discarded);
        }
        if !result.ok {
            tracing::warn!(tab_id = %tab_id, message = %result.message, "Query failed");
        }
        Ok(QueryOutcome::Applied(result))
    }

    fn guard_run(&self, tab_id: TabId, generation: u64) -> PendingGuard<impl FnOnce()> {
        let inner = Arc::clone(&self.inner);
        PendingGuard::new(move || {
            inner.mutate(|txn| {
                if txn.tabs.abandon_run(tab_id, generation) {
                    txn.emit(StateEvent::TabChanged(tab_id));
                }
            })
        })
    }

    /// Load structure, indexes and constraints of a table tab's table.
    ///
    /// Returns `None` if the tab was closed or reloaded meanwhile.
    pub async fn load_table_info(&self, tab_id: TabId) -> DbmxResult<Option<TableInfo>> {
        let (generation, context, table) = self.inner.mutate(|txn| {
            let table = {
                let tab = txn.tabs.get(tab_id).ok_or_else(|| DbmxError::not_found("Tab", tab_id))?;
                table_of(tab)?.to_string()
            };
            let context = txn
                .context(tab_id)?
                .ok_or_else(|| DbmxError::not_connected(NO_DATABASE_MESSAGE))?;
            let generation = txn.tabs.begin_info_load(tab_id)?;
            Ok::<_, DbmxError>((generation, context, table))
        })?;

        tracing::debug!(tab_id = %tab_id, table = %table, "Loading table details");
        let result = self.inner.backend.table_info(&context, &table).await.and_then(|info| {
            info.validate()
                .map_err(|e| DbmxError::internal(format!("Malformed table details payload: {e}")))?;
            Ok(info)
        });

        let applied = self.inner.mutate(|txn| {
            let applied = txn.tabs.apply_table_info(tab_id, generation, &result);
            if applied {
                txn.emit(StateEvent::TabChanged(tab_id));
            }
            applied
        });
        if !applied {
            tracing::warn!(tab_id = %tab_id, "Discarded stale table details");
            return Ok(None);
        }
        if let Err(err) = &result {
            tracing::warn!(tab_id = %tab_id, table = %table, error = %err, "Table details load failed");
        }
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, Engine};
    use crate::test_support::MockBackend;

    fn coordinator() -> (SessionCoordinator, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        (SessionCoordinator::new(backend.clone(), CoreSettings::default()), backend)
    }

    fn config(name: &str) -> ConnectionConfig {
        ConnectionConfig::new(Engine::Postgres, name, "localhost", Credentials::new("postgres", "secret"))
    }

    #[test]
    fn test_upsert_rejects_duplicates_and_invalid_configs() {
        let (coordinator, _) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        assert_eq!(id, ConnectionId(1));

        let err = coordinator.upsert_connection(None, config("local")).unwrap_err();
        assert!(matches!(err, DbmxError::InvalidInput { .. }));

        let err = coordinator.upsert_connection(None, config("  ")).unwrap_err();
        assert!(matches!(err, DbmxError::InvalidInput { .. }));

        let err = coordinator.upsert_connection(Some(ConnectionId(9)), config("x")).unwrap_err();
        assert!(matches!(err, DbmxError::NotFound { .. }));
        assert_eq!(coordinator.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_connection_relabels_databases_and_tabs() {
        let (coordinator, _) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();
        let db = DatabaseId::new(id, "postgres");
        let tab = coordinator.open_tab(Some(id), Some(db.clone())).unwrap();
        assert_eq!(coordinator.selection().selected_database_label, "local - postgres");

        coordinator.upsert_connection(Some(id), config("staging")).unwrap();

        assert!(coordinator.connection(id).unwrap().is_active);
        assert_eq!(coordinator.database(&db).unwrap().connection_name, "staging");
        assert_eq!(
            coordinator.tab(tab).unwrap().active_database_name.as_deref(),
            Some("staging - postgres")
        );
        assert_eq!(coordinator.selection().selected_database_label, "staging - postgres");
    }

    #[tokio::test]
    async fn test_open_tab_resolves_binding() {
        let (coordinator, _) = coordinator();
        let one = coordinator.upsert_connection(None, config("one")).unwrap();
        let two = coordinator.upsert_connection(None, config("two")).unwrap();
        coordinator.connect(one).await.unwrap();
        coordinator.connect(two).await.unwrap();

        let err = coordinator
            .open_tab(Some(one), Some(DatabaseId::new(two, "postgres")))
            .unwrap_err();
        assert!(matches!(err, DbmxError::InvalidInput { .. }));

        let err = coordinator.open_tab(None, Some(DatabaseId::from("7:nope"))).unwrap_err();
        assert!(matches!(err, DbmxError::NotFound { .. }));

        let first = coordinator.open_tab(Some(two), None).unwrap();
        assert_eq!(
            coordinator.tab(first).unwrap().active_database_id,
            Some(DatabaseId::new(two, "postgres"))
        );

        let inherited = coordinator.open_tab(None, None).unwrap();
        assert_eq!(
            coordinator.tab(inherited).unwrap().active_database_id,
            Some(DatabaseId::new(two, "postgres"))
        );
        assert_eq!(coordinator.tab(inherited).unwrap().name, "Editor");
    }

    #[tokio::test]
    async fn test_table_tab_query_uses_filters() {
        let (coordinator, backend) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();
        let db = DatabaseId::new(id, "postgres");
        coordinator.load_schema(&db).await.unwrap();

        let tab = coordinator.open_table_tab(&db, "users").unwrap();
        assert_eq!(coordinator.tab(tab).unwrap().table_columns_list, vec!["id", "email"]);

        coordinator
            .update_table_filters(
                tab,
                TableFilters { where_clause: "id > 1".into(), limit: "10".into(), ..Default::default() },
            )
            .unwrap();
        coordinator.run_table_query(tab).await.unwrap();
        assert_eq!(backend.last_sql().as_deref(), Some("SELECT * FROM users WHERE id > 1 LIMIT 10"));

        coordinator
            .update_table_filters(tab, TableFilters { limit: "500".into(), ..Default::default() })
            .unwrap();
        let outcome = coordinator.run_table_query(tab).await.unwrap();
        assert_eq!(outcome.result().unwrap().message, "limit cannot be greater than 100");
        assert_eq!(backend.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_table_info_fills_tab() {
        let (coordinator, _) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();
        let db = DatabaseId::new(id, "postgres");
        coordinator.load_schema(&db).await.unwrap();
        let tab = coordinator.open_table_tab(&db, "users").unwrap();

        let info = coordinator.load_table_info(tab).await.unwrap().unwrap();
        assert_eq!(info.structure.rows.len(), 2);
        let tab = coordinator.tab(tab).unwrap();
        assert!(tab.table_info.is_some());
        assert_eq!(tab.table_columns_list, vec!["id", "email"]);
    }

    #[tokio::test]
    async fn test_query_tab_rejects_table_operations() {
        let (coordinator, _) = coordinator();
        let tab = coordinator.open_tab(None, None).unwrap();
        assert!(matches!(
            coordinator.run_table_query(tab).await,
            Err(DbmxError::InvalidInput { .. })
        ));
        assert!(coordinator.update_table_filters(tab, TableFilters::default()).is_err());
    }

    #[tokio::test]
    async fn test_unload_database_unbinds_tabs() {
        let (coordinator, backend) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();
        let db = DatabaseId::new(id, "postgres");
        coordinator.load_schema(&db).await.unwrap();
        let tab = coordinator.open_tab(None, Some(db.clone())).unwrap();

        coordinator.unload_database(&db).await.unwrap();

        assert!(coordinator.database(&db).is_none());
        assert_eq!(coordinator.database_names(id), vec!["template1"]);
        assert!(coordinator.tab(tab).unwrap().active_database_id.is_none());
        assert_eq!(backend.unload_calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_active_connection_disconnects_first() {
        let (coordinator, backend) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();

        coordinator.remove_connection(id).await.unwrap();

        assert!(coordinator.connections().is_empty());
        assert!(coordinator.databases(id).is_empty());
        assert_eq!(backend.disconnect_calls(), 1);
        assert!(matches!(
            coordinator.remove_connection(id).await,
            Err(DbmxError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_lost_cascades_without_backend_call() {
        let (coordinator, backend) = coordinator();
        let id = coordinator.upsert_connection(None, config("local")).unwrap();
        coordinator.connect(id).await.unwrap();
        let tab = coordinator.open_tab(Some(id), None).unwrap();

        coordinator
            .handle_connection_lost(id, DbmxError::connection("server closed the connection"))
            .unwrap();

        assert!(!coordinator.connection(id).unwrap().is_active);
        assert!(coordinator.databases(id).is_empty());
        assert!(coordinator.tab(tab).unwrap().active_database_id.is_none());
        assert!(coordinator.connection_status(id).error().is_some());
        assert_eq!(backend.disconnect_calls(), 0);
        assert_eq!(coordinator.selection().selected_database_label, "Connect to a database");
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let (coordinator, backend) = coordinator();
        for name in ["a", "b"] {
            let id = coordinator.upsert_connection(None, config(name)).unwrap();
            coordinator.connect(id).await.unwrap();
        }
        coordinator.shutdown().await;
        assert!(coordinator.connections().iter().all(|c| !c.is_active));
        assert_eq!(backend.disconnect_calls(), 2);
        assert!(coordinator.active_databases().is_empty());
    }
}
