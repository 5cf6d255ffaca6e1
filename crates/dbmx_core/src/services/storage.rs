//! Persistence of connection configurations and open tabs.
//!
//! The coordinator only reaches storage through the [`ConnectionStore`] hook.
//! [`LocalStorage`] is the SQLite implementation used by the desktop host.
//! Passwords are never written; they live in memory or in an external
//! credential store. Tabs are saved without their live database binding or
//! result rows.
//!
//! # Data Directory Locations
//!
//! - **macOS**: `~/Library/Application Support/dev.dbmx.Dbmx`
//! - **Windows**: `%APPDATA%\dbmx\Dbmx`
//! - **Linux**: `~/.local/share/dbmx`
//! - **Debug builds**: `./dbmx_data` in current directory

use crate::error::{DbmxError, DbmxResult};
use crate::models::{
    Connection, ConnectionConfig, ConnectionId, Credentials, Engine, SshAuth, SshConfig, SslMode,
    Tab, TabId, TabKind, TableFilters,
};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

/// Storage hook invoked by connection upserts and removals.
pub trait ConnectionStore: Send + Sync {
    /// Persist a new connection and return its id.
    fn insert_connection(&self, config: &ConnectionConfig) -> DbmxResult<ConnectionId>;

    /// Overwrite the configuration of an existing connection.
    fn update_connection(&self, id: ConnectionId, config: &ConnectionConfig) -> DbmxResult<()>;

    /// Delete a connection.
    fn delete_connection(&self, id: ConnectionId) -> DbmxResult<()>;

    /// Load every saved connection, inactive.
    fn load_all_connections(&self) -> DbmxResult<Vec<Connection>>;

    /// Record a successful connect.
    fn mark_connected(&self, _id: ConnectionId) -> DbmxResult<()> {
        Ok(())
    }

    /// Insert or overwrite one tab.
    fn save_tab(&self, _tab: &Tab) -> DbmxResult<()> {
        Ok(())
    }

    /// Drop saved tabs that are no longer open and record which one is
    /// active.
    fn sync_tabs(&self, _open: &[TabId], _active: Option<TabId>) -> DbmxResult<()> {
        Ok(())
    }

    /// Load saved tabs in id order, unbound.
    fn load_tabs(&self) -> DbmxResult<Vec<Tab>> {
        Ok(Vec::new())
    }
}

/// Get the default data directory for the application.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./dbmx_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| {
                #[cfg(target_os = "macos")]
                {
                    d.join("dev.dbmx.Dbmx")
                }
                #[cfg(target_os = "windows")]
                {
                    d.join("dbmx").join("Dbmx")
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    d.join("dbmx")
                }
            })
            .unwrap_or_else(|| PathBuf::from("./dbmx_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> DbmxResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(DbmxError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        DbmxError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// SQLite-based connection store.
///
/// Thread-safe via internal Mutex. Uses WAL mode for concurrent reads.
pub struct LocalStorage {
    connection: Mutex<rusqlite::Connection>,
    data_dir: PathBuf,
}

impl LocalStorage {
    /// Open or create storage in the given data directory.
    pub fn open(data_dir: PathBuf) -> DbmxResult<Self> {
        init_data_dir(&data_dir)?;
        let db_path = data_dir.join("dbmx.db");
        Self::open_with_path(db_path, data_dir)
    }

    /// Open storage with a specific database path.
    pub fn open_with_path(db_path: PathBuf, data_dir: PathBuf) -> DbmxResult<Self> {
        let connection = rusqlite::Connection::open(&db_path).map_err(|e| {
            DbmxError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        Self::configure_connection(&connection)?;

        let storage = Self { connection: Mutex::new(connection), data_dir };
        storage.run_migrations()?;

        tracing::info!(path = %db_path.display(), "Local storage opened");
        Ok(storage)
    }

    /// Open an in-memory store.
    pub fn in_memory() -> DbmxResult<Self> {
        let connection = rusqlite::Connection::open_in_memory()?;
        let storage = Self { connection: Mutex::new(connection), data_dir: PathBuf::new() };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn configure_connection(conn: &rusqlite::Connection) -> DbmxResult<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            ",
        )
        .map_err(|e| DbmxError::storage(format!("Failed to configure database: {e}"), None))
    }

    fn run_migrations(&self) -> DbmxResult<()> {
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to create migrations table: {e}"), None))?;

        Self::migrate_schema(&conn)
    }

    fn migrate_schema(conn: &rusqlite::Connection) -> DbmxResult<()> {
        const DOMAIN: &str = "core";

        let current_step: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
                [DOMAIN],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_step < 1 {
            conn.execute_batch(
                "
                -- Saved connections (passwords are never stored)
                CREATE TABLE connections (
                    connection_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    engine TEXT NOT NULL,
                    name TEXT NOT NULL,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    database_name TEXT NOT NULL,
                    username TEXT NOT NULL,
                    environment TEXT NOT NULL DEFAULT '',
                    color TEXT NOT NULL DEFAULT '',
                    is_advanced INTEGER NOT NULL DEFAULT 0,
                    ssl_mode TEXT NOT NULL DEFAULT 'prefer',
                    ssh_host TEXT,
                    ssh_port INTEGER,
                    ssh_username TEXT,
                    ssh_auth_method TEXT,
                    ssh_key_path TEXT,
                    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    last_connected_at TEXT
                ) STRICT;

                CREATE UNIQUE INDEX idx_connections_identity
                    ON connections(name, engine, environment);
                ",
            )
            .map_err(|e| DbmxError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
                [DOMAIN],
            )
            .map_err(|e| DbmxError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 1: initial_schema");
        }

        if current_step < 2 {
            conn.execute_batch(
                "
                -- Open editor and table tabs
                CREATE TABLE tabs (
                    tab_id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    editor_text TEXT NOT NULL DEFAULT '',
                    output_text TEXT NOT NULL DEFAULT '',
                    is_active INTEGER NOT NULL DEFAULT 0,
                    connection_id INTEGER,
                    connection_name TEXT,
                    database_name TEXT,
                    table_name TEXT,
                    select_clause TEXT NOT NULL DEFAULT '',
                    limit_value TEXT NOT NULL DEFAULT '',
                    offset_value TEXT NOT NULL DEFAULT '',
                    where_clause TEXT NOT NULL DEFAULT '',
                    order_by TEXT NOT NULL DEFAULT '',
                    group_by TEXT NOT NULL DEFAULT '',
                    table_columns TEXT NOT NULL DEFAULT '[]',
                    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                ) STRICT;
                ",
            )
            .map_err(|e| DbmxError::storage(format!("Migration 2 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 2, 'tabs')",
                [DOMAIN],
            )
            .map_err(|e| DbmxError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 2: tabs");
        }

        Ok(())
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Load one connection.
    pub fn load_connection(&self, id: ConnectionId) -> DbmxResult<Option<Connection>> {
        let conn = self.connection.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_CONNECTION} WHERE connection_id = ?"),
                [id.0],
                ConnectionRow::read,
            )
            .optional()
            .map_err(|e| DbmxError::storage(format!("Failed to load connection: {e}"), None))?;

        row.map(ConnectionRow::into_connection).transpose()
    }
}

impl ConnectionStore for LocalStorage {
    fn insert_connection(&self, config: &ConnectionConfig) -> DbmxResult<ConnectionId> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();
        let ssh = SshColumns::from(config.ssh.as_ref());

        conn.execute(
            "INSERT INTO connections (
                engine, name, host, port, database_name, username, environment,
                color, is_advanced, ssl_mode,
                ssh_host, ssh_port, ssh_username, ssh_auth_method, ssh_key_path,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                config.engine.as_str(),
                config.name,
                config.host,
                config.port,
                config.database,
                config.credentials.username,
                config.environment,
                config.color,
                config.is_advanced,
                config.ssl_mode.as_str(),
                ssh.host,
                ssh.port,
                ssh.username,
                ssh.auth_method,
                ssh.key_path,
                now,
            ],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to save connection: {e}"), None))?;

        let id = ConnectionId(conn.last_insert_rowid());
        tracing::debug!(connection_id = %id, name = %config.name, "Connection saved");
        Ok(id)
    }

    fn update_connection(&self, id: ConnectionId, config: &ConnectionConfig) -> DbmxResult<()> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();
        let ssh = SshColumns::from(config.ssh.as_ref());

        let updated = conn
            .execute(
                "UPDATE connections SET
                    engine = ?2, name = ?3, host = ?4, port = ?5, database_name = ?6,
                    username = ?7, environment = ?8, color = ?9, is_advanced = ?10,
                    ssl_mode = ?11, ssh_host = ?12, ssh_port = ?13, ssh_username = ?14,
                    ssh_auth_method = ?15, ssh_key_path = ?16, updated_at = ?17
                 WHERE connection_id = ?1",
                params![
                    id.0,
                    config.engine.as_str(),
                    config.name,
                    config.host,
                    config.port,
                    config.database,
                    config.credentials.username,
                    config.environment,
                    config.color,
                    config.is_advanced,
                    config.ssl_mode.as_str(),
                    ssh.host,
                    ssh.port,
                    ssh.username,
                    ssh.auth_method,
                    ssh.key_path,
                    now,
                ],
            )
            .map_err(|e| DbmxError::storage(format!("Failed to update connection: {e}"), None))?;

        if updated == 0 {
            return Err(DbmxError::not_found("Connection", id));
        }
        tracing::debug!(connection_id = %id, name = %config.name, "Connection updated");
        Ok(())
    }

    fn delete_connection(&self, id: ConnectionId) -> DbmxResult<()> {
        let conn = self.connection.lock();

        conn.execute("DELETE FROM connections WHERE connection_id = ?", [id.0])
            .map_err(|e| DbmxError::storage(format!("Failed to delete connection: {e}"), None))?;

        tracing::debug!(connection_id = %id, "Connection deleted");
        Ok(())
    }

    fn load_all_connections(&self) -> DbmxResult<Vec<Connection>> {
        let conn = self.connection.lock();

        let mut stmt = conn
            .prepare(&format!("{SELECT_CONNECTION} ORDER BY connection_id"))
            .map_err(|e| DbmxError::storage(format!("Failed to prepare query: {e}"), None))?;

        let rows = stmt
            .query_map([], ConnectionRow::read)
            .map_err(|e| DbmxError::storage(format!("Failed to query connections: {e}"), None))?;

        let mut connections = Vec::new();
        for row in rows {
            let row = row.map_err(|e| DbmxError::storage(format!("Failed to read row: {e}"), None))?;
            connections.push(row.into_connection()?);
        }
        Ok(connections)
    }

    fn mark_connected(&self, id: ConnectionId) -> DbmxResult<()> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE connections SET last_connected_at = ? WHERE connection_id = ?",
            params![now, id.0],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to update last_connected: {e}"), None))?;

        Ok(())
    }

    fn save_tab(&self, tab: &Tab) -> DbmxResult<()> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();
        let columns = serde_json::to_string(&tab.table_columns_list)
            .map_err(|e| DbmxError::storage(format!("Failed to encode table columns: {e}"), None))?;

        conn.execute(
            "INSERT INTO tabs (
                tab_id, name, kind, editor_text, output_text, is_active,
                connection_id, connection_name, database_name, table_name,
                select_clause, limit_value, offset_value, where_clause, order_by, group_by,
                table_columns, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(tab_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                editor_text = excluded.editor_text,
                output_text = excluded.output_text,
                is_active = excluded.is_active,
                connection_id = excluded.connection_id,
                connection_name = excluded.connection_name,
                database_name = excluded.database_name,
                table_name = excluded.table_name,
                select_clause = excluded.select_clause,
                limit_value = excluded.limit_value,
                offset_value = excluded.offset_value,
                where_clause = excluded.where_clause,
                order_by = excluded.order_by,
                group_by = excluded.group_by,
                table_columns = excluded.table_columns,
                updated_at = excluded.updated_at",
            params![
                tab.id.0,
                tab.name,
                tab.kind.as_str(),
                tab.editor_text,
                tab.output_text,
                tab.is_active,
                tab.bound_connection_id.map(|id| id.0),
                tab.bound_connection_name,
                tab.bound_database_name,
                tab.table,
                tab.filters.select,
                tab.filters.limit,
                tab.filters.offset,
                tab.filters.where_clause,
                tab.filters.order_by,
                tab.filters.group_by,
                columns,
                now,
            ],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to save tab: {e}"), None))?;

        Ok(())
    }

    fn sync_tabs(&self, open: &[TabId], active: Option<TabId>) -> DbmxResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn
            .transaction()
            .map_err(|e| DbmxError::storage(format!("Failed to start transaction: {e}"), None))?;

        let saved: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT tab_id FROM tabs")
                .map_err(|e| DbmxError::storage(format!("Failed to prepare query: {e}"), None))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| DbmxError::storage(format!("Failed to query tabs: {e}"), None))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| DbmxError::storage(format!("Failed to read row: {e}"), None))?
        };
        for id in saved.into_iter().filter(|id| !open.contains(&TabId(*id))) {
            tx.execute("DELETE FROM tabs WHERE tab_id = ?", [id])
                .map_err(|e| DbmxError::storage(format!("Failed to delete tab: {e}"), None))?;
        }

        tx.execute(
            "UPDATE tabs SET is_active = CASE WHEN tab_id = ?1 THEN 1 ELSE 0 END",
            [active.map(|id| id.0)],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to update active tab: {e}"), None))?;

        tx.commit()
            .map_err(|e| DbmxError::storage(format!("Failed to commit tabs: {e}"), None))
    }

    fn load_tabs(&self) -> DbmxResult<Vec<Tab>> {
        let conn = self.connection.lock();

        let mut stmt = conn
            .prepare(&format!("{SELECT_TAB} ORDER BY tab_id"))
            .map_err(|e| DbmxError::storage(format!("Failed to prepare query: {e}"), None))?;

        let rows = stmt
            .query_map([], TabRow::read)
            .map_err(|e| DbmxError::storage(format!("Failed to query tabs: {e}"), None))?;

        let mut tabs = Vec::new();
        for row in rows {
            let row = row.map_err(|e| DbmxError::storage(format!("Failed to read row: {e}"), None))?;
            tabs.push(row.into_tab()?);
        }
        Ok(tabs)
    }
}

const SELECT_TAB: &str = "SELECT tab_id, name, kind, editor_text, output_text, is_active,
        connection_id, connection_name, database_name, table_name,
        select_clause, limit_value, offset_value, where_clause, order_by, group_by,
        table_columns
     FROM tabs";

/// Internal struct for reading tab rows.
struct TabRow {
    id: i64,
    name: String,
    kind: String,
    editor_text: String,
    output_text: String,
    is_active: bool,
    connection_id: Option<i64>,
    connection_name: Option<String>,
    database_name: Option<String>,
    table: Option<String>,
    filters: TableFilters,
    table_columns: String,
}

impl TabRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            editor_text: row.get(3)?,
            output_text: row.get(4)?,
            is_active: row.get(5)?,
            connection_id: row.get(6)?,
            connection_name: row.get(7)?,
            database_name: row.get(8)?,
            table: row.get(9)?,
            filters: TableFilters {
                select: row.get(10)?,
                limit: row.get(11)?,
                offset: row.get(12)?,
                where_clause: row.get(13)?,
                order_by: row.get(14)?,
                group_by: row.get(15)?,
            },
            table_columns: row.get(16)?,
        })
    }

    fn into_tab(self) -> DbmxResult<Tab> {
        let kind = TabKind::parse(&self.kind).ok_or_else(|| {
            DbmxError::storage(format!("Unknown kind '{}' for tab {}", self.kind, self.id), None)
        })?;
        let table_columns_list = serde_json::from_str(&self.table_columns).map_err(|e| {
            DbmxError::storage(format!("Bad table columns for tab {}: {e}", self.id), None)
        })?;

        let mut tab = Tab::new(TabId(self.id), self.name, kind);
        tab.editor_text = self.editor_text;
        tab.output_text = self.output_text;
        tab.is_active = self.is_active;
        tab.bound_connection_id = self.connection_id.map(ConnectionId);
        tab.bound_connection_name = self.connection_name;
        tab.bound_database_name = self.database_name;
        tab.table = self.table;
        tab.filters = self.filters;
        tab.table_columns_list = table_columns_list;
        Ok(tab)
    }
}

const SELECT_CONNECTION: &str = "SELECT connection_id, engine, name, host, port, database_name,
        username, environment, color, is_advanced, ssl_mode,
        ssh_host, ssh_port, ssh_username, ssh_auth_method, ssh_key_path
     FROM connections";

/// SSH settings flattened into nullable columns.
struct SshColumns {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    auth_method: Option<&'static str>,
    key_path: Option<String>,
}

impl From<Option<&SshConfig>> for SshColumns {
    fn from(ssh: Option<&SshConfig>) -> Self {
        Self {
            host: ssh.map(|s| s.host.clone()),
            port: ssh.map(|s| s.port),
            username: ssh.map(|s| s.username.clone()),
            auth_method: ssh.map(|s| s.auth.as_str()),
            key_path: ssh.and_then(|s| match &s.auth {
                SshAuth::Key { key_path } => key_path.as_ref().map(|p| p.display().to_string()),
                SshAuth::Password { .. } => None,
            }),
        }
    }
}

/// Internal struct for reading connection rows.
struct ConnectionRow {
    id: i64,
    engine: String,
    name: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    environment: String,
    color: String,
    is_advanced: bool,
    ssl_mode: String,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    ssh_username: Option<String>,
    ssh_auth_method: Option<String>,
    ssh_key_path: Option<String>,
}

impl ConnectionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            engine: row.get(1)?,
            name: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            database: row.get(5)?,
            username: row.get(6)?,
            environment: row.get(7)?,
            color: row.get(8)?,
            is_advanced: row.get(9)?,
            ssl_mode: row.get(10)?,
            ssh_host: row.get(11)?,
            ssh_port: row.get(12)?,
            ssh_username: row.get(13)?,
            ssh_auth_method: row.get(14)?,
            ssh_key_path: row.get(15)?,
        })
    }

    fn into_connection(self) -> DbmxResult<Connection> {
        let engine = Engine::parse(&self.engine).ok_or_else(|| {
            DbmxError::storage(format!("Unknown engine '{}' for connection {}", self.engine, self.id), None)
        })?;

        let ssh = self.ssh_host.map(|host| SshConfig {
            host,
            port: self.ssh_port.unwrap_or(22),
            username: self.ssh_username.unwrap_or_default(),
            auth: match self.ssh_auth_method.as_deref() {
                Some("key") => SshAuth::Key { key_path: self.ssh_key_path.map(PathBuf::from) },
                _ => SshAuth::default(),
            },
        });

        let config = ConnectionConfig {
            engine,
            host: self.host,
            port: self.port,
            credentials: Credentials { username: self.username, password: String::new() },
            database: self.database,
            name: self.name,
            environment: self.environment,
            color: self.color,
            is_advanced: self.is_advanced,
            ssl_mode: SslMode::parse(&self.ssl_mode),
            ssh,
        };
        Ok(Connection::new(ConnectionId(self.id), config))
    }
}
