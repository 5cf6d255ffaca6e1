//! PostgreSQL implementation of the backend boundary.
//!
//! One deadpool-postgres pool per connected server, used for catalog
//! queries, and one pool per loaded database, keyed by a fresh pool id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use parking_lot::RwLock;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use uuid::Uuid;

use super::backend::Backend;
use crate::error::{DbmxError, DbmxResult};
use crate::models::{
    Cell, ColumnTable, Connection, ConnectionConfig, ConnectionId, Database, DatabaseId, Engine,
    QueryResult, QueryType, SchemaPayload, TabContext, TableInfo,
};

const LIST_DATABASES: &str =
    "SELECT datname FROM pg_database WHERE datallowconn ORDER BY datname";

const STRUCTURE: &str = r#"
    SELECT
        table_schema::text AS table_schema,
        table_name::text AS table_name,
        column_name::text AS column_name,
        data_type::text AS data_type,
        is_nullable::text AS is_nullable,
        column_default::text AS column_default
    FROM information_schema.columns
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
    "#;

const INDEXES: &str = r#"
    SELECT
        schemaname::text AS table_schema,
        tablename::text AS table_name,
        indexname::text AS index_name,
        indexdef AS index_definition
    FROM pg_catalog.pg_indexes
    WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
    "#;

const RULES: &str = r#"
    SELECT
        n.nspname::text AS table_schema,
        c.relname::text AS table_name,
        con.conname::text AS constraint_name,
        con.contype::text AS constraint_type,
        pg_catalog.pg_get_constraintdef(con.oid) AS definition
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
    "#;

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum connections per pool
    pub max_size: usize,
    /// How long to wait when a pool is exhausted
    pub wait_timeout: Duration,
    /// How long to wait for a new connection
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            wait_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct ServerLink {
    /// Distinguishes this link from earlier links of the same connection
    link_id: Uuid,
    config: ConnectionConfig,
    pool: Pool,
}

struct DatabasePool {
    connection_id: ConnectionId,
    database_id: DatabaseId,
    pool: Pool,
}

/// Backend talking to PostgreSQL servers.
pub struct PostgresBackend {
    servers: RwLock<HashMap<ConnectionId, ServerLink>>,
    databases: RwLock<HashMap<String, DatabasePool>>,
    settings: PoolSettings,
}

impl Default for PostgresBackend {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

impl PostgresBackend {
    /// Create a backend with no open pools.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            databases: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Number of open database pools.
    pub fn database_pool_count(&self) -> usize {
        self.databases.read().len()
    }

    fn build_pool(&self, config: &ConnectionConfig, database: &str) -> DbmxResult<Pool> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(database);
        pg_config.user(&config.credentials.username);
        pg_config.password(&config.credentials.password);
        pg_config.application_name("dbmx");
        pg_config.connect_timeout(self.settings.connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        Pool::builder(manager)
            .max_size(self.settings.max_size)
            .wait_timeout(Some(self.settings.wait_timeout))
            .create_timeout(Some(self.settings.connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DbmxError::connection(format!("Failed to create pool: {e}")))
    }

    async fn validated_pool(&self, config: &ConnectionConfig, database: &str) -> DbmxResult<Pool> {
        let pool = self.build_pool(config, database)?;
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(pool)
    }

    fn server_pool(&self, connection_id: ConnectionId) -> DbmxResult<Pool> {
        self.servers
            .read()
            .get(&connection_id)
            .map(|link| link.pool.clone())
            .ok_or_else(|| DbmxError::not_connected(format!("connection {connection_id}")))
    }

    fn database_pool(&self, pool_id: &str) -> Option<Pool> {
        self.databases.read().get(pool_id).map(|entry| entry.pool.clone())
    }

    fn close_database_pools(&self, matches: impl Fn(&DatabasePool) -> bool) -> usize {
        let mut databases = self.databases.write();
        let doomed: Vec<String> =
            databases.iter().filter(|(_, entry)| matches(entry)).map(|(id, _)| id.clone()).collect();
        for pool_id in &doomed {
            if let Some(entry) = databases.remove(pool_id) {
                entry.pool.close();
            }
        }
        doomed.len()
    }

    async fn fetch_table(
        pool: &Pool,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbmxResult<ColumnTable> {
        let client = pool.get().await?;
        let statement = client.prepare(sql).await?;
        let columns: Vec<String> =
            statement.columns().iter().map(|column| column.name().to_string()).collect();

        let rows = client.query(&statement, params).await?;
        let rows = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(index, column)| {
                        let value: Option<String> = row.try_get(index).unwrap_or(None);
                        Cell::new(column.clone(), value.unwrap_or_else(|| "NULL".to_string()))
                    })
                    .collect()
            })
            .collect();

        Ok(ColumnTable::new(columns, rows))
    }

    async fn execute(pool: &Pool, sql: &str) -> DbmxResult<QueryResult> {
        let client = pool.get().await?;
        let messages = client.simple_query(sql).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut rows_affected = 0;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(description) => {
                    columns = description.iter().map(|c| c.name().to_string()).collect();
                    rows.clear();
                }
                SimpleQueryMessage::Row(row) => {
                    if columns.is_empty() {
                        columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let cells = columns
                        .iter()
                        .enumerate()
                        .map(|(index, column)| {
                            let value = row.try_get(index).ok().flatten().unwrap_or("NULL");
                            Cell::new(column.clone(), value)
                        })
                        .collect();
                    rows.push(cells);
                }
                SimpleQueryMessage::CommandComplete(count) => {
                    rows_affected = i64::try_from(count).unwrap_or(i64::MAX);
                }
                _ => {}
            }
        }

        if QueryType::detect(sql).is_write() {
            return Ok(QueryResult::affected(rows_affected));
        }
        Ok(QueryResult::rows(columns, rows))
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn connect(&self, connection: &Connection) -> DbmxResult<()> {
        if connection.config.engine != Engine::Postgres {
            return Err(DbmxError::connection(format!(
                "engine not supported: {}",
                connection.config.engine.as_str()
            )));
        }

        let pool = self.validated_pool(&connection.config, &connection.config.database).await?;
        let previous = self
            .servers
            .write()
            .insert(
                connection.id,
                ServerLink { link_id: Uuid::new_v4(), config: connection.config.clone(), pool },
            );
        if let Some(previous) = previous {
            previous.pool.close();
        }

        tracing::info!(
            connection_id = %connection.id,
            host = %connection.config.host,
            database = %connection.config.database,
            "Server pool created"
        );
        Ok(())
    }

    async fn disconnect(&self, connection_id: ConnectionId) -> DbmxResult<()> {
        if let Some(link) = self.servers.write().remove(&connection_id) {
            link.pool.close();
        }
        let closed = self.close_database_pools(|entry| entry.connection_id == connection_id);
        tracing::info!(connection_id = %connection_id, database_pools = closed, "Server pools closed");
        Ok(())
    }

    async fn list_databases(&self, connection_id: ConnectionId) -> DbmxResult<Vec<String>> {
        let pool = self.server_pool(connection_id)?;
        let client = pool.get().await?;
        let rows = client.query(LIST_DATABASES, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(DbmxError::from))
            .collect()
    }

    async fn load_schema(&self, database: &Database) -> DbmxResult<SchemaPayload> {
        let (link_id, config) = self
            .servers
            .read()
            .get(&database.connection_id)
            .map(|link| (link.link_id, link.config.clone()))
            .ok_or_else(|| DbmxError::not_connected(format!("connection {}", database.connection_id)))?;

        let pool = self.validated_pool(&config, &database.name).await?;
        let structure = Self::fetch_table(
            &pool,
            &format!("{STRUCTURE} ORDER BY table_schema, table_name, ordinal_position"),
            &[],
        )
        .await?;
        let indexes =
            Self::fetch_table(&pool, &format!("{INDEXES} ORDER BY schemaname, tablename, indexname"), &[])
                .await?;
        let rules =
            Self::fetch_table(&pool, &format!("{RULES} ORDER BY n.nspname, c.relname, con.conname"), &[])
                .await?;

        // The server link must be the one the load started on, and must stay
        // registered until the pool is.
        let servers = self.servers.read();
        if servers.get(&database.connection_id).map(|link| link.link_id) != Some(link_id) {
            pool.close();
            return Err(DbmxError::not_connected(format!(
                "connection {} closed while {} loaded",
                database.connection_id, database.id
            )));
        }

        let database_id = database.id.clone();
        self.close_database_pools(|entry| entry.database_id == database_id);

        let pool_id = Uuid::new_v4().to_string();
        self.databases.write().insert(
            pool_id.clone(),
            DatabasePool { connection_id: database.connection_id, database_id: database.id.clone(), pool },
        );
        drop(servers);

        tracing::debug!(
            database_id = %database.id,
            pool_id = %pool_id,
            columns = structure.rows.len(),
            "Database pool created"
        );
        Ok(SchemaPayload { pool_id, structure, indexes, rules })
    }

    async fn table_info(&self, context: &TabContext, table: &str) -> DbmxResult<TableInfo> {
        let pool = self
            .database_pool(&context.pool_id)
            .ok_or_else(|| DbmxError::not_connected(format!("database {}", context.database_id)))?;

        let structure =
            Self::fetch_table(&pool, &format!("{STRUCTURE} AND table_name = $1 ORDER BY ordinal_position"), &[&table])
                .await?;
        let indexes =
            Self::fetch_table(&pool, &format!("{INDEXES} AND tablename = $1 ORDER BY indexname"), &[&table]).await?;
        let rules =
            Self::fetch_table(&pool, &format!("{RULES} AND c.relname = $1 ORDER BY con.conname"), &[&table]).await?;

        Ok(TableInfo { structure, indexes, rules })
    }

    async fn run_query(&self, context: &TabContext, sql: &str) -> QueryResult {
        let Some(pool) = self.database_pool(&context.pool_id) else {
            return QueryResult::failure("pool doesn't exist");
        };

        match Self::execute(&pool, sql).await {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(tab_id = %context.tab_id, error = %err, "Query failed");
                QueryResult::failure(err.to_string())
            }
        }
    }

    async fn unload_database(&self, database: &Database) -> DbmxResult<()> {
        if !database.pool_id.is_empty() {
            if let Some(entry) = self.databases.write().remove(&database.pool_id) {
                entry.pool.close();
            }
            return Ok(());
        }
        let database_id = database.id.clone();
        self.close_database_pools(|entry| entry.database_id == database_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, TabId};

    fn context(pool_id: &str) -> TabContext {
        TabContext {
            tab_id: TabId(1),
            connection_id: ConnectionId(1),
            database_id: DatabaseId::from("1:postgres"),
            database_name: "postgres".into(),
            pool_id: pool_id.into(),
        }
    }

    #[tokio::test]
    async fn test_other_engines_are_rejected() {
        let backend = PostgresBackend::default();
        let config = ConnectionConfig::new(Engine::Mysql, "m", "localhost", Credentials::default());
        let err = backend.connect(&Connection::new(ConnectionId(1), config)).await.unwrap_err();
        assert!(err.to_string().contains("engine not supported: mysql"));
    }

    #[tokio::test]
    async fn test_unknown_pool_is_a_failed_result() {
        let backend = PostgresBackend::default();
        let result = backend.run_query(&context("missing"), "SELECT 1").await;
        assert!(!result.ok);
        assert_eq!(result.message, "pool doesn't exist");
    }

    #[tokio::test]
    async fn test_catalog_calls_require_connect() {
        let backend = PostgresBackend::default();
        let err = backend.list_databases(ConnectionId(3)).await.unwrap_err();
        assert!(matches!(err, DbmxError::NotConnected { .. }));
        assert!(backend.disconnect(ConnectionId(3)).await.is_ok());
        assert_eq!(backend.database_pool_count(), 0);
    }

    #[tokio::test]
    async fn test_schema_load_requires_live_link() {
        let backend = PostgresBackend::default();
        let config = ConnectionConfig::new(Engine::Postgres, "p", "localhost", Credentials::default());
        let mut database = Database::unloaded(&Connection::new(ConnectionId(2), config), "postgres");

        let err = backend.load_schema(&database).await.unwrap_err();
        assert!(matches!(err, DbmxError::NotConnected { .. }));

        database.pool_id = "gone".into();
        assert!(backend.unload_database(&database).await.is_ok());
        assert_eq!(backend.database_pool_count(), 0);
    }
}
