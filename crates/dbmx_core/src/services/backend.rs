//! The boundary through which the coordinator reaches real databases.

use async_trait::async_trait;

use crate::error::DbmxResult;
use crate::models::{Connection, ConnectionId, Database, QueryResult, SchemaPayload, TabContext, TableInfo};

/// Database connectivity consumed by the session coordinator.
///
/// Implementations own drivers, pools, tunnels and timeouts. The coordinator
/// only sees typed results.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a server-level link for `connection`.
    async fn connect(&self, connection: &Connection) -> DbmxResult<()>;

    /// Close the server-level link and every database pool of `connection_id`.
    async fn disconnect(&self, connection_id: ConnectionId) -> DbmxResult<()>;

    /// Names of the databases visible through the connection, in display order.
    async fn list_databases(&self, connection_id: ConnectionId) -> DbmxResult<Vec<String>>;

    /// Open a pool for `database` and read its schema.
    async fn load_schema(&self, database: &Database) -> DbmxResult<SchemaPayload>;

    /// Read structure, indexes and constraints of one table.
    async fn table_info(&self, context: &TabContext, table: &str) -> DbmxResult<TableInfo>;

    /// Run a statement.
    ///
    /// SQL failures are reported as an `ok = false` result, never as an error.
    async fn run_query(&self, context: &TabContext, sql: &str) -> QueryResult;

    /// Release the pool of a single database.
    ///
    /// When `pool_id` is set only that pool is released; otherwise every
    /// pool opened for the database.
    async fn unload_database(&self, _database: &Database) -> DbmxResult<()> {
        Ok(())
    }
}
