//! Scripted in-memory backend for coordinator tests.
//!
//! Every call has a key (`connect:1`, `list:1`, `schema:1:postgres`,
//! `query:SELECT 1`, `info:users`). A test can hold a call at its key with
//! [`MockBackend::gate`] or make it fail once with [`MockBackend::fail`].
//!
//! Replies are JSON text decoded through [`crate::services::wire`], the way a
//! bridged backend receives them. Pools exist between a successful schema
//! load and the unload or disconnect that releases them; queries and table
//! details against any other pool fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::{DbmxError, DbmxResult};
use crate::models::query::{COLUMN_NAME_COLUMN, TABLE_NAME_COLUMN};
use crate::models::{
    Connection, ConnectionId, Database, DatabaseId, QueryResult, SchemaPayload, TabContext,
    TableInfo,
};
use crate::services::{wire, Backend};

/// Test side of a held call.
pub(crate) struct Gate {
    /// Resolves once the call reached the backend
    pub started: oneshot::Receiver<()>,
    /// Send to let the call finish
    pub release: oneshot::Sender<()>,
}

struct Hold {
    started: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Default)]
pub(crate) struct MockBackend {
    databases: Mutex<HashMap<ConnectionId, Vec<String>>>,
    results: Mutex<HashMap<String, QueryResult>>,
    schema_replies: Mutex<HashMap<DatabaseId, String>>,
    pools: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<String, DbmxError>>,
    holds: Mutex<HashMap<String, Hold>>,
    last_sql: Mutex<Option<String>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    list_calls: AtomicUsize,
    schema_calls: AtomicUsize,
    query_calls: AtomicUsize,
    info_calls: AtomicUsize,
    unload_calls: AtomicUsize,
}

fn literal(sql: &str) -> Option<&str> {
    sql.trim()
        .strip_prefix("SELECT ")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn table(columns: &[&str], rows: &[&[&str]]) -> Value {
    let rows: Vec<Value> = rows
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .zip(columns)
                    .map(|(value, column)| json!({ "column": column, "value": value }))
                    .collect(),
            )
        })
        .collect();
    json!({ "columns": columns, "rows": rows })
}

fn pool_id(database: &Database) -> String {
    format!("pool-{}", database.id)
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names returned by the next list calls for `id`.
    pub fn set_databases(&self, id: ConnectionId, names: &[&str]) {
        self.databases
            .lock()
            .insert(id, names.iter().map(|name| name.to_string()).collect());
    }

    /// Result returned for `sql`.
    pub fn set_result(&self, sql: &str, result: QueryResult) {
        self.results.lock().insert(sql.to_string(), result);
    }

    /// Raw JSON returned by schema loads of `id`.
    pub fn set_schema_reply(&self, id: &DatabaseId, payload: &str) {
        self.schema_replies.lock().insert(id.clone(), payload.to_string());
    }

    /// Whether `pool_id` is open.
    pub fn has_pool(&self, pool_id: &str) -> bool {
        self.pools.lock().contains(pool_id)
    }

    /// Fail the next call at `key`.
    pub fn fail(&self, key: &str, err: DbmxError) {
        self.failures.lock().insert(key.to_string(), err);
    }

    /// Hold the next call at `key` until released.
    pub fn gate(&self, key: &str) -> Gate {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.holds
            .lock()
            .insert(key.to_string(), Hold { started: started_tx, release: release_rx });
        Gate { started: started_rx, release: release_tx }
    }

    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.lock().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    async fn pass(&self, key: &str) -> DbmxResult<()> {
        let hold = self.holds.lock().remove(key);
        if let Some(hold) = hold {
            let _ = hold.started.send(());
            let _ = hold.release.await;
        }
        let failure = self.failures.lock().remove(key);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn connect(&self, connection: &Connection) -> DbmxResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&format!("connect:{}", connection.id)).await
    }

    async fn disconnect(&self, connection_id: ConnectionId) -> DbmxResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&format!("disconnect:{connection_id}")).await?;
        let prefix = format!("pool-{connection_id}:");
        self.pools.lock().retain(|pool| !pool.starts_with(&prefix));
        Ok(())
    }

    async fn list_databases(&self, connection_id: ConnectionId) -> DbmxResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&format!("list:{connection_id}")).await?;
        let names = self.databases.lock().get(&connection_id).cloned();
        let names = names.unwrap_or_else(|| vec!["postgres".to_string(), "template1".to_string()]);
        wire::decode_database_list(&json!(names).to_string())
    }

    async fn load_schema(&self, database: &Database) -> DbmxResult<SchemaPayload> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&format!("schema:{}", database.id)).await?;
        let scripted = self.schema_replies.lock().get(&database.id).cloned();
        let reply = scripted.unwrap_or_else(|| {
            json!({
                "poolId": pool_id(database),
                "structure": table(
                    &[TABLE_NAME_COLUMN, COLUMN_NAME_COLUMN, "data_type"],
                    &[&["users", "id", "integer"], &["users", "email", "text"], &["orders", "id", "integer"]],
                ),
                "indexes": table(&["table_name", "index_name"], &[&["users", "users_pkey"]]),
                "rules": table(&[], &[]),
            })
            .to_string()
        });
        let payload = wire::decode_schema(&reply)?;
        self.pools.lock().insert(payload.pool_id.clone());
        Ok(payload)
    }

    async fn table_info(&self, context: &TabContext, table_name: &str) -> DbmxResult<TableInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&format!("info:{table_name}")).await?;
        if !self.has_pool(&context.pool_id) {
            return Err(DbmxError::not_connected(format!("database {}", context.database_id)));
        }
        let reply = json!({
            "structure": table(&[COLUMN_NAME_COLUMN, "data_type"], &[&["id", "integer"], &["email", "text"]]),
            "indexes": table(&["index_name"], &[&["users_pkey"]]),
            "rules": table(&[], &[]),
        });
        wire::decode_table_info(&reply.to_string())
    }

    async fn run_query(&self, context: &TabContext, sql: &str) -> QueryResult {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sql.lock() = Some(sql.to_string());
        if let Err(err) = self.pass(&format!("query:{sql}")).await {
            return QueryResult::failure(err.to_string());
        }
        if !self.has_pool(&context.pool_id) {
            return QueryResult::failure("pool doesn't exist");
        }

        let scripted = self.results.lock().get(sql).cloned();
        if let Some(result) = scripted {
            return result;
        }
        let reply = match literal(sql) {
            Some(value) => json!({
                "ok": true,
                "columns": ["?column?"],
                "rows": [[{ "column": "?column?", "value": value }]],
                "rowsAffected": 0,
                "message": "",
            }),
            None => json!({ "ok": true, "columns": [], "rows": [], "rowsAffected": 0, "message": "" }),
        };
        wire::decode_query_result(&reply.to_string())
            .unwrap_or_else(|err| QueryResult::failure(err.to_string()))
    }

    async fn unload_database(&self, database: &Database) -> DbmxResult<()> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        let released = match database.pool_id.as_str() {
            "" => pool_id(database),
            pool => pool.to_string(),
        };
        self.pools.lock().remove(&released);
        Ok(())
    }
}
