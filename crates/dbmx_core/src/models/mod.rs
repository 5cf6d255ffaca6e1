//! Data models for the dbmx session core.
//!
//! - `connection` - Connection, ConnectionConfig, Engine, SslMode, SshConfig
//! - `database` - Database catalog entries
//! - `tab` - Query and table tabs
//! - `query` - Query results and backend payloads

pub mod connection;
pub mod database;
pub mod query;
pub mod tab;

pub use connection::{
    Connection, ConnectionConfig, ConnectionId, Credentials, Engine, SshAuth, SshConfig, SslMode,
};
pub use database::{Database, DatabaseId};
pub use query::{
    Cell, ColumnTable, QueryOutput, QueryResult, QueryType, Row, SchemaPayload, TabContext,
    TableInfo,
};
pub use tab::{build_table_query, Tab, TabId, TabKind, TableFilters};
