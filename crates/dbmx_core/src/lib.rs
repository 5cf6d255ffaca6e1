//! Session core of the dbmx database client.
//!
//! This crate keeps connections, their databases and the open editor tabs
//! consistent while backend operations run concurrently:
//!
//! - **coordinator**: SessionCoordinator, the single entry point for mutations
//! - **state**: registry, catalog, tabs, load trackers and the selection view
//! - **models**: connections, databases, tabs and backend payloads
//! - **services**: the Backend trait, PostgreSQL backend and SQLite store
//! - **events**: change notifications for presentation layers
//! - **error**: Error kinds with user-facing categories and hints
//! - **settings** / **logging**: configuration and structured logging setup

pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod services;
pub mod settings;
pub mod state;

#[cfg(test)]
mod test_support;

pub use coordinator::{QueryOutcome, SessionCoordinator};
pub use error::{DbmxError, DbmxResult, ErrorInfo};
pub use events::StateEvent;
pub use models::{
    Cell, Connection, ConnectionConfig, ConnectionId, Credentials, Database, DatabaseId, Engine,
    QueryResult, SslMode, Tab, TabId, TabKind, TableFilters, TableInfo,
};
pub use services::{Backend, ConnectionStore, LocalStorage, PoolSettings, PostgresBackend};
pub use settings::CoreSettings;
pub use state::{LoadStatus, SelectionView};
