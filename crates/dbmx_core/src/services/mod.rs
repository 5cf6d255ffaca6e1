//! Backend services for the dbmx session core.
//!
//! - `backend` - the Backend trait the coordinator calls through
//! - `postgres` - PostgreSQL backend with deadpool-postgres pools
//! - `storage` - connection store hook and its SQLite implementation
//! - `wire` - strict decoding of JSON backend payloads

pub mod backend;
pub mod postgres;
pub mod storage;
pub mod wire;

pub use backend::Backend;
pub use postgres::{PoolSettings, PostgresBackend};
pub use storage::{ConnectionStore, LocalStorage};
