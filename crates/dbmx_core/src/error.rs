//! Error types for the dbmx session core.
//!
//! Every failure the coordinator can observe is represented here. Errors are
//! `Clone` so a single terminal result can be handed to every caller attached
//! to a deduplicated load, and so load statuses can keep the last error.

use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable error source.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Main error type for the session core.
#[derive(Debug, Clone, Error)]
pub enum DbmxError {
    /// Connecting to or disconnecting from a server failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<ErrorSource>,
    },

    /// The server rejected the credentials.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Listing databases or loading a database schema failed.
    #[error("Catalog error: {message}")]
    CatalogLoad {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<ErrorSource>,
    },

    /// Engine-reported SQL failure.
    ///
    /// Inside the coordinator this travels as an `ok=false` query result; the
    /// variant exists for backends and for table-info loads.
    #[error("{message}")]
    Query {
        /// Engine error message.
        message: String,
        /// Additional detail from the engine.
        detail: Option<String>,
        /// Engine hint.
        hint: Option<String>,
        /// Engine error code (e.g., "42P01").
        code: Option<String>,
    },

    /// A dangling reference was found between state components.
    #[error("Consistency violation: {message}")]
    ConsistencyViolation {
        /// What was found dangling.
        message: String,
    },

    /// The referenced connection, database or tab does not exist.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Entity kind ("Connection", "Database", "Tab").
        kind: &'static str,
        /// Key that failed to resolve.
        key: String,
    },

    /// Caller supplied an invalid value.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Human-readable error message.
        message: String,
    },

    /// An operation on the same key is already in flight.
    #[error("Operation in progress: {message}")]
    OperationInProgress {
        /// Human-readable error message.
        message: String,
    },

    /// The operation needs an active connection.
    #[error("Not connected: {message}")]
    NotConnected {
        /// Human-readable error message.
        message: String,
    },

    /// Local SQLite storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<ErrorSource>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<ErrorSource>,
    },
}

/// Result alias used throughout the crate.
pub type DbmxResult<T> = Result<T, DbmxError>;

impl DbmxError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a new catalog load error.
    pub fn catalog_load(message: impl Into<String>) -> Self {
        Self::CatalogLoad { message: message.into(), source: None }
    }

    /// Create a new catalog load error with source.
    pub fn catalog_load_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CatalogLoad { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Create a new query error.
    pub fn query(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self::Query { message: message.into(), detail, hint, code }
    }

    /// Create a new consistency violation.
    pub fn consistency_violation(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation { message: message.into() }
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound { kind, key: key.to_string() }
    }

    /// Create a new invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Create a new operation-in-progress error.
    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::OperationInProgress { message: message.into() }
    }

    /// Create a new not-connected error.
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected { message: message.into() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Check if this error means the server link is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::CatalogLoad { .. } => "Catalog",
            Self::Query { .. } => "Query",
            Self::ConsistencyViolation { .. } => "Consistency",
            Self::NotFound { .. } => "Not Found",
            Self::InvalidInput { .. } => "Input",
            Self::OperationInProgress { .. } => "Busy",
            Self::NotConnected { .. } => "Connection",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::CatalogLoad { .. } => Some("Try refreshing the connection"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::ConsistencyViolation { .. } => Some("Please report this issue"),
            Self::NotFound { .. } => None,
            Self::InvalidInput { .. } => None,
            Self::OperationInProgress { .. } => Some("Wait for the current operation to finish"),
            Self::NotConnected { .. } => Some("Connect to the server first"),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Config { .. } => Some("Check the settings file"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { detail, code, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

impl From<tokio_postgres::Error> for DbmxError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let code_str = db_err.code().code();

            return match code_str {
                "28P01" => DbmxError::Authentication {
                    message,
                    hint: Some("Invalid password - check your credentials".to_string()),
                },
                "28000" => DbmxError::Authentication {
                    message,
                    hint: Some("Authentication failed - check username and permissions".to_string()),
                },
                _ if code_str.starts_with("08") => {
                    DbmxError::Connection { message, source: Some(Arc::new(err)) }
                }
                _ => DbmxError::Query { message, detail, hint, code: Some(code_str.to_string()) },
            };
        }

        if err.is_closed() {
            return DbmxError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Arc::new(err)),
            };
        }

        DbmxError::Connection { message: err.to_string(), source: Some(Arc::new(err)) }
    }
}

impl From<deadpool_postgres::PoolError> for DbmxError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(pg) => DbmxError::from(pg),
            other => DbmxError::Connection {
                message: format!("Failed to acquire connection: {other}"),
                source: None,
            },
        }
    }
}

impl From<rusqlite::Error> for DbmxError {
    fn from(err: rusqlite::Error) -> Self {
        DbmxError::Storage {
            message: err.to_string(),
            hint: Some("The local database may be corrupted".to_string()),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<std::io::Error> for DbmxError {
    fn from(err: std::io::Error) -> Self {
        DbmxError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for DbmxError {
    fn from(err: serde_json::Error) -> Self {
        DbmxError::Internal {
            message: format!("Malformed payload: {err}"),
            source: Some(Arc::new(err)),
        }
    }
}
